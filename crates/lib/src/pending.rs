//! Pending conversation metadata: the unit tracked by the store and shown to viewers.
//!
//! A conversation is pending when its latest message came from the customer and no
//! staff or bot reply has been observed since.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation awaiting a staff reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConversation {
    /// Vendor-side conversation id (opaque string).
    pub id: String,
    pub customer_name: String,
    /// Team the conversation is assigned to, when the payload carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    pub last_message: String,
    /// Fingerprint of the latest customer message; duplicate deliveries carry the same one.
    pub fingerprint: String,
    /// Time of the latest customer message. Expiry and wait ranking are judged from this.
    pub timestamp: DateTime<Utc>,
}

impl PendingConversation {
    /// Whole minutes the customer has been waiting, clamped at zero.
    pub fn wait_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_minutes().max(0)
    }
}
