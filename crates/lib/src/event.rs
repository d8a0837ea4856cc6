//! Webhook event normalizer: vendor payload shapes → typed events.
//!
//! The chat vendor has delivered several payload generations over time: a flat
//! `entity`/`refers` shape, an older nested `data.userChat` shape, and a
//! `userChat` lifecycle event. All of them are accepted; anything that cannot
//! be attributed to a conversation is ignored, never rejected.

use crate::pending::PendingConversation;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Top-level webhook payload. Every field is optional so that unknown payload
/// generations still deserialize and can be classified as ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub entity: Option<Entity>,
    #[serde(default)]
    pub refers: Option<Refers>,
    #[serde(default)]
    pub data: Option<EventData>,
}

/// Flat-shape message or lifecycle entity.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Conversation id for message events. May be a string or a number on the wire.
    #[serde(default)]
    pub chat_id: Option<Value>,
    /// Conversation id for lifecycle events.
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub person_type: Option<String>,
    #[serde(default)]
    pub plain_text: Option<String>,
    /// Epoch milliseconds or an RFC 3339 string, depending on payload generation.
    #[serde(default)]
    pub created_at: Option<Value>,
    #[serde(default)]
    pub state: Option<String>,
}

/// Side records referenced by flat-shape message events.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refers {
    #[serde(default)]
    pub user: Option<ReferredUser>,
    #[serde(default)]
    pub user_chat: Option<ReferredUserChat>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferredUser {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferredUserChat {
    #[serde(default)]
    pub name: Option<String>,
}

/// Nested-shape event body (`data.userChat` generation).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[serde(default)]
    pub user_chat: Option<DataUserChat>,
    #[serde(default)]
    pub message: Option<DataMessage>,
    #[serde(default)]
    pub person_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataUserChat {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub assignee: Option<Assignee>,
    #[serde(default)]
    pub user: Option<DataUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignee {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub teams: Vec<AssigneeTeam>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssigneeTeam {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataUser {
    #[serde(default)]
    pub profile: Option<UserProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    #[serde(default)]
    pub plain_text: Option<String>,
}

/// Placeholder when a customer message carried no text.
const EMPTY_MESSAGE: &str = "(no message)";

/// Fallback when no customer name could be resolved from the payload.
const ANONYMOUS: &str = "anonymous";

/// Outcome of normalizing one webhook delivery.
#[derive(Debug, Clone)]
pub enum NormalizedEvent {
    /// The latest message is from the customer; the conversation is now pending.
    CustomerMessage(PendingConversation),
    /// Staff or bot replied; the conversation is answered.
    StaffReply { conversation_id: String },
    /// The conversation was closed or resolved on the vendor side.
    ConversationClosed { conversation_id: String },
    /// Nothing to track. Ignored deliveries are logged and acknowledged, never errors.
    Ignored { reason: &'static str },
}

/// Stringify an id field that may arrive as a JSON string or number.
fn id_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a timestamp field that may be epoch milliseconds or an RFC 3339 string.
/// Anything else falls back to the receive time.
fn parse_timestamp(value: Option<&Value>, received_at: DateTime<Utc>) -> DateTime<Utc> {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(received_at),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(received_at),
        _ => received_at,
    }
}

/// Hex SHA-256 over conversation id, message text, and the raw timestamp field.
/// A re-delivered event hashes to the same value; a new message with the same
/// text gets a new timestamp and a new fingerprint.
pub fn message_fingerprint(conversation_id: &str, text: &str, raw_timestamp: Option<&Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conversation_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(text.as_bytes());
    hasher.update(b"\n");
    if let Some(ts) = raw_timestamp {
        hasher.update(ts.to_string().as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Classify one webhook delivery. `received_at` is the server receive time,
/// used when the payload carries no usable timestamp.
pub fn normalize(payload: &WebhookPayload, received_at: DateTime<Utc>) -> NormalizedEvent {
    match payload.event_type.as_deref() {
        Some("message") => normalize_message(payload, received_at),
        Some("userChat") => normalize_lifecycle(payload),
        _ => NormalizedEvent::Ignored {
            reason: "unknown event type",
        },
    }
}

fn normalize_message(payload: &WebhookPayload, received_at: DateTime<Utc>) -> NormalizedEvent {
    let entity = payload.entity.as_ref();
    let data = payload.data.as_ref();

    let conversation_id = id_string(entity.and_then(|e| e.chat_id.as_ref()))
        .or_else(|| id_string(data.and_then(|d| d.user_chat.as_ref()).and_then(|c| c.id.as_ref())));
    let Some(conversation_id) = conversation_id else {
        return NormalizedEvent::Ignored {
            reason: "missing conversation id",
        };
    };

    let person_type = entity
        .and_then(|e| e.person_type.as_deref())
        .or_else(|| data.and_then(|d| d.person_type.as_deref()));
    match person_type {
        Some("user") => {}
        Some("manager") | Some("bot") => {
            return NormalizedEvent::StaffReply { conversation_id };
        }
        _ => {
            return NormalizedEvent::Ignored {
                reason: "unknown person type",
            };
        }
    }

    let text = entity
        .and_then(|e| e.plain_text.as_deref())
        .or_else(|| data.and_then(|d| d.message.as_ref()).and_then(|m| m.plain_text.as_deref()))
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(EMPTY_MESSAGE)
        .to_string();

    let raw_timestamp = entity.and_then(|e| e.created_at.as_ref());
    let timestamp = parse_timestamp(raw_timestamp, received_at);
    let fingerprint = message_fingerprint(&conversation_id, &text, raw_timestamp);

    let refers = payload.refers.as_ref();
    let customer_name = refers
        .and_then(|r| r.user.as_ref())
        .and_then(|u| u.name.clone().or_else(|| u.username.clone()))
        .or_else(|| refers.and_then(|r| r.user_chat.as_ref()).and_then(|c| c.name.clone()))
        .or_else(|| {
            data.and_then(|d| d.user_chat.as_ref())
                .and_then(|c| c.user.as_ref())
                .and_then(|u| u.profile.as_ref())
                .and_then(|p| p.name.clone())
        })
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| ANONYMOUS.to_string());

    let team = data
        .and_then(|d| d.user_chat.as_ref())
        .and_then(|c| c.assignee.as_ref())
        .and_then(|a| a.teams.first())
        .and_then(|t| t.name.clone())
        .filter(|t| !t.trim().is_empty());

    NormalizedEvent::CustomerMessage(PendingConversation {
        id: conversation_id,
        customer_name,
        team,
        last_message: text,
        fingerprint,
        timestamp,
    })
}

fn normalize_lifecycle(payload: &WebhookPayload) -> NormalizedEvent {
    let entity = payload.entity.as_ref();
    let Some(conversation_id) = id_string(entity.and_then(|e| e.id.as_ref())) else {
        return NormalizedEvent::Ignored {
            reason: "missing conversation id",
        };
    };
    match entity.and_then(|e| e.state.as_deref()) {
        Some("closed") | Some("resolved") => NormalizedEvent::ConversationClosed { conversation_id },
        _ => NormalizedEvent::Ignored {
            reason: "conversation state not terminal",
        },
    }
}
