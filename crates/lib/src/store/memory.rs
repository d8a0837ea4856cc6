//! In-memory pending store (default backend).

use super::{PendingStore, StoreError, UpsertOutcome};
use crate::pending::PendingConversation;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory store: conversation id -> pending entry.
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, PendingConversation>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl PendingStore for MemoryStore {
    async fn upsert(&self, conv: PendingConversation) -> Result<UpsertOutcome, StoreError> {
        let mut g = self.inner.write().await;
        let outcome = match g.get(&conv.id) {
            Some(existing) if existing.fingerprint == conv.fingerprint => {
                return Ok(UpsertOutcome::Duplicate);
            }
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };
        g.insert(conv.id.clone(), conv);
        Ok(outcome)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.remove(id).is_some())
    }

    async fn snapshot(&self) -> Result<Vec<PendingConversation>, StoreError> {
        let g = self.inner.read().await;
        let mut out: Vec<PendingConversation> = g.values().cloned().collect();
        // oldest message first = longest wait first
        out.sort_by_key(|c| c.timestamp);
        Ok(out)
    }

    async fn sweep_expired(&self, ttl: Duration) -> Result<Vec<String>, StoreError> {
        let cutoff = Utc::now() - ttl;
        let mut g = self.inner.write().await;
        let expired: Vec<String> = g
            .values()
            .filter(|c| c.timestamp < cutoff)
            .map(|c| c.id.clone())
            .collect();
        for id in &expired {
            g.remove(id);
        }
        Ok(expired)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().await.len())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
