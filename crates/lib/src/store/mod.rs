//! Pending-conversation stores.
//!
//! Store trait plus two backends: in-memory (default) and Redis. Backend
//! selection happens at startup; a configured Redis that cannot be reached
//! falls back to the memory backend with a warning.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::config::{self, StoreBackend, StoreConfig};
use crate::pending::PendingConversation;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

/// Result of an upsert: new entry, refreshed entry, or re-delivered duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Stored fingerprint matches the incoming one; the caller must not re-broadcast.
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] fred::error::Error),
    #[error("encoding pending entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Backend-agnostic pending store. One entry per conversation id.
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Insert or refresh a pending conversation. Returns `Duplicate` when the
    /// stored fingerprint equals the incoming one (webhook re-delivery).
    async fn upsert(&self, conv: PendingConversation) -> Result<UpsertOutcome, StoreError>;

    /// Remove a conversation; returns whether an entry existed.
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;

    /// All pending conversations, longest-waiting first.
    async fn snapshot(&self) -> Result<Vec<PendingConversation>, StoreError>;

    /// Evict entries whose latest customer message is older than the TTL.
    /// Returns the evicted ids; expiry is never an error.
    async fn sweep_expired(&self, ttl: Duration) -> Result<Vec<String>, StoreError>;

    /// Number of pending conversations.
    async fn len(&self) -> Result<usize, StoreError>;

    /// Backend name for health reporting ("memory" or "redis").
    fn backend(&self) -> &'static str;
}

/// Build the configured store backend. When Redis is selected but unreachable,
/// logs a warning and runs with process-local state instead of refusing to start.
pub async fn build_store(store_config: &StoreConfig) -> Arc<dyn PendingStore> {
    match store_config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis => {
            let url = config::resolve_redis_url(store_config);
            match RedisStore::connect(&url, store_config.ttl()).await {
                Ok(store) => {
                    log::info!("connected to redis at {}", url);
                    Arc::new(store)
                }
                Err(e) => {
                    log::warn!("redis unavailable ({}), falling back to memory store", e);
                    Arc::new(MemoryStore::new())
                }
            }
        }
    }
}
