//! Redis-backed pending store.
//!
//! One JSON value per conversation under `pending:{id}` with a server-side TTL,
//! plus an index set `pending_index` for enumeration. Index members whose value
//! has already expired are pruned on read and reported as evicted by the sweep,
//! so entries disappear even if the process was down when the TTL fired.

use super::{PendingStore, StoreError, UpsertOutcome};
use crate::pending::PendingConversation;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use fred::prelude::*;

const INDEX_KEY: &str = "pending_index";

/// Redis key for one pending conversation.
fn conversation_key(id: &str) -> String {
    format!("pending:{id}")
}

/// Pending store on a Redis server (fred client).
pub struct RedisStore {
    client: Client,
    ttl_secs: i64,
}

impl RedisStore {
    /// Connect and wait for the connection to come up.
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, StoreError> {
        let config = Config::from_url(url)?;
        let client = Client::new(config, None, None, None);
        client.connect();
        client.wait_for_connect().await?;
        Ok(Self {
            client,
            ttl_secs: ttl.num_seconds().max(1),
        })
    }

    async fn read_entry(&self, id: &str) -> Result<Option<PendingConversation>, StoreError> {
        let value: Option<String> = self.client.get(conversation_key(id)).await?;
        Ok(value.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// Drop an index member whose value is gone or unreadable.
    async fn prune(&self, id: &str) -> Result<(), StoreError> {
        let _: () = self.client.del(conversation_key(id)).await?;
        let _: () = self.client.srem(INDEX_KEY, id).await?;
        Ok(())
    }
}

#[async_trait]
impl PendingStore for RedisStore {
    async fn upsert(&self, conv: PendingConversation) -> Result<UpsertOutcome, StoreError> {
        let outcome = match self.read_entry(&conv.id).await? {
            Some(existing) if existing.fingerprint == conv.fingerprint => {
                return Ok(UpsertOutcome::Duplicate);
            }
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };
        let json = serde_json::to_string(&conv)?;
        let _: () = self
            .client
            .set(
                conversation_key(&conv.id),
                json,
                Some(Expiration::EX(self.ttl_secs)),
                None,
                false,
            )
            .await?;
        let _: () = self.client.sadd(INDEX_KEY, conv.id.as_str()).await?;
        Ok(outcome)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let removed: i64 = self.client.del(conversation_key(id)).await?;
        let _: () = self.client.srem(INDEX_KEY, id).await?;
        Ok(removed > 0)
    }

    async fn snapshot(&self) -> Result<Vec<PendingConversation>, StoreError> {
        let ids: Vec<String> = self.client.smembers(INDEX_KEY).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read_entry(&id).await? {
                Some(conv) => out.push(conv),
                None => self.prune(&id).await?,
            }
        }
        out.sort_by_key(|c| c.timestamp);
        Ok(out)
    }

    async fn sweep_expired(&self, ttl: Duration) -> Result<Vec<String>, StoreError> {
        let cutoff = Utc::now() - ttl;
        let ids: Vec<String> = self.client.smembers(INDEX_KEY).await?;
        let mut evicted = Vec::new();
        for id in ids {
            let expired = match self.read_entry(&id).await? {
                Some(conv) => conv.timestamp < cutoff,
                // value already gone: server-side TTL fired, only the index entry remains
                None => true,
            };
            if expired {
                self.prune(&id).await?;
                evicted.push(id);
            }
        }
        Ok(evicted)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self.client.scard(INDEX_KEY).await?;
        Ok(count.max(0) as usize)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
