//! Deduplication store — short-lived "already done" markers
//!
//! A TTL key/value contract. The publisher marks `published:<event_id>`
//! after a successful fan-out; the orchestrator keeps completed operation
//! results under `rsvp:operation:<operation_id>`. Implementations provide
//! their own concurrency safety.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Key marking an event as published
pub fn published_key(event_id: &str) -> String {
    format!("published:{}", event_id)
}

/// Key holding a completed operation's result
pub fn operation_key(operation_id: &str) -> String {
    format!("rsvp:operation:{}", operation_id)
}

/// TTL key/value store used for deduplication and operation replay
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Whether an unexpired value exists for `key`
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Fetch an unexpired value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, expiring after `ttl`
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

/// In-memory store for tests and single-process deployments
///
/// Expired keys are dropped lazily when read and swept on write.
#[derive(Default)]
pub struct MemoryDedupStore {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|(_, exp)| *exp > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }
}
