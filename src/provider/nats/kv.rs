//! Dedup store on a JetStream key/value bucket
//!
//! Bucket `max_age` is bucket-wide, so each value is stored with its own
//! expiry and checked on read.

use super::client::storage_type;
use super::config::NatsConfig;
use crate::dedup::DedupStore;
use crate::error::{Result, SyncError};
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct KvRecord {
    value: String,
    expires_at_ms: i64,
}

/// `DedupStore` backed by a JetStream key/value bucket
pub struct NatsDedupStore {
    store: jetstream::kv::Store,
}

impl NatsDedupStore {
    /// Open the configured bucket, creating it if missing
    pub async fn open(js: &jetstream::Context, config: &NatsConfig) -> Result<Self> {
        let store = match js.get_key_value(&config.dedup_bucket).await {
            Ok(store) => store,
            Err(_) => js
                .create_key_value(jetstream::kv::Config {
                    bucket: config.dedup_bucket.clone(),
                    history: 1,
                    max_age: Duration::from_secs(config.dedup_max_age_secs),
                    storage: storage_type(config.storage),
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    SyncError::Store(format!(
                        "Failed to create key/value bucket '{}': {}",
                        config.dedup_bucket, e
                    ))
                })?,
        };

        tracing::info!(bucket = %config.dedup_bucket, "Dedup bucket ready");
        Ok(Self { store })
    }

    async fn record(&self, key: &str) -> Result<Option<KvRecord>> {
        let raw = self
            .store
            .get(kv_key(key))
            .await
            .map_err(|e| SyncError::Store(format!("Failed to read key '{}': {}", key, e)))?;

        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DedupStore for NatsDedupStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = chrono::Utc::now().timestamp_millis();
        Ok(self
            .record(key)
            .await?
            .filter(|r| r.expires_at_ms > now)
            .map(|r| r.value))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let record = KvRecord {
            value: value.to_string(),
            expires_at_ms: chrono::Utc::now().timestamp_millis().saturating_add(ttl_ms),
        };
        let bytes = Bytes::from(serde_json::to_vec(&record)?);

        self.store
            .put(kv_key(key), bytes)
            .await
            .map_err(|e| SyncError::Store(format!("Failed to write key '{}': {}", key, e)))?;
        Ok(())
    }
}

/// Map a dedup key onto the KV key alphabet (`published:evt-1` → `published.evt-1`)
fn kv_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            ':' => '.',
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '=' | '.') => c,
            _ => '_',
        })
        .collect()
}
