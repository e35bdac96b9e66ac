//! NATS JetStream durable log
//!
//! Implements `DurableLog` on NATS JetStream: one stream per logical
//! stream, durable pull consumers as consumer groups, and a key/value
//! bucket for deduplication.

mod client;
mod config;
mod kv;

pub use client::NatsClient;
pub use config::{NatsConfig, StorageType};
pub use kv::NatsDedupStore;

use crate::error::Result;
use crate::provider::{DurableLog, GroupCreation, StreamEntry};
use crate::types::StreamFields;
use async_trait::async_trait;

/// NATS JetStream durable log
///
/// Wraps `NatsClient` and implements the `DurableLog` trait.
pub struct NatsLog {
    client: NatsClient,
}

impl NatsLog {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Open the dedup bucket on this connection
    pub async fn dedup_store(&self) -> Result<NatsDedupStore> {
        NatsDedupStore::open(self.client.jetstream_context(), self.client.config()).await
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl DurableLog for NatsLog {
    async fn append(
        &self,
        stream: &str,
        fields: &StreamFields,
        retention_limit: u64,
    ) -> Result<String> {
        self.client.append(stream, fields, retention_limit).await
    }

    async fn ensure_stream(&self, stream: &str, retention_limit: u64) -> Result<()> {
        self.client.ensure_stream(stream, retention_limit).await
    }

    async fn create_consumer_group(&self, stream: &str, group: &str) -> Result<GroupCreation> {
        self.client.create_consumer_group(stream, group).await
    }

    async fn read_last(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        self.client.read_last(stream, count).await
    }

    async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }

    fn name(&self) -> &str {
        "nats"
    }
}
