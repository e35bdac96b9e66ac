//! Durable log trait — the core abstraction for stream backends
//!
//! All backends (NATS JetStream, in-memory) implement `DurableLog` to give
//! the publisher a uniform append / consumer-group / read-back API modelled
//! on Redis Streams.

use crate::error::Result;
use crate::types::StreamFields;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod nats;

/// An entry read back from a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Backend-assigned entry id
    pub id: String,

    pub fields: StreamFields,
}

/// Outcome of creating a consumer group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// Core trait for durable log backends
///
/// Implementations must make a single `append` atomic. Nothing here
/// promises atomicity across streams; the publisher treats each target
/// write as independent.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append an entry, trimming the stream to `retention_limit` entries.
    /// Creates the stream if needed. Returns the entry id.
    async fn append(
        &self,
        stream: &str,
        fields: &StreamFields,
        retention_limit: u64,
    ) -> Result<String>;

    /// Ensure a stream exists
    async fn ensure_stream(&self, stream: &str, retention_limit: u64) -> Result<()>;

    /// Create a consumer group; an existing group is not an error
    async fn create_consumer_group(&self, stream: &str, group: &str) -> Result<GroupCreation>;

    /// Read up to `count` most recent entries, newest first
    async fn read_last(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>>;

    /// Connectivity check
    async fn ping(&self) -> Result<()>;

    /// Backend name (e.g., "nats", "memory")
    fn name(&self) -> &str;
}
