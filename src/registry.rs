//! Stream registry — the static map of durable streams
//!
//! Loaded once at startup and never mutated, so it is shared as
//! `Arc<StreamRegistry>` and read without locks.

use crate::error::{Result, SyncError};
use crate::types::Target;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dead-letter stream name
pub const DLQ_STREAM: &str = "rsvp:dlq";

/// Operator sync-request stream name
pub const SYNC_STREAM: &str = "rsvp:sync";

/// One durable stream and the consumer groups entitled to read it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub name: String,

    /// Maximum entries kept; older entries are trimmed on append
    pub retention_limit: u64,

    #[serde(default)]
    pub consumer_groups: Vec<String>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, retention_limit: u64, groups: &[&str]) -> Self {
        Self {
            name: name.into(),
            retention_limit,
            consumer_groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }
}

/// Read-only stream registry
#[derive(Debug, Clone)]
pub struct StreamRegistry {
    streams: Vec<StreamConfig>,
    index: HashMap<String, usize>,
}

impl StreamRegistry {
    /// Build a registry, rejecting duplicates, zero retention, and
    /// registries that lack a stream every publisher path needs.
    pub fn new(streams: Vec<StreamConfig>) -> Result<Self> {
        let mut index = HashMap::with_capacity(streams.len());
        for (i, stream) in streams.iter().enumerate() {
            if stream.name.is_empty() {
                return Err(SyncError::Config("stream name must not be empty".into()));
            }
            if stream.retention_limit == 0 {
                return Err(SyncError::Config(format!(
                    "stream '{}' has zero retention",
                    stream.name
                )));
            }
            if index.insert(stream.name.clone(), i).is_some() {
                return Err(SyncError::Config(format!(
                    "stream '{}' is configured twice",
                    stream.name
                )));
            }
        }

        let required = Target::ALL
            .iter()
            .map(|t| t.stream_name())
            .chain([DLQ_STREAM, SYNC_STREAM]);
        for name in required {
            if !index.contains_key(name) {
                return Err(SyncError::Config(format!(
                    "required stream '{}' is missing",
                    name
                )));
            }
        }

        Ok(Self { streams, index })
    }

    /// Stream settings for the standard deployment
    pub fn default_streams() -> Vec<StreamConfig> {
        vec![
            StreamConfig::new("rsvp:websocket", 10_000, &["websocket_broadcasters"]),
            StreamConfig::new(
                "rsvp:discord",
                10_000,
                &["discord_embed_updaters", "discord_reaction_updaters"],
            ),
            StreamConfig::new("rsvp:analytics", 50_000, &["analytics_processors"]),
            StreamConfig::new("rsvp:audit", 100_000, &["audit_processors"]),
            StreamConfig::new(DLQ_STREAM, 10_000, &["dlq_processors"]),
            StreamConfig::new(SYNC_STREAM, 1_000, &["sync_processors"]),
        ]
    }

    pub fn get(&self, name: &str) -> Option<&StreamConfig> {
        self.index.get(name).map(|&i| &self.streams[i])
    }

    /// Retention for a stream, if registered
    pub fn retention(&self, name: &str) -> Option<u64> {
        self.get(name).map(|s| s.retention_limit)
    }

    pub fn stream_for(&self, target: Target) -> Option<&StreamConfig> {
        self.get(target.stream_name())
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamConfig> {
        self.streams.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.streams.iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        let streams = Self::default_streams();
        let index = streams
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        Self { streams, index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_covers_targets() {
        let registry = StreamRegistry::default();
        assert_eq!(registry.len(), 6);
        for target in Target::ALL {
            assert!(registry.stream_for(target).is_some());
        }
        assert_eq!(registry.retention("rsvp:audit"), Some(100_000));
        assert_eq!(registry.retention(SYNC_STREAM), Some(1_000));
        assert_eq!(
            registry.get("rsvp:discord").unwrap().consumer_groups,
            vec!["discord_embed_updaters", "discord_reaction_updaters"]
        );
    }

    #[test]
    fn test_default_streams_validate() {
        let registry = StreamRegistry::new(StreamRegistry::default_streams()).unwrap();
        assert_eq!(registry.names(), StreamRegistry::default().names());
    }

    #[test]
    fn test_rejects_duplicate_stream() {
        let mut streams = StreamRegistry::default_streams();
        streams.push(StreamConfig::new("rsvp:audit", 5, &[]));
        assert!(matches!(StreamRegistry::new(streams), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_retention() {
        let mut streams = StreamRegistry::default_streams();
        streams[0].retention_limit = 0;
        assert!(matches!(StreamRegistry::new(streams), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_rejects_missing_dlq() {
        let streams = StreamRegistry::default_streams()
            .into_iter()
            .filter(|s| s.name != DLQ_STREAM)
            .collect();
        let err = StreamRegistry::new(streams).unwrap_err();
        assert!(err.to_string().contains(DLQ_STREAM));
    }

    #[test]
    fn test_unknown_stream() {
        let registry = StreamRegistry::default();
        assert!(registry.get("rsvp:nope").is_none());
        assert!(registry.retention("rsvp:nope").is_none());
    }
}
