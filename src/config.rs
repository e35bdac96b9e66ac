//! Pipeline configuration
//!
//! All structs deserialize from camelCase JSON and fall back to defaults
//! for omitted fields.

use crate::error::{Result, SyncError};
use crate::registry::{StreamConfig, StreamRegistry};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Durable streams and their consumer groups
    pub streams: Vec<StreamConfig>,
    pub publisher: PublisherConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            streams: StreamRegistry::default_streams(),
            publisher: PublisherConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SyncError::Config(format!("Failed to parse pipeline config: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json)
    }

    /// Validate the stream list and build the registry
    pub fn registry(&self) -> Result<StreamRegistry> {
        StreamRegistry::new(self.streams.clone())
    }
}

/// Event publisher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublisherConfig {
    /// Per-target append timeout
    pub write_timeout_ms: u64,

    /// Events per bulk-publish chunk
    pub bulk_batch_size: usize,

    /// How long a "published" marker suppresses republishing
    pub dedup_ttl_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 3_000,
            bulk_batch_size: 100,
            dedup_ttl_secs: 3_600,
        }
    }
}

impl PublisherConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}

/// Synchronization orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// How long a completed operation's result is replayable
    pub operation_ttl_secs: u64,

    /// Maximum items in one bulk update
    pub bulk_limit: usize,

    /// Per-dependency limit for health probes
    pub health_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            operation_ttl_secs: 86_400,
            bulk_limit: 50,
            health_timeout_ms: 3_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn operation_ttl(&self) -> Duration {
        Duration::from_secs(self.operation_ttl_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.publisher.write_timeout(), Duration::from_secs(3));
        assert_eq!(config.publisher.bulk_batch_size, 100);
        assert_eq!(config.publisher.dedup_ttl(), Duration::from_secs(3600));
        assert_eq!(config.orchestrator.bulk_limit, 50);
        assert_eq!(config.orchestrator.health_timeout(), Duration::from_secs(3));
        assert_eq!(config.registry().unwrap().len(), 6);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{"publisher": {"writeTimeoutMs": 500}, "orchestrator": {"bulkLimit": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.publisher.write_timeout_ms, 500);
        assert_eq!(config.publisher.bulk_batch_size, 100);
        assert_eq!(config.orchestrator.bulk_limit, 10);
        assert_eq!(config.orchestrator.operation_ttl_secs, 86_400);
        assert_eq!(config.streams.len(), 6);
    }

    #[test]
    fn test_invalid_json() {
        let err = PipelineConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_custom_streams_must_be_complete() {
        let config = PipelineConfig::from_json_str(
            r#"{"streams": [{"name": "rsvp:audit", "retentionLimit": 10}]}"#,
        )
        .unwrap();
        assert!(config.registry().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let err = PipelineConfig::from_file("/nonexistent/rsvp-sync.json").unwrap_err();
        assert!(err.to_string().contains("rsvp-sync.json"));
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("rsvp-sync-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pipeline.json");

        let mut config = PipelineConfig::default();
        config.publisher.bulk_batch_size = 25;
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.publisher.bulk_batch_size, 25);
        assert!(loaded.registry().is_ok());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
