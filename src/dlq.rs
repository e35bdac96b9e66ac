//! Dead-letter path — events whose fan-out failed
//!
//! Failed publishes are written to the `rsvp:dlq` stream with the original
//! payload and a reason, for operators (or `replay_dead_letters`) to
//! recover later.

use crate::error::Result;
use crate::provider::{DurableLog, StreamEntry};
use crate::types::{StreamFields, Target};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An event that failed delivery, with context about why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    /// Synthetic DLQ identifier
    pub dlq_id: String,

    pub event_id: String,

    /// Original event JSON
    pub original_event: String,

    pub error_reason: String,

    /// Targets whose write failed; empty when the whole publish failed
    /// before fan-out
    #[serde(default)]
    pub failed_targets: Vec<Target>,

    pub failed_at: DateTime<Utc>,

    pub retry_count: u32,
}

impl DeadLetterEvent {
    /// Create a new dead letter event
    pub fn new(
        event_id: impl Into<String>,
        original_event: impl Into<String>,
        error_reason: impl Into<String>,
        failed_targets: Vec<Target>,
    ) -> Self {
        let failed_at = Utc::now();
        Self {
            dlq_id: format!(
                "dlq_{}_{}",
                failed_at.timestamp_millis(),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            event_id: event_id.into(),
            original_event: original_event.into(),
            error_reason: error_reason.into(),
            failed_targets,
            failed_at,
            retry_count: 0,
        }
    }

    pub fn to_fields(&self) -> Result<StreamFields> {
        Ok(StreamFields::from([
            ("dlq_id".to_string(), self.dlq_id.clone()),
            ("event_id".to_string(), self.event_id.clone()),
            ("original_event".to_string(), self.original_event.clone()),
            ("error_reason".to_string(), self.error_reason.clone()),
            (
                "failed_targets".to_string(),
                serde_json::to_string(&self.failed_targets)?,
            ),
            ("failed_at".to_string(), self.failed_at.to_rfc3339()),
            ("retry_count".to_string(), self.retry_count.to_string()),
        ]))
    }

    /// Decode an entry read back from the DLQ stream
    pub fn from_entry(entry: &StreamEntry) -> Option<Self> {
        let f = &entry.fields;
        Some(Self {
            dlq_id: f.get("dlq_id")?.clone(),
            event_id: f.get("event_id")?.clone(),
            original_event: f.get("original_event")?.clone(),
            error_reason: f.get("error_reason").cloned().unwrap_or_default(),
            failed_targets: f
                .get("failed_targets")
                .and_then(|t| serde_json::from_str(t).ok())
                .unwrap_or_default(),
            failed_at: f
                .get("failed_at")
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))?,
            retry_count: f
                .get("retry_count")
                .and_then(|c| c.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// Trait for dead letter queue handlers
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Record a dead-lettered event
    async fn handle(&self, event: DeadLetterEvent) -> Result<()>;

    /// List recent dead-lettered events, newest first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>>;
}

/// DLQ handler that appends to a stream on the durable log
pub struct LogDlqHandler {
    log: Arc<dyn DurableLog>,
    stream: String,
    retention_limit: u64,
}

impl LogDlqHandler {
    pub fn new(log: Arc<dyn DurableLog>, stream: impl Into<String>, retention_limit: u64) -> Self {
        Self {
            log,
            stream: stream.into(),
            retention_limit,
        }
    }
}

#[async_trait]
impl DlqHandler for LogDlqHandler {
    async fn handle(&self, event: DeadLetterEvent) -> Result<()> {
        tracing::warn!(
            event_id = %event.event_id,
            dlq_id = %event.dlq_id,
            failed_targets = ?event.failed_targets,
            reason = %event.error_reason,
            "Event dead-lettered"
        );

        let fields = event.to_fields()?;
        self.log
            .append(&self.stream, &fields, self.retention_limit)
            .await?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEvent>> {
        let entries = self.log.read_last(&self.stream, limit).await?;
        Ok(entries.iter().filter_map(DeadLetterEvent::from_entry).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryLog;
    use crate::registry::DLQ_STREAM;

    #[test]
    fn test_dead_letter_event_creation() {
        let dle = DeadLetterEvent::new("evt-1", "{}", "stream down", vec![Target::ChatSync]);
        assert!(dle.dlq_id.starts_with("dlq_"));
        assert_eq!(dle.retry_count, 0);
        assert_eq!(dle.failed_targets, vec![Target::ChatSync]);
    }

    #[test]
    fn test_entry_roundtrip() {
        let dle = DeadLetterEvent::new("evt-1", "{\"a\":1}", "boom", vec![Target::Audit]);
        let entry = StreamEntry {
            id: "1-1".into(),
            fields: dle.to_fields().unwrap(),
        };
        assert_eq!(DeadLetterEvent::from_entry(&entry), Some(dle));
    }

    #[test]
    fn test_from_entry_rejects_foreign_fields() {
        let entry = StreamEntry {
            id: "1-1".into(),
            fields: StreamFields::from([("_init".to_string(), "true".to_string())]),
        };
        assert!(DeadLetterEvent::from_entry(&entry).is_none());
    }

    #[tokio::test]
    async fn test_log_handler_handle_and_list() {
        let log = Arc::new(MemoryLog::new());
        let dlq = LogDlqHandler::new(log.clone(), DLQ_STREAM, 3);

        for i in 0..5 {
            let dle = DeadLetterEvent::new(format!("evt-{}", i), "{}", format!("reason {}", i), vec![]);
            dlq.handle(dle).await.unwrap();
        }

        // Retention trims the oldest
        assert_eq!(log.len(DLQ_STREAM).await, 3);
        let list = dlq.list(10).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].error_reason, "reason 4");
        assert_eq!(list[2].error_reason, "reason 2");
    }

    #[tokio::test]
    async fn test_log_handler_propagates_append_failure() {
        let log = Arc::new(MemoryLog::new());
        log.fail_stream(DLQ_STREAM).await;
        let dlq = LogDlqHandler::new(log, DLQ_STREAM, 10);
        let result = dlq
            .handle(DeadLetterEvent::new("evt-1", "{}", "x", vec![]))
            .await;
        assert!(result.is_err());
    }
}
