//! Publisher and orchestrator counters
//!
//! Owned by whoever builds the publisher/orchestrator and shared by `Arc`,
//! so each test (or each pipeline) gets isolated counts.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Event publisher counters
#[derive(Debug, Default)]
pub struct PublisherMetrics {
    published: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    duplicates_skipped: AtomicU64,
    /// Unix millis of the last successful publish; 0 = never
    last_publish_ms: AtomicI64,
}

impl PublisherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.last_publish_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn duplicates_skipped(&self) -> u64 {
        self.duplicates_skipped.load(Ordering::Relaxed)
    }

    pub fn last_publish_at(&self) -> Option<DateTime<Utc>> {
        match self.last_publish_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Point-in-time copy for health reports
    pub fn snapshot(&self, configured_streams: Vec<String>) -> MetricsSnapshot {
        let published = self.published();
        let failed = self.failed();
        let total = published + failed;
        MetricsSnapshot {
            events_published: published,
            events_failed: failed,
            events_dead_lettered: self.dead_lettered(),
            duplicates_skipped: self.duplicates_skipped(),
            last_publish_time: self.last_publish_at(),
            success_rate: if total > 0 {
                published as f64 / total as f64
            } else {
                0.0
            },
            configured_streams,
        }
    }
}

/// Serializable publisher metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_failed: u64,
    pub events_dead_lettered: u64,
    pub duplicates_skipped: u64,
    pub last_publish_time: Option<DateTime<Utc>>,
    pub success_rate: f64,
    pub configured_streams: Vec<String>,
}

/// Synchronization orchestrator counters
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    operations_processed: AtomicU64,
    duplicate_operations: AtomicU64,
    validation_errors: AtomicU64,
    not_found: AtomicU64,
    concurrent_conflicts: AtomicU64,
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self) {
        self.operations_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_error(&self) {
        self.validation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.concurrent_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OrchestratorSnapshot {
        OrchestratorSnapshot {
            operations_processed: self.operations_processed.load(Ordering::Relaxed),
            duplicate_operations: self.duplicate_operations.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            concurrent_conflicts: self.concurrent_conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Serializable orchestrator metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorSnapshot {
    pub operations_processed: u64,
    pub duplicate_operations: u64,
    pub validation_errors: u64,
    pub not_found: u64,
    pub concurrent_conflicts: u64,
}
