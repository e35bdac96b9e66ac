//! Event publisher — deduplicated fan-out with a dead-letter fallback
//!
//! `EventPublisher` resolves an event's target streams, writes to each
//! target concurrently with a per-write timeout, marks the event as
//! published, and dead-letters whatever failed. Publish failures never
//! surface as errors: callers get a boolean (or a [`PublishReport`]) and the
//! failure lands in the DLQ and the metrics.
//!
//! Partial fan-out counts as success. The targets that failed are
//! dead-lettered individually, so a slow chat-sync stream never holds up
//! audit or analytics.

use crate::config::PublisherConfig;
use crate::dedup::{published_key, DedupStore};
use crate::dlq::{DeadLetterEvent, DlqHandler, LogDlqHandler};
use crate::error::{Result, SyncError};
use crate::metrics::{MetricsSnapshot, PublisherMetrics};
use crate::provider::{DurableLog, GroupCreation};
use crate::registry::{StreamRegistry, DLQ_STREAM, SYNC_STREAM};
use crate::types::{RsvpEvent, RsvpSyncEvent, StreamFields, Target, TargetSet};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Per-event outcome of a publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: String,

    /// Already published; nothing was written
    pub duplicate: bool,

    /// Entry id per target that accepted the write
    pub delivered: BTreeMap<Target, String>,

    /// Failure reason per target that did not
    pub failed: BTreeMap<Target, String>,

    /// Failure before any target was attempted (e.g. encoding)
    pub error: Option<String>,

    pub dead_lettered: bool,
}

impl PublishReport {
    fn new(event_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            ..Default::default()
        }
    }

    /// Duplicate, or at least one target accepted the event
    pub fn is_success(&self) -> bool {
        if self.duplicate {
            return true;
        }
        self.error.is_none() && (self.failed.is_empty() || !self.delivered.is_empty())
    }

    pub fn is_partial(&self) -> bool {
        !self.delivered.is_empty() && !self.failed.is_empty()
    }
}

/// Counts from a bulk publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkPublishResult {
    pub published: usize,
    pub failed: usize,
    pub duplicates: usize,
}

/// Outcome of the startup routine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub streams: usize,
    pub groups_created: usize,
    pub groups_existing: usize,
}

/// Outcome of a dead-letter replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
    /// Entries whose original event could not be decoded
    pub skipped: usize,
}

/// Overall health of the publishing path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Health endpoint body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub log_connected: bool,
    pub streams_accessible: BTreeMap<String, bool>,
    pub metrics: MetricsSnapshot,
}

/// Publishes RSVP events to their target streams
pub struct EventPublisher {
    log: Arc<dyn DurableLog>,
    dedup: Arc<dyn DedupStore>,
    dlq: Arc<dyn DlqHandler>,
    registry: Arc<StreamRegistry>,
    metrics: Arc<PublisherMetrics>,
    config: PublisherConfig,
}

impl EventPublisher {
    /// Create a publisher whose dead letters go to the registry's DLQ stream
    pub fn new(
        log: Arc<dyn DurableLog>,
        dedup: Arc<dyn DedupStore>,
        registry: Arc<StreamRegistry>,
        config: PublisherConfig,
    ) -> Self {
        let dlq_retention = registry.retention(DLQ_STREAM).unwrap_or(10_000);
        let dlq = Arc::new(LogDlqHandler::new(log.clone(), DLQ_STREAM, dlq_retention));
        Self {
            log,
            dedup,
            dlq,
            registry,
            metrics: Arc::new(PublisherMetrics::new()),
            config,
        }
    }

    /// Share an externally owned metrics instance
    pub fn with_metrics(mut self, metrics: Arc<PublisherMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_dlq_handler(mut self, dlq: Arc<dyn DlqHandler>) -> Self {
        self.dlq = dlq;
        self
    }

    pub fn metrics(&self) -> &Arc<PublisherMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn dlq(&self) -> &Arc<dyn DlqHandler> {
        &self.dlq
    }

    /// Create every configured stream and consumer group
    ///
    /// Run once before accepting traffic. Safe to repeat: existing groups
    /// count as success.
    pub async fn initialize(&self) -> Result<InitReport> {
        let mut report = InitReport::default();

        for stream in self.registry.streams() {
            self.log
                .ensure_stream(&stream.name, stream.retention_limit)
                .await?;
            report.streams += 1;

            for group in &stream.consumer_groups {
                match self.log.create_consumer_group(&stream.name, group).await? {
                    GroupCreation::Created => report.groups_created += 1,
                    GroupCreation::AlreadyExists => {
                        tracing::debug!(stream = %stream.name, group = %group, "Consumer group already exists");
                        report.groups_existing += 1;
                    }
                }
            }
        }

        tracing::info!(
            backend = self.log.name(),
            streams = report.streams,
            groups_created = report.groups_created,
            groups_existing = report.groups_existing,
            "Event publisher initialized"
        );
        Ok(report)
    }

    /// Publish an event; `true` if it is (now or previously) delivered
    ///
    /// `targets` overrides the event's default routing.
    pub async fn publish(
        &self,
        event: &RsvpEvent,
        targets: Option<&TargetSet>,
        ensure_delivery: bool,
    ) -> bool {
        self.publish_with_report(event, targets, ensure_delivery)
            .await
            .is_success()
    }

    /// Publish an event and report per-target results
    pub async fn publish_with_report(
        &self,
        event: &RsvpEvent,
        targets: Option<&TargetSet>,
        ensure_delivery: bool,
    ) -> PublishReport {
        let start = Instant::now();

        if self.is_published(event).await {
            tracing::info!(event_id = %event.event_id(), "Skipping duplicate event");
            self.metrics.record_duplicate();
            let mut report = PublishReport::new(event.event_id());
            report.duplicate = true;
            return report;
        }

        let targets = targets.cloned().unwrap_or_else(|| event.default_targets());

        let fields = match event.to_fields() {
            Ok(fields) => fields,
            Err(e) => {
                let mut report = PublishReport::new(event.event_id());
                report.error = Some(format!("Publisher error: {}", e));
                return self.settle(event, report, &targets, ensure_delivery).await;
            }
        };

        let outcomes = self.fan_out(&fields, &targets).await;
        let report = collect(event.event_id(), outcomes);
        let report = self.settle(event, report, &targets, ensure_delivery).await;

        if report.is_success() {
            tracing::info!(
                event_id = %event.event_id(),
                match_id = event.match_id(),
                targets = report.delivered.len(),
                elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Published RSVP event"
            );
        }
        report
    }

    /// Publish many events in fixed-size chunks
    ///
    /// Each chunk's writes go out as one concurrent batch; every write
    /// keeps its own timeout and every event is counted on its own.
    pub async fn publish_bulk(&self, events: &[RsvpEvent]) -> BulkPublishResult {
        let mut result = BulkPublishResult::default();
        if events.is_empty() {
            return result;
        }

        tracing::info!(count = events.len(), "Publishing events in bulk");

        // Repeats inside one call are not yet marked in the dedup store
        let mut accepted: HashSet<&str> = HashSet::with_capacity(events.len());

        let batch_size = self.config.bulk_batch_size.max(1);
        for (batch_no, chunk) in events.chunks(batch_size).enumerate() {
            let mut prepared = Vec::with_capacity(chunk.len());
            for event in chunk {
                if !accepted.insert(event.event_id()) || self.is_published(event).await {
                    self.metrics.record_duplicate();
                    result.duplicates += 1;
                    continue;
                }
                let targets = event.default_targets();
                match event.to_fields() {
                    Ok(fields) => prepared.push((event, fields, targets)),
                    Err(e) => {
                        let mut report = PublishReport::new(event.event_id());
                        report.error = Some(format!("Publisher error: {}", e));
                        self.settle(event, report, &targets, true).await;
                        result.failed += 1;
                    }
                }
            }

            let writes = prepared.iter().enumerate().flat_map(move |(i, (_, fields, targets))| {
                targets.iter().map(move |&target| async move {
                    (i, target, self.write(target, fields).await)
                })
            });
            let mut outcomes: Vec<Vec<(Target, Result<String>)>> =
                prepared.iter().map(|_| Vec::new()).collect();
            for (i, target, outcome) in join_all(writes).await {
                outcomes[i].push((target, outcome));
            }

            let mut batch_published = 0;
            for ((event, _, targets), event_outcomes) in prepared.iter().zip(outcomes) {
                let report = collect(event.event_id(), event_outcomes);
                if self.settle(event, report, targets, true).await.is_success() {
                    batch_published += 1;
                } else {
                    result.failed += 1;
                }
            }
            result.published += batch_published;

            tracing::debug!(batch = batch_no + 1, published = batch_published, "Bulk batch complete");
        }

        tracing::info!(
            published = result.published,
            failed = result.failed,
            duplicates = result.duplicates,
            "Bulk publish complete"
        );
        result
    }

    /// Publish an operator sync request; not deduplicated
    pub async fn publish_sync_request(&self, event: &RsvpSyncEvent) -> bool {
        let fields = match event.to_fields() {
            Ok(fields) => fields,
            Err(e) => {
                tracing::error!(match_id = event.match_id, error = %e, "Failed to encode sync request");
                return false;
            }
        };

        let retention = self.registry.retention(SYNC_STREAM).unwrap_or(1_000);
        let write = self.log.append(SYNC_STREAM, &fields, retention);
        match tokio::time::timeout(self.config.write_timeout(), write).await {
            Ok(Ok(id)) => {
                tracing::info!(match_id = event.match_id, entry_id = %id, "Published sync request");
                true
            }
            Ok(Err(e)) => {
                tracing::error!(match_id = event.match_id, error = %e, "Failed to publish sync request");
                false
            }
            Err(_) => {
                tracing::error!(match_id = event.match_id, "Sync request write timed out");
                false
            }
        }
    }

    /// Re-deliver recent dead letters to the targets that failed
    ///
    /// Bypasses dedup, since partially delivered events are already
    /// marked published. DLQ entries are not removed; replaying twice
    /// delivers twice.
    pub async fn replay_dead_letters(&self, limit: usize) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();

        for dead in self.dlq.list(limit).await? {
            let event: RsvpEvent = match serde_json::from_str(&dead.original_event) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(dlq_id = %dead.dlq_id, error = %e, "Skipping undecodable dead letter");
                    report.skipped += 1;
                    continue;
                }
            };

            let targets: TargetSet = if dead.failed_targets.is_empty() {
                event.default_targets()
            } else {
                dead.failed_targets.iter().copied().collect()
            };

            let fields = event.to_fields()?;
            let outcome = collect(event.event_id(), self.fan_out(&fields, &targets).await);
            if outcome.failed.is_empty() {
                self.mark_published(&event).await;
                report.replayed += 1;
            } else {
                tracing::warn!(
                    dlq_id = %dead.dlq_id,
                    event_id = %event.event_id(),
                    failed = ?outcome.failed.keys().collect::<Vec<_>>(),
                    "Dead letter replay failed"
                );
                report.failed += 1;
            }
        }

        tracing::info!(
            replayed = report.replayed,
            failed = report.failed,
            skipped = report.skipped,
            "Dead letter replay complete"
        );
        Ok(report)
    }

    /// Check connectivity and every configured stream
    pub async fn health_check(&self) -> HealthReport {
        let names = self.registry.names();
        let metrics = self.metrics.snapshot(names.clone());

        let connected = match tokio::time::timeout(self.config.write_timeout(), self.log.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Durable log unreachable");
                false
            }
            Err(_) => {
                tracing::warn!("Durable log ping timed out");
                false
            }
        };

        if !connected {
            return HealthReport {
                status: HealthStatus::Critical,
                log_connected: false,
                streams_accessible: names.into_iter().map(|n| (n, false)).collect(),
                metrics,
            };
        }

        let checks = names.iter().map(|name| async move {
            let read = self.log.read_last(name, 1);
            let ok = matches!(
                tokio::time::timeout(self.config.write_timeout(), read).await,
                Ok(Ok(_))
            );
            (name.clone(), ok)
        });
        let streams_accessible: BTreeMap<String, bool> = join_all(checks).await.into_iter().collect();

        let status = if streams_accessible.values().all(|ok| *ok) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            log_connected: true,
            streams_accessible,
            metrics,
        }
    }

    /// Concurrent per-target writes
    async fn fan_out(
        &self,
        fields: &StreamFields,
        targets: &TargetSet,
    ) -> Vec<(Target, Result<String>)> {
        let writes = targets
            .iter()
            .map(|&target| async move { (target, self.write(target, fields).await) });
        join_all(writes).await
    }

    /// One target write under the configured timeout
    async fn write(&self, target: Target, fields: &StreamFields) -> Result<String> {
        let stream = target.stream_name();
        let retention = self
            .registry
            .retention(stream)
            .ok_or_else(|| SyncError::Stream(format!("unknown target stream '{}'", stream)))?;

        let timeout = self.config.write_timeout();
        match tokio::time::timeout(timeout, self.log.append(stream, fields, retention)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!(
                "append to '{}' exceeded {}ms",
                stream,
                timeout.as_millis()
            ))),
        }
    }

    /// Apply metrics, dedup marking, and dead-lettering for a report
    async fn settle(
        &self,
        event: &RsvpEvent,
        mut report: PublishReport,
        targets: &TargetSet,
        ensure_delivery: bool,
    ) -> PublishReport {
        if report.is_success() {
            self.mark_published(event).await;
            self.metrics.record_published();

            if !report.failed.is_empty() {
                tracing::warn!(
                    event_id = %event.event_id(),
                    failed = ?report.failed.keys().collect::<Vec<_>>(),
                    "Partial fan-out"
                );
                if ensure_delivery {
                    let reason = describe_failures(&report.failed);
                    let failed: Vec<Target> = report.failed.keys().copied().collect();
                    report.dead_lettered = self.dead_letter(event, reason, failed).await;
                }
            }
            return report;
        }

        self.metrics.record_failed();
        tracing::error!(event_id = %event.event_id(), "Failed to publish event");

        if ensure_delivery {
            let reason = match &report.error {
                Some(error) => error.clone(),
                None => format!(
                    "Failed to publish to primary streams: {}",
                    describe_failures(&report.failed)
                ),
            };
            report.dead_lettered = self
                .dead_letter(event, reason, targets.iter().copied().collect())
                .await;
        }
        report
    }

    async fn dead_letter(&self, event: &RsvpEvent, reason: String, failed: Vec<Target>) -> bool {
        let original = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));
        let dead = DeadLetterEvent::new(event.event_id(), original, reason, failed);

        match tokio::time::timeout(self.config.write_timeout(), self.dlq.handle(dead)).await {
            Ok(Ok(())) => {
                self.metrics.record_dead_lettered();
                true
            }
            Ok(Err(e)) => {
                tracing::error!(event_id = %event.event_id(), error = %e, "Failed to send to DLQ");
                false
            }
            Err(_) => {
                tracing::error!(event_id = %event.event_id(), "DLQ write timed out");
                false
            }
        }
    }

    /// Dedup lookup; fails open when the store is unreachable
    async fn is_published(&self, event: &RsvpEvent) -> bool {
        match self.dedup.exists(&published_key(event.event_id())).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(event_id = %event.event_id(), error = %e, "Dedup check failed");
                false
            }
        }
    }

    async fn mark_published(&self, event: &RsvpEvent) {
        let key = published_key(event.event_id());
        if let Err(e) = self
            .dedup
            .set_with_ttl(&key, event.operation_id(), self.config.dedup_ttl())
            .await
        {
            tracing::warn!(event_id = %event.event_id(), error = %e, "Failed to mark event as published");
        }
    }
}

fn collect(event_id: &str, outcomes: Vec<(Target, Result<String>)>) -> PublishReport {
    let mut report = PublishReport::new(event_id);
    for (target, outcome) in outcomes {
        match outcome {
            Ok(id) => {
                tracing::debug!(event_id, target = %target, entry_id = %id, "Target write succeeded");
                report.delivered.insert(target, id);
            }
            Err(e) => {
                report.failed.insert(target, e.to_string());
            }
        }
    }
    report
}

fn describe_failures(failed: &BTreeMap<Target, String>) -> String {
    failed
        .iter()
        .map(|(target, reason)| format!("{}: {}", target, reason))
        .collect::<Vec<_>>()
        .join("; ")
}
