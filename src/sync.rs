//! Synchronization orchestrator — the RSVP update path
//!
//! `SyncOrchestrator::update` commits an availability change to the primary
//! store, builds the domain event, and publishes it while the realtime fast
//! path (cache + broadcast) runs concurrently. Publish failures never undo
//! the committed write; they end up in the dead-letter stream.
//!
//! Idempotency works at two levels. A completed operation's outcome is kept
//! under `rsvp:operation:<operation_id>`, so a retry returns it without
//! touching anything. Below that, the event id is derived from the
//! operation id, so the publisher deduplicates any retry that gets through.

use crate::config::OrchestratorConfig;
use crate::dedup::{operation_key, DedupStore};
use crate::error::{Result, SyncError};
use crate::metrics::{OrchestratorMetrics, OrchestratorSnapshot};
use crate::publisher::{EventPublisher, HealthReport, HealthStatus};
use crate::realtime::{CachedRsvp, RealtimeBroadcaster, RsvpBroadcast, RsvpCache};
use crate::store::{PlayerInfo, ResponseStore, ResponseWrite};
use crate::types::{
    EventContext, Response, RsvpEvent, RsvpEventType, RsvpSource, RsvpSyncEvent, Target,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// One availability change for a (match, player) pair
#[derive(Debug, Clone, PartialEq)]
pub struct RsvpUpdateRequest {
    pub match_id: i64,
    pub player_id: i64,
    pub response: Response,
    /// Caller-supplied for safe retries; generated when absent
    pub operation_id: Option<String>,
    pub trace_id: Option<String>,
    pub source: RsvpSource,
    pub context: EventContext,
}

impl RsvpUpdateRequest {
    pub fn new(match_id: i64, player_id: i64, response: Response) -> Self {
        Self {
            match_id,
            player_id,
            response,
            operation_id: None,
            trace_id: None,
            source: RsvpSource::Web,
            context: EventContext::default(),
        }
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_source(mut self, source: RsvpSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }
}

/// Request body of the update endpoint
///
/// `availability` is also accepted as `response`. Enum values arrive as
/// strings and are validated by [`into_request`](Self::into_request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRsvpBody {
    pub match_id: i64,
    #[serde(alias = "response")]
    pub availability: String,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl UpdateRsvpBody {
    /// Validate and bind to the authenticated player
    pub fn into_request(self, player_id: i64) -> Result<RsvpUpdateRequest> {
        let response: Response = self.availability.parse()?;
        let source = match self.source.as_deref() {
            Some(source) => source.parse()?,
            None => RsvpSource::Web,
        };
        let mut request = RsvpUpdateRequest::new(self.match_id, player_id, response)
            .with_source(source);
        request.operation_id = self.operation_id;
        Ok(request)
    }
}

/// Result of a committed (or replayed) update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsvpUpdateOutcome {
    pub match_id: i64,
    pub player_id: i64,
    pub old_response: Response,
    pub new_response: Response,
    pub event_type: RsvpEventType,
    pub event_id: String,
    pub operation_id: String,
    pub trace_id: String,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    /// Fan-out reached at least one target
    pub published: bool,
    /// Served from the operation result cache
    #[serde(default)]
    pub replayed: bool,
}

/// One item of a bulk update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRsvpItem {
    pub match_id: i64,
    #[serde(alias = "availability")]
    pub response: Response,
    #[serde(default)]
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemResult {
    pub match_id: i64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RsvpUpdateOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkSummary {
    pub total: usize,
    pub successful_count: usize,
    pub failed_count: usize,
    pub trace_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUpdateResult {
    pub results: Vec<BulkItemResult>,
    pub summary: BulkSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequestOutcome {
    pub event: RsvpSyncEvent,
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRsvp {
    pub player_id: i64,
    pub player_name: Option<String>,
    pub responded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCounts {
    pub yes_count: usize,
    pub no_count: usize,
    pub maybe_count: usize,
    pub total: usize,
}

/// Current RSVPs of a match grouped by answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub match_id: i64,
    pub yes: Vec<PlayerRsvp>,
    pub no: Vec<PlayerRsvp>,
    pub maybe: Vec<PlayerRsvp>,
    pub counts: ResponseCounts,
}

/// Dependency health of the update path
///
/// An unreachable store is critical. A lost dedup store or a critical
/// publisher degrades the service, since updates still commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub store_connected: bool,
    pub dedup_connected: bool,
    pub publisher_healthy: bool,
    pub publisher: HealthReport,
}

/// Per-match async locks, dropped once nobody holds or awaits them
#[derive(Default)]
struct MatchLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl MatchLocks {
    async fn acquire(&self, match_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(match_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Drives RSVP updates from request to published event
pub struct SyncOrchestrator {
    store: Arc<dyn ResponseStore>,
    publisher: Arc<EventPublisher>,
    dedup: Arc<dyn DedupStore>,
    cache: Arc<dyn RsvpCache>,
    broadcaster: Arc<dyn RealtimeBroadcaster>,
    metrics: Arc<OrchestratorMetrics>,
    config: OrchestratorConfig,
    locks: MatchLocks,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn ResponseStore>,
        publisher: Arc<EventPublisher>,
        dedup: Arc<dyn DedupStore>,
        cache: Arc<dyn RsvpCache>,
        broadcaster: Arc<dyn RealtimeBroadcaster>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            dedup,
            cache,
            broadcaster,
            metrics: Arc::new(OrchestratorMetrics::new()),
            config,
            locks: MatchLocks::default(),
        }
    }

    /// Share an externally owned metrics instance
    pub fn with_metrics(mut self, metrics: Arc<OrchestratorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn metrics(&self) -> OrchestratorSnapshot {
        self.metrics.snapshot()
    }

    /// Apply one availability change
    ///
    /// Fails only before the store write commits: validation, unknown
    /// match or player, or a version conflict (retryable). Everything after
    /// the write is best effort and reported in the outcome.
    pub async fn update(&self, request: RsvpUpdateRequest) -> Result<RsvpUpdateOutcome> {
        let start = Instant::now();

        if let Err(e) = validate(&request) {
            self.metrics.record_validation_error();
            return Err(e);
        }

        let operation_id = request
            .operation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(outcome) = self.replayed_outcome(&operation_id).await {
            return Ok(outcome);
        }

        let _guard = self.locks.acquire(request.match_id).await;

        // A concurrent retry may have finished while we waited
        if let Some(outcome) = self.replayed_outcome(&operation_id).await {
            return Ok(outcome);
        }

        if self.store.find_match(request.match_id).await?.is_none() {
            self.metrics.record_not_found();
            return Err(SyncError::NotFound(format!("Match {} not found", request.match_id)));
        }
        let player = match self.store.find_player(request.player_id).await? {
            Some(player) => player,
            None => {
                self.metrics.record_not_found();
                return Err(SyncError::NotFound(format!(
                    "Player {} not found",
                    request.player_id
                )));
            }
        };

        let current = self
            .store
            .get_current_response(request.match_id, request.player_id)
            .await?;
        let old_response = current
            .as_ref()
            .map_or(Response::NoResponse, |row| row.response);
        let expected_version = current.as_ref().map(|row| row.version);
        let trace_id = request
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let version = match self
            .commit(&request, old_response, expected_version, &operation_id, &trace_id)
            .await
        {
            Ok(version) => version,
            Err(e) => {
                if matches!(e, SyncError::Conflict { .. }) {
                    self.metrics.record_conflict();
                    tracing::warn!(
                        match_id = request.match_id,
                        player_id = request.player_id,
                        operation_id = %operation_id,
                        "Concurrent RSVP update"
                    );
                }
                return Err(e);
            }
        };

        let event = RsvpEvent::create_updated(
            request.match_id,
            request.player_id,
            old_response,
            request.response,
            request.source,
        )
        .with_operation_id(operation_id.as_str())
        .with_trace_id(trace_id.as_str())
        .with_version(version)
        .with_context(enrich_context(request.context, &player));

        let (published, ()) = tokio::join!(
            self.publisher.publish(&event, None, true),
            self.fast_path(&event, &player),
        );

        let outcome = RsvpUpdateOutcome {
            match_id: event.match_id(),
            player_id: event.player_id(),
            old_response,
            new_response: event.new_response(),
            event_type: event.event_type(),
            event_id: event.event_id().to_string(),
            operation_id,
            trace_id,
            version,
            updated_at: event.occurred_at(),
            published,
            replayed: false,
        };
        self.remember(&outcome).await;
        self.metrics.record_processed();

        tracing::info!(
            match_id = outcome.match_id,
            player_id = outcome.player_id,
            operation_id = %outcome.operation_id,
            event_id = %outcome.event_id,
            old = %old_response,
            new = %outcome.new_response,
            published,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "RSVP updated"
        );
        Ok(outcome)
    }

    /// Apply up to `bulk_limit` changes for one player
    ///
    /// Items succeed or fail independently and share one trace id.
    pub async fn bulk_update(
        &self,
        player_id: i64,
        items: Vec<BulkRsvpItem>,
        source: RsvpSource,
    ) -> Result<BulkUpdateResult> {
        if items.is_empty() {
            self.metrics.record_validation_error();
            return Err(SyncError::Validation("No updates provided".into()));
        }
        if items.len() > self.config.bulk_limit {
            self.metrics.record_validation_error();
            return Err(SyncError::Validation(format!(
                "Maximum {} updates per bulk request, got {}",
                self.config.bulk_limit,
                items.len()
            )));
        }

        let trace_id = Uuid::new_v4().to_string();
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            let mut request = RsvpUpdateRequest::new(item.match_id, player_id, item.response)
                .with_source(source)
                .with_trace_id(trace_id.as_str());
            request.operation_id = item.operation_id;

            results.push(match self.update(request).await {
                Ok(outcome) => BulkItemResult {
                    match_id: item.match_id,
                    success: true,
                    outcome: Some(outcome),
                    error: None,
                    retryable: false,
                },
                Err(e) => BulkItemResult {
                    match_id: item.match_id,
                    success: false,
                    outcome: None,
                    retryable: e.is_retryable(),
                    error: Some(e.to_string()),
                },
            });
        }

        let successful_count = results.iter().filter(|r| r.success).count();
        let summary = BulkSummary {
            total: results.len(),
            successful_count,
            failed_count: results.len() - successful_count,
            trace_id,
        };

        tracing::info!(
            player_id,
            total = summary.total,
            successful = summary.successful_count,
            failed = summary.failed_count,
            trace_id = %summary.trace_id,
            "Bulk RSVP update complete"
        );
        Ok(BulkUpdateResult { results, summary })
    }

    /// Ask downstream consumers to reconcile every RSVP of a match
    ///
    /// Defaults to chat sync and realtime when `targets` is empty.
    pub async fn request_match_sync(
        &self,
        match_id: i64,
        requested_by: &str,
        targets: Vec<Target>,
        force_update: bool,
    ) -> Result<SyncRequestOutcome> {
        if self.store.find_match(match_id).await?.is_none() {
            self.metrics.record_not_found();
            return Err(SyncError::NotFound(format!("Match {} not found", match_id)));
        }

        let targets = if targets.is_empty() {
            vec![Target::ChatSync, Target::Realtime]
        } else {
            targets
        };

        let event = RsvpSyncEvent::new(match_id, requested_by, targets, force_update);
        let published = self.publisher.publish_sync_request(&event).await;
        tracing::info!(match_id, requested_by, published, "Match sync requested");

        Ok(SyncRequestOutcome { event, published })
    }

    /// Current RSVPs of a match grouped by answer
    pub async fn match_summary(&self, match_id: i64) -> Result<MatchSummary> {
        if self.store.find_match(match_id).await?.is_none() {
            self.metrics.record_not_found();
            return Err(SyncError::NotFound(format!("Match {} not found", match_id)));
        }

        let mut summary = MatchSummary {
            match_id,
            yes: Vec::new(),
            no: Vec::new(),
            maybe: Vec::new(),
            counts: ResponseCounts::default(),
        };

        for (player_id, row) in self.store.list_responses(match_id).await? {
            let player_name = self.store.find_player(player_id).await?.map(|p| p.name);
            let entry = PlayerRsvp {
                player_id,
                player_name,
                responded_at: row.responded_at,
            };
            match row.response {
                Response::Yes => summary.yes.push(entry),
                Response::No => summary.no.push(entry),
                Response::Maybe => summary.maybe.push(entry),
                Response::NoResponse => continue,
            }
        }

        summary.counts = ResponseCounts {
            yes_count: summary.yes.len(),
            no_count: summary.no.len(),
            maybe_count: summary.maybe.len(),
            total: summary.yes.len() + summary.no.len() + summary.maybe.len(),
        };
        Ok(summary)
    }

    /// Probe the store, the dedup store, and the publisher
    pub async fn health_check(&self) -> ServiceHealth {
        let limit = self.config.health_timeout();

        let store_connected = match tokio::time::timeout(limit, self.store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Response store unreachable");
                false
            }
            Err(_) => {
                tracing::warn!("Response store ping timed out");
                false
            }
        };

        let dedup_connected =
            match tokio::time::timeout(limit, self.dedup.exists(&operation_key("health"))).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Dedup store unreachable");
                    false
                }
                Err(_) => {
                    tracing::warn!("Dedup store ping timed out");
                    false
                }
            };

        let publisher = self.publisher.health_check().await;
        let publisher_healthy = publisher.status != HealthStatus::Critical;

        let status = if !store_connected {
            HealthStatus::Critical
        } else if !dedup_connected || !publisher_healthy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ServiceHealth {
            status,
            store_connected,
            dedup_connected,
            publisher_healthy,
            publisher,
        }
    }

    /// Store write for the transition; no-ops skip it
    async fn commit(
        &self,
        request: &RsvpUpdateRequest,
        old_response: Response,
        expected_version: Option<u32>,
        operation_id: &str,
        trace_id: &str,
    ) -> Result<u32> {
        if old_response == request.response {
            return match expected_version {
                Some(version) => Ok(version),
                // No row: reuse the version of the last deletion, never 0
                None => Ok(self
                    .store
                    .last_version(request.match_id, request.player_id)
                    .await?
                    .max(1)),
            };
        }

        if request.response.is_answer() {
            let write = ResponseWrite {
                response: request.response,
                operation_id: operation_id.to_string(),
                trace_id: trace_id.to_string(),
            };
            self.store
                .upsert_response(request.match_id, request.player_id, write, expected_version)
                .await
        } else {
            self.store
                .delete_response(request.match_id, request.player_id, expected_version)
                .await
        }
    }

    /// Cache update and realtime broadcast; failures are logged only
    async fn fast_path(&self, event: &RsvpEvent, player: &PlayerInfo) {
        let entry = CachedRsvp {
            match_id: event.match_id(),
            player_id: event.player_id(),
            response: event.new_response(),
            version: event.version(),
            updated_at: event.occurred_at(),
        };
        if let Err(e) = self.cache.set(entry).await {
            tracing::warn!(event_id = %event.event_id(), error = %e, "Failed to update RSVP cache");
        }

        if !event.affects_realtime_broadcast() {
            return;
        }

        let message = RsvpBroadcast {
            match_id: event.match_id(),
            player_id: event.player_id(),
            player_name: Some(player.name.clone()),
            old_response: event.old_response(),
            response: event.new_response(),
            source: event.source(),
            event_id: event.event_id().to_string(),
            trace_id: event.trace_id().to_string(),
        };
        if let Err(e) = self.broadcaster.broadcast(message).await {
            tracing::warn!(event_id = %event.event_id(), error = %e, "Realtime broadcast failed");
        }
    }

    /// Stored outcome of a completed operation, flagged as replayed
    async fn replayed_outcome(&self, operation_id: &str) -> Option<RsvpUpdateOutcome> {
        let stored = match self.dedup.get(&operation_key(operation_id)).await {
            Ok(stored) => stored?,
            Err(e) => {
                tracing::warn!(operation_id, error = %e, "Operation lookup failed");
                return None;
            }
        };

        match serde_json::from_str::<RsvpUpdateOutcome>(&stored) {
            Ok(mut outcome) => {
                tracing::info!(operation_id, "Operation already processed");
                self.metrics.record_duplicate();
                outcome.replayed = true;
                Some(outcome)
            }
            Err(e) => {
                tracing::warn!(operation_id, error = %e, "Discarding unreadable operation result");
                None
            }
        }
    }

    async fn remember(&self, outcome: &RsvpUpdateOutcome) {
        let key = operation_key(&outcome.operation_id);
        let stored = match serde_json::to_string(outcome) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(operation_id = %outcome.operation_id, error = %e, "Failed to encode operation result");
                return;
            }
        };
        if let Err(e) = self
            .dedup
            .set_with_ttl(&key, &stored, self.config.operation_ttl())
            .await
        {
            tracing::warn!(operation_id = %outcome.operation_id, error = %e, "Failed to store operation result");
        }
    }
}

fn validate(request: &RsvpUpdateRequest) -> Result<()> {
    if request.match_id <= 0 {
        return Err(SyncError::Validation(format!(
            "Invalid match id {}",
            request.match_id
        )));
    }
    if request.player_id <= 0 {
        return Err(SyncError::Validation(format!(
            "Invalid player id {}",
            request.player_id
        )));
    }
    if let Some(op) = &request.operation_id {
        if op.trim().is_empty() {
            return Err(SyncError::Validation("operation_id must not be blank".into()));
        }
    }
    Ok(())
}

/// Fill player details the caller did not supply
fn enrich_context(mut context: EventContext, player: &PlayerInfo) -> EventContext {
    if context.player_name.is_none() {
        context.player_name = Some(player.name.clone());
    }
    if context.discord_id.is_none() {
        context.discord_id = player.discord_id.clone();
    }
    if context.team_id.is_none() {
        context.team_id = player.team_id;
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublisherConfig;
    use crate::dedup::MemoryDedupStore;
    use crate::provider::memory::MemoryLog;
    use crate::realtime::{ChannelBroadcaster, MemoryRsvpCache};
    use crate::registry::{StreamRegistry, SYNC_STREAM};
    use crate::store::{MatchInfo, MemoryResponseStore};
    use crate::types::event_id_for_operation;

    struct Fixture {
        log: Arc<MemoryLog>,
        store: Arc<MemoryResponseStore>,
        cache: Arc<MemoryRsvpCache>,
        broadcaster: Arc<ChannelBroadcaster>,
        orchestrator: SyncOrchestrator,
    }

    async fn fixture() -> Fixture {
        let log = Arc::new(MemoryLog::new());
        let dedup = Arc::new(MemoryDedupStore::new());
        let store = Arc::new(MemoryResponseStore::new());
        let cache = Arc::new(MemoryRsvpCache::new());
        let broadcaster = Arc::new(ChannelBroadcaster::new(16));

        for match_id in [42, 43, 44] {
            store.add_match(MatchInfo::new(match_id)).await;
        }
        store.add_player(PlayerInfo::new(7, "Alex")).await;

        let publisher = Arc::new(EventPublisher::new(
            log.clone(),
            dedup.clone(),
            Arc::new(StreamRegistry::default()),
            PublisherConfig::default(),
        ));
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            publisher,
            dedup,
            cache.clone(),
            broadcaster.clone(),
            OrchestratorConfig::default(),
        );
        Fixture {
            log,
            store,
            cache,
            broadcaster,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_first_answer_creates() {
        let f = fixture().await;
        let mut rx = f.broadcaster.subscribe();

        let outcome = f
            .orchestrator
            .update(RsvpUpdateRequest::new(42, 7, Response::Yes).with_source(RsvpSource::Mobile))
            .await
            .unwrap();

        assert_eq!(outcome.event_type, RsvpEventType::Created);
        assert_eq!(outcome.old_response, Response::NoResponse);
        assert_eq!(outcome.version, 1);
        assert!(outcome.published);
        assert!(!outcome.replayed);

        let row = f.store.get_current_response(42, 7).await.unwrap().unwrap();
        assert_eq!(row.response, Response::Yes);
        assert_eq!(f.cache.get(42, 7).await.unwrap().unwrap().response, Response::Yes);
        assert_eq!(rx.recv().await.unwrap().player_name.as_deref(), Some("Alex"));
        assert_eq!(f.log.count_event("rsvp:discord", &outcome.event_id).await, 1);
    }

    #[tokio::test]
    async fn test_operation_replay_returns_stored_outcome() {
        let f = fixture().await;
        let request = RsvpUpdateRequest::new(42, 7, Response::Yes).with_operation_id("op-1");

        let first = f.orchestrator.update(request.clone()).await.unwrap();
        let appends = f.log.total_appends();
        let second = f.orchestrator.update(request).await.unwrap();

        assert!(second.replayed);
        assert_eq!(second.event_id, first.event_id);
        assert_eq!(second.event_id, event_id_for_operation("op-1"));
        assert_eq!(second.version, first.version);
        assert_eq!(f.log.total_appends(), appends);
        assert_eq!(f.store.writes(), 1);

        let metrics = f.orchestrator.metrics();
        assert_eq!(metrics.operations_processed, 1);
        assert_eq!(metrics.duplicate_operations, 1);
    }

    #[tokio::test]
    async fn test_change_then_clear() {
        let f = fixture().await;
        f.orchestrator
            .update(RsvpUpdateRequest::new(42, 7, Response::Yes))
            .await
            .unwrap();
        let changed = f
            .orchestrator
            .update(RsvpUpdateRequest::new(42, 7, Response::Maybe))
            .await
            .unwrap();
        assert_eq!(changed.event_type, RsvpEventType::Updated);
        assert_eq!(changed.version, 2);

        let cleared = f
            .orchestrator
            .update(RsvpUpdateRequest::new(42, 7, Response::NoResponse))
            .await
            .unwrap();
        assert_eq!(cleared.event_type, RsvpEventType::Deleted);
        assert_eq!(cleared.version, 3);
        assert!(f.store.get_current_response(42, 7).await.unwrap().is_none());
        assert_eq!(
            f.cache.get(42, 7).await.unwrap().unwrap().response,
            Response::NoResponse
        );
    }

    #[tokio::test]
    async fn test_no_op_skips_write_and_broadcast() {
        let f = fixture().await;
        f.orchestrator
            .update(RsvpUpdateRequest::new(42, 7, Response::No))
            .await
            .unwrap();
        let mut rx = f.broadcaster.subscribe();

        let outcome = f
            .orchestrator
            .update(RsvpUpdateRequest::new(42, 7, Response::No))
            .await
            .unwrap();

        assert_eq!(f.store.writes(), 1);
        assert_eq!(outcome.version, 1);
        assert_eq!(f.log.count_event("rsvp:audit", &outcome.event_id).await, 1);
        assert_eq!(f.log.count_event("rsvp:websocket", &outcome.event_id).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_match_rejected_before_mutation() {
        let f = fixture().await;
        let err = f
            .orchestrator
            .update(RsvpUpdateRequest::new(99, 7, Response::Yes))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert_eq!(f.store.writes(), 0);
        assert_eq!(f.log.total_appends(), 0);
        assert_eq!(f.orchestrator.metrics().not_found, 1);
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected() {
        let f = fixture().await;
        let err = f
            .orchestrator
            .update(RsvpUpdateRequest::new(0, 7, Response::Yes))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let err = f
            .orchestrator
            .update(RsvpUpdateRequest::new(42, 7, Response::Yes).with_operation_id("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(f.orchestrator.metrics().validation_errors, 2);
    }

    #[tokio::test]
    async fn test_failed_operation_is_not_cached() {
        let f = fixture().await;
        let request = RsvpUpdateRequest::new(45, 7, Response::Yes).with_operation_id("op-retry");
        assert!(f.orchestrator.update(request.clone()).await.is_err());

        f.store.add_match(MatchInfo::new(45)).await;
        let outcome = f.orchestrator.update(request).await.unwrap();
        assert!(!outcome.replayed);
        assert_eq!(outcome.new_response, Response::Yes);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_committed_write() {
        let f = fixture().await;
        f.log.set_offline(true);

        let outcome = f
            .orchestrator
            .update(RsvpUpdateRequest::new(42, 7, Response::Yes))
            .await
            .unwrap();
        assert!(!outcome.published);
        assert_eq!(
            f.store.get_current_response(42, 7).await.unwrap().unwrap().response,
            Response::Yes
        );
    }

    #[tokio::test]
    async fn test_bulk_limit() {
        let f = fixture().await;
        let items: Vec<BulkRsvpItem> = (0..51)
            .map(|i| BulkRsvpItem {
                match_id: 42 + i,
                response: Response::Yes,
                operation_id: None,
            })
            .collect();
        let err = f
            .orchestrator
            .bulk_update(7, items, RsvpSource::Web)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let err = f
            .orchestrator
            .bulk_update(7, Vec::new(), RsvpSource::Web)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_bulk_partial_success_shares_trace() {
        let f = fixture().await;
        let items = vec![
            BulkRsvpItem { match_id: 42, response: Response::Yes, operation_id: None },
            BulkRsvpItem { match_id: 404, response: Response::No, operation_id: None },
            BulkRsvpItem { match_id: 43, response: Response::Maybe, operation_id: None },
        ];

        let result = f
            .orchestrator
            .bulk_update(7, items, RsvpSource::Mobile)
            .await
            .unwrap();
        assert_eq!(result.summary.total, 3);
        assert_eq!(result.summary.successful_count, 2);
        assert_eq!(result.summary.failed_count, 1);
        assert!(!result.results[1].success);
        assert!(result.results[1].error.as_deref().unwrap().contains("404"));

        for item in result.results.iter().filter(|r| r.success) {
            let outcome = item.outcome.as_ref().unwrap();
            assert_eq!(outcome.trace_id, result.summary.trace_id);
        }
    }

    #[tokio::test]
    async fn test_request_match_sync() {
        let f = fixture().await;
        let outcome = f
            .orchestrator
            .request_match_sync(42, "admin:1", Vec::new(), true)
            .await
            .unwrap();
        assert!(outcome.published);
        assert_eq!(outcome.event.sync_targets, vec![Target::ChatSync, Target::Realtime]);
        assert_eq!(f.log.len(SYNC_STREAM).await, 1);

        let err = f
            .orchestrator
            .request_match_sync(99, "admin:1", Vec::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_match_summary() {
        let f = fixture().await;
        f.store.add_player(PlayerInfo::new(8, "Sam")).await;
        f.orchestrator
            .update(RsvpUpdateRequest::new(42, 7, Response::Yes))
            .await
            .unwrap();
        f.orchestrator
            .update(RsvpUpdateRequest::new(42, 8, Response::Maybe))
            .await
            .unwrap();

        let summary = f.orchestrator.match_summary(42).await.unwrap();
        assert_eq!(summary.counts.yes_count, 1);
        assert_eq!(summary.counts.maybe_count, 1);
        assert_eq!(summary.counts.total, 2);
        assert_eq!(summary.maybe[0].player_name.as_deref(), Some("Sam"));
    }

    #[test]
    fn test_body_into_request() {
        let body: UpdateRsvpBody = serde_json::from_str(
            r#"{"match_id": 42, "response": "maybe", "operation_id": "op-9", "source": "chat"}"#,
        )
        .unwrap();
        let request = body.into_request(7).unwrap();
        assert_eq!(request.response, Response::Maybe);
        assert_eq!(request.source, RsvpSource::Discord);
        assert_eq!(request.operation_id.as_deref(), Some("op-9"));
        assert_eq!(request.player_id, 7);

        let body: UpdateRsvpBody =
            serde_json::from_str(r#"{"match_id": 42, "availability": "perhaps"}"#).unwrap();
        assert!(matches!(body.into_request(7), Err(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn test_versions_never_go_backwards_after_clear() {
        let f = fixture().await;
        for response in [Response::Yes, Response::NoResponse, Response::NoResponse] {
            f.orchestrator
                .update(RsvpUpdateRequest::new(42, 7, response))
                .await
                .unwrap();
        }

        let versions: Vec<u32> = f
            .log
            .entries("rsvp:audit")
            .await
            .iter()
            .map(|entry| RsvpEvent::from_fields(&entry.fields).unwrap().version())
            .collect();
        assert_eq!(versions, vec![1, 2, 2]);
    }

    #[tokio::test]
    async fn test_no_op_without_history_is_version_one() {
        let f = fixture().await;
        let outcome = f
            .orchestrator
            .update(RsvpUpdateRequest::new(42, 7, Response::NoResponse))
            .await
            .unwrap();
        assert_eq!(outcome.version, 1);
        assert_eq!(f.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_injected_metrics_are_shared() {
        let f = fixture().await;
        let metrics = Arc::new(OrchestratorMetrics::new());
        let orchestrator = SyncOrchestrator::new(
            f.store.clone(),
            f.orchestrator.publisher().clone(),
            Arc::new(MemoryDedupStore::new()),
            f.cache.clone(),
            f.broadcaster.clone(),
            OrchestratorConfig::default(),
        )
        .with_metrics(metrics.clone());

        orchestrator
            .update(RsvpUpdateRequest::new(43, 7, Response::Yes))
            .await
            .unwrap();
        assert_eq!(metrics.snapshot().operations_processed, 1);
        assert_eq!(orchestrator.metrics().operations_processed, 1);
    }

    struct UnreachableDedup;

    #[async_trait::async_trait]
    impl DedupStore for UnreachableDedup {
        async fn exists(&self, _key: &str) -> Result<bool> {
            Err(SyncError::Connection("dedup store down".into()))
        }

        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(SyncError::Connection("dedup store down".into()))
        }

        async fn set_with_ttl(
            &self,
            _key: &str,
            _value: &str,
            _ttl: std::time::Duration,
        ) -> Result<()> {
            Err(SyncError::Connection("dedup store down".into()))
        }
    }

    #[tokio::test]
    async fn test_health_check_states() {
        let f = fixture().await;
        f.orchestrator.publisher().initialize().await.unwrap();

        let health = f.orchestrator.health_check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.store_connected);
        assert!(health.dedup_connected);
        assert!(health.publisher_healthy);

        f.log.set_offline(true);
        let health = f.orchestrator.health_check().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!health.publisher_healthy);
        assert_eq!(health.publisher.status, HealthStatus::Critical);
        f.log.set_offline(false);

        f.store.set_offline(true);
        let health = f.orchestrator.health_check().await;
        assert_eq!(health.status, HealthStatus::Critical);
        assert!(!health.store_connected);
        assert!(health.dedup_connected);
    }

    #[tokio::test]
    async fn test_health_check_degraded_without_dedup() {
        let f = fixture().await;
        f.orchestrator.publisher().initialize().await.unwrap();
        let orchestrator = SyncOrchestrator::new(
            f.store.clone(),
            f.orchestrator.publisher().clone(),
            Arc::new(UnreachableDedup),
            f.cache.clone(),
            f.broadcaster.clone(),
            OrchestratorConfig::default(),
        );

        let health = orchestrator.health_check().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!health.dedup_connected);
        assert!(health.store_connected);
        assert!(health.publisher_healthy);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["publisher"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_match_locks_are_released() {
        let locks = MatchLocks::default();
        {
            let _a = locks.acquire(1).await;
            let _b = locks.acquire(2).await;
        }
        let _c = locks.acquire(3).await;
        assert_eq!(locks.locks.lock().await.len(), 1);
    }
}
