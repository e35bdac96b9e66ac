//! # rsvp-sync
//!
//! Event-driven RSVP synchronization for league match availability.
//!
//! ## Overview
//!
//! One availability change ("player 7 is now `yes` for match 42") is
//! committed to the primary store, turned into an immutable [`RsvpEvent`],
//! and fanned out to independent durable streams: realtime broadcast, chat
//! sync, analytics, and audit. Publishing is deduplicated, each target
//! write is isolated by its own timeout, and whatever fails lands in a
//! dead-letter stream.
//!
//! ## Quick Start
//!
//! ```rust
//! use rsvp_sync::{
//!     ChannelBroadcaster, EventPublisher, MatchInfo, MemoryDedupStore, MemoryLog,
//!     MemoryResponseStore, MemoryRsvpCache, OrchestratorConfig, PlayerInfo,
//!     PublisherConfig, Response, RsvpUpdateRequest, StreamRegistry, SyncOrchestrator,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> rsvp_sync::Result<()> {
//! let log = Arc::new(MemoryLog::new());
//! let dedup = Arc::new(MemoryDedupStore::new());
//! let publisher = Arc::new(EventPublisher::new(
//!     log,
//!     dedup.clone(),
//!     Arc::new(StreamRegistry::default()),
//!     PublisherConfig::default(),
//! ));
//! publisher.initialize().await?;
//!
//! let store = Arc::new(MemoryResponseStore::new());
//! store.add_match(MatchInfo::new(42)).await;
//! store.add_player(PlayerInfo::new(7, "Alex")).await;
//!
//! let orchestrator = SyncOrchestrator::new(
//!     store,
//!     publisher,
//!     dedup,
//!     Arc::new(MemoryRsvpCache::new()),
//!     Arc::new(ChannelBroadcaster::default()),
//!     OrchestratorConfig::default(),
//! );
//!
//! let outcome = orchestrator
//!     .update(RsvpUpdateRequest::new(42, 7, Response::Yes).with_operation_id("op-1"))
//!     .await?;
//! println!("Published {}", outcome.event_id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **memory** — in-process log with fault injection, for tests and single-process use
//! - **nats** — NATS JetStream streams, durable consumers, and a KV dedup bucket
//!
//! ## Architecture
//!
//! - **DurableLog** trait — append-only stream abstraction all backends implement
//! - **EventPublisher** — dedup, concurrent fan-out, dead-lettering, health
//! - **SyncOrchestrator** — idempotent update path plus the realtime fast path
//! - **StreamRegistry** — logical streams, retention, consumer groups

pub mod config;
pub mod dedup;
pub mod dlq;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod publisher;
pub mod realtime;
pub mod registry;
pub mod store;
pub mod sync;
pub mod types;

// Re-export core types
pub use config::{OrchestratorConfig, PipelineConfig, PublisherConfig};
pub use dedup::{DedupStore, MemoryDedupStore};
pub use dlq::{DeadLetterEvent, DlqHandler, LogDlqHandler};
pub use error::{Result, SyncError};
pub use metrics::{MetricsSnapshot, OrchestratorMetrics, OrchestratorSnapshot, PublisherMetrics};
pub use provider::{DurableLog, GroupCreation, StreamEntry};
pub use publisher::{
    BulkPublishResult, EventPublisher, HealthReport, HealthStatus, InitReport, PublishReport,
    ReplayReport,
};
pub use realtime::{
    CachedRsvp, ChannelBroadcaster, MemoryRsvpCache, RealtimeBroadcaster, RsvpBroadcast, RsvpCache,
};
pub use registry::{StreamConfig, StreamRegistry, DLQ_STREAM, SYNC_STREAM};
pub use store::{
    MatchInfo, MemoryResponseStore, PlayerInfo, ResponseStore, ResponseWrite, StoredResponse,
};
pub use sync::{
    BulkItemResult, BulkRsvpItem, BulkSummary, BulkUpdateResult, MatchSummary, PlayerRsvp,
    ResponseCounts, RsvpUpdateOutcome, RsvpUpdateRequest, ServiceHealth, SyncOrchestrator,
    SyncRequestOutcome, UpdateRsvpBody,
};
pub use types::{
    event_id_for_operation, EventContext, Response, RsvpEvent, RsvpEventType, RsvpSource,
    RsvpSyncEvent, StreamFields, Target, TargetSet,
};

// Re-export backends for convenience
pub use provider::memory::MemoryLog;
pub use provider::nats::{NatsClient, NatsConfig, NatsDedupStore, NatsLog, StorageType};
