//! Core RSVP event types
//!
//! Events are immutable once built. The wire form is a flat field map (the
//! shape a Redis-Streams-like log stores) carrying a few routing fields plus
//! the full event JSON under `payload`. JSON uses snake_case field names.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Field map appended to a stream
pub type StreamFields = BTreeMap<String, String>;

/// Version tag written alongside every published payload
pub const PUBLISHER_VERSION: &str = "1.0";

/// Namespace for deriving event ids from operation ids
const EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x5f0c_2b1e_8d4a_4c7b_9a61_3e2f_7d10_c4a9);

/// A player's availability for a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Yes,
    No,
    Maybe,
    NoResponse,
}

impl Response {
    /// All valid values, in display order
    pub const ALL: [Response; 4] = [
        Response::Yes,
        Response::No,
        Response::Maybe,
        Response::NoResponse,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Response::Yes => "yes",
            Response::No => "no",
            Response::Maybe => "maybe",
            Response::NoResponse => "no_response",
        }
    }

    /// True for a real answer (anything except `no_response`)
    pub fn is_answer(&self) -> bool {
        !matches!(self, Response::NoResponse)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Response {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Response::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| {
                SyncError::Validation(format!(
                    "Invalid response '{}'. Must be one of: yes, no, maybe, no_response",
                    s
                ))
            })
    }
}

/// System an RSVP change originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsvpSource {
    Mobile,
    Web,
    /// The chat platform (Discord bot)
    #[serde(alias = "chat")]
    Discord,
    Admin,
    System,
    Migration,
}

impl RsvpSource {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            RsvpSource::Mobile => "mobile",
            RsvpSource::Web => "web",
            RsvpSource::Discord => "discord",
            RsvpSource::Admin => "admin",
            RsvpSource::System => "system",
            RsvpSource::Migration => "migration",
        }
    }
}

impl fmt::Display for RsvpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RsvpSource {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mobile" => Ok(RsvpSource::Mobile),
            "web" => Ok(RsvpSource::Web),
            "discord" | "chat" => Ok(RsvpSource::Discord),
            "admin" => Ok(RsvpSource::Admin),
            "system" => Ok(RsvpSource::System),
            "migration" => Ok(RsvpSource::Migration),
            other => Err(SyncError::Validation(format!("Invalid source '{}'", other))),
        }
    }
}

/// Kind of RSVP transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsvpEventType {
    Created,
    Updated,
    Deleted,
    SyncRequested,
}

impl RsvpEventType {
    /// Classify an (old, new) transition
    pub fn classify(old: Response, new: Response) -> Self {
        if !new.is_answer() {
            RsvpEventType::Deleted
        } else if !old.is_answer() {
            RsvpEventType::Created
        } else {
            RsvpEventType::Updated
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RsvpEventType::Created => "created",
            RsvpEventType::Updated => "updated",
            RsvpEventType::Deleted => "deleted",
            RsvpEventType::SyncRequested => "sync_requested",
        }
    }
}

impl fmt::Display for RsvpEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Downstream destination of a published event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Websocket broadcasters
    Realtime,
    /// Chat-platform embed/reaction updaters
    ChatSync,
    Analytics,
    Audit,
}

/// Set of targets, ordered for deterministic fan-out logs
pub type TargetSet = BTreeSet<Target>;

impl Target {
    pub const ALL: [Target; 4] = [
        Target::Realtime,
        Target::ChatSync,
        Target::Analytics,
        Target::Audit,
    ];

    /// Name of the durable stream backing this target
    pub fn stream_name(&self) -> &'static str {
        match self {
            Target::Realtime => "rsvp:websocket",
            Target::ChatSync => "rsvp:discord",
            Target::Analytics => "rsvp:analytics",
            Target::Audit => "rsvp:audit",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Realtime => "realtime",
            Target::ChatSync => "chat_sync",
            Target::Analytics => "analytics",
            Target::Audit => "audit",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional audit/analytics context; null fields are left off the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// One RSVP state transition for a (match, player) aggregate
///
/// Built by the orchestrator, then handed to the publisher by reference.
/// There are no setters; the `with_*` builders consume the value before
/// it is published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsvpEvent {
    event_id: String,
    event_type: RsvpEventType,
    occurred_at: DateTime<Utc>,
    match_id: i64,
    player_id: i64,
    old_response: Response,
    new_response: Response,
    source: RsvpSource,
    trace_id: String,
    operation_id: String,
    #[serde(default = "default_version")]
    version: u32,
    #[serde(flatten)]
    context: EventContext,
}

fn default_version() -> u32 {
    1
}

/// Event id derived from an operation id
///
/// Two events carrying the same operation id share an identity, which is
/// what lets the dedup store suppress replays of one logical intent.
pub fn event_id_for_operation(operation_id: &str) -> String {
    format!(
        "evt-{}",
        Uuid::new_v5(&EVENT_NAMESPACE, operation_id.as_bytes())
    )
}

impl RsvpEvent {
    /// Build an event for an availability transition
    ///
    /// `trace_id` and `operation_id` start as fresh UUIDs; override them with
    /// [`with_trace_id`](Self::with_trace_id) and
    /// [`with_operation_id`](Self::with_operation_id).
    pub fn create_updated(
        match_id: i64,
        player_id: i64,
        old_response: Response,
        new_response: Response,
        source: RsvpSource,
    ) -> Self {
        let operation_id = Uuid::new_v4().to_string();
        Self {
            event_id: event_id_for_operation(&operation_id),
            event_type: RsvpEventType::classify(old_response, new_response),
            occurred_at: Utc::now(),
            match_id,
            player_id,
            old_response,
            new_response,
            source,
            trace_id: Uuid::new_v4().to_string(),
            operation_id,
            version: 1,
            context: EventContext::default(),
        }
    }

    /// Set the caller's operation id; the event id is re-derived from it
    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = operation_id.into();
        self.event_id = event_id_for_operation(&self.operation_id);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> RsvpEventType {
        self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn match_id(&self) -> i64 {
        self.match_id
    }

    pub fn player_id(&self) -> i64 {
        self.player_id
    }

    pub fn old_response(&self) -> Response {
        self.old_response
    }

    pub fn new_response(&self) -> Response {
        self.new_response
    }

    pub fn source(&self) -> RsvpSource {
        self.source
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    /// Old and new responses are identical
    pub fn is_no_op(&self) -> bool {
        self.old_response == self.new_response
    }

    /// Should reach the chat platform; never echoes chat-sourced changes back
    pub fn affects_downstream_chat(&self) -> bool {
        self.source != RsvpSource::Discord && !self.is_no_op()
    }

    pub fn affects_realtime_broadcast(&self) -> bool {
        !self.is_no_op()
    }

    /// `rsvp.<event_type>.match.<match_id>`, for per-match partitioning
    pub fn routing_key(&self) -> String {
        format!("rsvp.{}.match.{}", self.event_type, self.match_id)
    }

    /// Targets an event goes to when the caller names none
    ///
    /// Audit and analytics always; realtime and chat sync only when the
    /// event changes something they display.
    pub fn default_targets(&self) -> TargetSet {
        let mut targets = TargetSet::from([Target::Audit, Target::Analytics]);
        if self.affects_realtime_broadcast() {
            targets.insert(Target::Realtime);
        }
        if self.affects_downstream_chat() {
            targets.insert(Target::ChatSync);
        }
        targets
    }

    /// Encode as a stream field map
    pub fn to_fields(&self) -> Result<StreamFields> {
        let payload = serde_json::to_string(self)?;
        Ok(StreamFields::from([
            ("event_id".to_string(), self.event_id.clone()),
            ("event_type".to_string(), self.event_type.to_string()),
            ("match_id".to_string(), self.match_id.to_string()),
            ("player_id".to_string(), self.player_id.to_string()),
            ("source".to_string(), self.source.to_string()),
            ("trace_id".to_string(), self.trace_id.clone()),
            ("operation_id".to_string(), self.operation_id.clone()),
            ("routing_key".to_string(), self.routing_key()),
            ("publisher_timestamp".to_string(), Utc::now().to_rfc3339()),
            ("publisher_version".to_string(), PUBLISHER_VERSION.to_string()),
            ("payload".to_string(), payload),
        ]))
    }

    /// Decode from a stream field map written by [`to_fields`](Self::to_fields)
    pub fn from_fields(fields: &StreamFields) -> Result<Self> {
        let payload = fields
            .get("payload")
            .ok_or_else(|| SyncError::Validation("stream entry has no payload field".into()))?;
        Ok(serde_json::from_str(payload)?)
    }
}

/// Operator request to reconcile every RSVP of one match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsvpSyncEvent {
    pub event_id: String,
    pub match_id: i64,
    pub requested_by: String,
    pub sync_targets: Vec<Target>,
    /// Reconcile even entries whose state looks unchanged
    #[serde(default)]
    pub force_update: bool,
    pub trace_id: String,
    pub occurred_at: DateTime<Utc>,
}

impl RsvpSyncEvent {
    pub fn new(
        match_id: i64,
        requested_by: impl Into<String>,
        sync_targets: Vec<Target>,
        force_update: bool,
    ) -> Self {
        Self {
            event_id: format!("evt-{}", Uuid::new_v4()),
            match_id,
            requested_by: requested_by.into(),
            sync_targets,
            force_update,
            trace_id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
        }
    }

    pub fn event_type(&self) -> RsvpEventType {
        RsvpEventType::SyncRequested
    }

    pub fn to_fields(&self) -> Result<StreamFields> {
        let payload = serde_json::to_string(self)?;
        Ok(StreamFields::from([
            ("event_id".to_string(), self.event_id.clone()),
            ("event_type".to_string(), self.event_type().to_string()),
            ("match_id".to_string(), self.match_id.to_string()),
            ("requested_by".to_string(), self.requested_by.clone()),
            ("force_update".to_string(), self.force_update.to_string()),
            ("trace_id".to_string(), self.trace_id.clone()),
            ("payload".to_string(), payload),
        ]))
    }
}
