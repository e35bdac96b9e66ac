//! Error types for rsvp-sync

use thiserror::Error;

/// Errors that can occur in the RSVP synchronization pipeline
#[derive(Debug, Error)]
pub enum SyncError {
    /// Request failed validation (bad id, unknown response value, batch too large)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced match or player does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent modification of the same aggregate; safe to retry
    #[error("Concurrent update on match {match_id} player {player_id}: expected version {expected:?}, found {actual:?}")]
    Conflict {
        match_id: i64,
        player_id: i64,
        expected: Option<u32>,
        actual: Option<u32>,
    },

    /// Durable log connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Append to a stream failed
    #[error("Failed to append to stream '{stream}': {reason}")]
    Publish {
        stream: String,
        reason: String,
    },

    /// Stream creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer group creation or management error
    #[error("Consumer group error: {0}")]
    Consumer(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Primary store or key/value store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Conflict { .. } | SyncError::Connection(_) | SyncError::Timeout(_)
        )
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, SyncError>;
