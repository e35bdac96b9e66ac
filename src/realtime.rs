//! Realtime fast path
//!
//! A read-optimized cache of current RSVP state and a broadcaster for UI
//! updates. Both are fed directly by the orchestrator, alongside (not
//! after) the durable fan-out. Broadcasts are hints; the durable event is
//! the record.

use crate::error::{Result, SyncError};
use crate::types::{Response, RsvpSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// Cached state of one (match, player) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRsvp {
    pub match_id: i64,
    pub player_id: i64,
    pub response: Response,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait RsvpCache: Send + Sync {
    async fn set(&self, entry: CachedRsvp) -> Result<()>;

    async fn get(&self, match_id: i64, player_id: i64) -> Result<Option<CachedRsvp>>;
}

/// In-memory `RsvpCache`; never moves an entry back to an older version
#[derive(Default)]
pub struct MemoryRsvpCache {
    entries: RwLock<HashMap<(i64, i64), CachedRsvp>>,
}

impl MemoryRsvpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl RsvpCache for MemoryRsvpCache {
    async fn set(&self, entry: CachedRsvp) -> Result<()> {
        let mut entries = self.entries.write().await;
        let key = (entry.match_id, entry.player_id);
        match entries.get(&key) {
            Some(existing) if existing.version > entry.version => {
                tracing::debug!(
                    match_id = entry.match_id,
                    player_id = entry.player_id,
                    cached = existing.version,
                    incoming = entry.version,
                    "Ignoring stale cache write"
                );
            }
            _ => {
                entries.insert(key, entry);
            }
        }
        Ok(())
    }

    async fn get(&self, match_id: i64, player_id: i64) -> Result<Option<CachedRsvp>> {
        Ok(self.entries.read().await.get(&(match_id, player_id)).cloned())
    }
}

/// Message pushed to realtime UI subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsvpBroadcast {
    pub match_id: i64,
    pub player_id: i64,
    pub player_name: Option<String>,
    pub old_response: Response,
    pub response: Response,
    pub source: RsvpSource,
    pub event_id: String,
    pub trace_id: String,
}

impl RsvpBroadcast {
    /// Room subscribers of this match listen on
    pub fn room(&self) -> String {
        format!("match_{}", self.match_id)
    }
}

#[async_trait]
pub trait RealtimeBroadcaster: Send + Sync {
    async fn broadcast(&self, message: RsvpBroadcast) -> Result<()>;
}

/// Broadcaster on a tokio broadcast channel
///
/// Having no subscribers is not an error; slow subscribers lag and drop
/// the oldest messages.
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<RsvpBroadcast>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RsvpBroadcast> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl RealtimeBroadcaster for ChannelBroadcaster {
    async fn broadcast(&self, message: RsvpBroadcast) -> Result<()> {
        let room = message.room();
        if self.tx.receiver_count() == 0 {
            tracing::debug!(room = %room, "No realtime subscribers");
            return Ok(());
        }
        let receivers = self
            .tx
            .send(message)
            .map_err(|e| SyncError::Publish {
                stream: room.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!(room = %room, receivers, "Broadcast RSVP update");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: u32, response: Response) -> CachedRsvp {
        CachedRsvp {
            match_id: 42,
            player_id: 7,
            response,
            version,
            updated_at: Utc::now(),
        }
    }

    fn message() -> RsvpBroadcast {
        RsvpBroadcast {
            match_id: 42,
            player_id: 7,
            player_name: Some("Alex".into()),
            old_response: Response::NoResponse,
            response: Response::Yes,
            source: RsvpSource::Mobile,
            event_id: "evt-1".into(),
            trace_id: "trace-1".into(),
        }
    }

    #[tokio::test]
    async fn test_cache_keeps_newest_version() {
        let cache = MemoryRsvpCache::new();
        cache.set(entry(2, Response::No)).await.unwrap();
        cache.set(entry(1, Response::Yes)).await.unwrap();

        let cached = cache.get(42, 7).await.unwrap().unwrap();
        assert_eq!(cached.response, Response::No);

        cache.set(entry(3, Response::Maybe)).await.unwrap();
        assert_eq!(cache.get(42, 7).await.unwrap().unwrap().version, 3);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let broadcaster = ChannelBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast(message()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.room(), "match_42");
        assert_eq!(received.response, Response::Yes);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_ok() {
        let broadcaster = ChannelBroadcaster::default();
        assert!(broadcaster.broadcast(message()).await.is_ok());
    }
}
