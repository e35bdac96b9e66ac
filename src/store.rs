//! Primary store collaborator
//!
//! The relational store of matches, players, and availability rows lives
//! outside this crate. `ResponseStore` is the slice of it the orchestrator
//! needs. Writes are version-checked so concurrent updates to one
//! (match, player) pair surface as `SyncError::Conflict`.

use crate::error::{Result, SyncError};
use crate::types::Response;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchInfo {
    pub id: i64,
    pub home_team_id: Option<i64>,
    pub away_team_id: Option<i64>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl MatchInfo {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            home_team_id: None,
            away_team_id: None,
            scheduled_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: i64,
    pub name: String,
    pub discord_id: Option<String>,
    pub team_id: Option<i64>,
}

impl PlayerInfo {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            discord_id: None,
            team_id: None,
        }
    }
}

/// A committed availability row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub response: Response,
    /// Monotonic per (match, player), including across deletes
    pub version: u32,
    pub responded_at: DateTime<Utc>,
    pub operation_id: String,
    pub trace_id: String,
}

/// Values written with an upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseWrite {
    pub response: Response,
    pub operation_id: String,
    pub trace_id: String,
}

/// Availability storage used by the orchestrator
///
/// `expected_version` is the version the caller read (`None` when it saw no
/// row). A mismatch with the committed version fails with
/// `SyncError::Conflict` and changes nothing.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn find_match(&self, match_id: i64) -> Result<Option<MatchInfo>>;

    async fn find_player(&self, player_id: i64) -> Result<Option<PlayerInfo>>;

    async fn get_current_response(
        &self,
        match_id: i64,
        player_id: i64,
    ) -> Result<Option<StoredResponse>>;

    /// Insert or replace the row; returns the new version
    async fn upsert_response(
        &self,
        match_id: i64,
        player_id: i64,
        write: ResponseWrite,
        expected_version: Option<u32>,
    ) -> Result<u32>;

    /// Remove the row; returns the version of the deletion
    async fn delete_response(
        &self,
        match_id: i64,
        player_id: i64,
        expected_version: Option<u32>,
    ) -> Result<u32>;

    /// Every committed row for a match, keyed by player id
    async fn list_responses(&self, match_id: i64) -> Result<Vec<(i64, StoredResponse)>>;

    /// Last version handed out for the pair, including deletions; 0 if none
    async fn last_version(&self, match_id: i64, player_id: i64) -> Result<u32>;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<()> {
        self.find_match(0).await.map(|_| ())
    }
}

type Key = (i64, i64);

#[derive(Default)]
struct Tables {
    matches: HashMap<i64, MatchInfo>,
    players: HashMap<i64, PlayerInfo>,
    responses: HashMap<Key, StoredResponse>,
    /// Last version handed out, kept after deletes
    versions: HashMap<Key, u32>,
}

/// In-memory `ResponseStore`
#[derive(Default)]
pub struct MemoryResponseStore {
    tables: RwLock<Tables>,
    writes: AtomicU64,
    offline: AtomicBool,
}

impl MemoryResponseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_match(&self, info: MatchInfo) {
        self.tables.write().await.matches.insert(info.id, info);
    }

    pub async fn add_player(&self, info: PlayerInfo) {
        self.tables.write().await.players.insert(info.id, info);
    }

    /// Committed upserts and deletes
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every call fail as if the database were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Store("response store is offline".into()));
        }
        Ok(())
    }

    fn check_version(
        tables: &Tables,
        key: Key,
        expected: Option<u32>,
    ) -> Result<()> {
        let actual = tables.responses.get(&key).map(|r| r.version);
        if actual != expected {
            return Err(SyncError::Conflict {
                match_id: key.0,
                player_id: key.1,
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn next_version(tables: &mut Tables, key: Key) -> u32 {
        let version = tables.versions.entry(key).or_insert(0);
        *version += 1;
        *version
    }
}

#[async_trait]
impl ResponseStore for MemoryResponseStore {
    async fn find_match(&self, match_id: i64) -> Result<Option<MatchInfo>> {
        self.check_online()?;
        Ok(self.tables.read().await.matches.get(&match_id).cloned())
    }

    async fn find_player(&self, player_id: i64) -> Result<Option<PlayerInfo>> {
        self.check_online()?;
        Ok(self.tables.read().await.players.get(&player_id).cloned())
    }

    async fn get_current_response(
        &self,
        match_id: i64,
        player_id: i64,
    ) -> Result<Option<StoredResponse>> {
        self.check_online()?;
        let tables = self.tables.read().await;
        Ok(tables.responses.get(&(match_id, player_id)).cloned())
    }

    async fn upsert_response(
        &self,
        match_id: i64,
        player_id: i64,
        write: ResponseWrite,
        expected_version: Option<u32>,
    ) -> Result<u32> {
        if !write.response.is_answer() {
            return Err(SyncError::Validation(
                "no_response is stored as a deletion, not an upsert".into(),
            ));
        }

        self.check_online()?;
        let key = (match_id, player_id);
        let mut tables = self.tables.write().await;
        Self::check_version(&tables, key, expected_version)?;

        let version = Self::next_version(&mut tables, key);
        tables.responses.insert(
            key,
            StoredResponse {
                response: write.response,
                version,
                responded_at: Utc::now(),
                operation_id: write.operation_id,
                trace_id: write.trace_id,
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn delete_response(
        &self,
        match_id: i64,
        player_id: i64,
        expected_version: Option<u32>,
    ) -> Result<u32> {
        self.check_online()?;
        let key = (match_id, player_id);
        let mut tables = self.tables.write().await;
        Self::check_version(&tables, key, expected_version)?;

        tables.responses.remove(&key);
        let version = Self::next_version(&mut tables, key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn list_responses(&self, match_id: i64) -> Result<Vec<(i64, StoredResponse)>> {
        self.check_online()?;
        let tables = self.tables.read().await;
        let mut rows: Vec<(i64, StoredResponse)> = tables
            .responses
            .iter()
            .filter(|((m, _), _)| *m == match_id)
            .map(|((_, p), r)| (*p, r.clone()))
            .collect();
        rows.sort_by_key(|(player_id, _)| *player_id);
        Ok(rows)
    }

    async fn last_version(&self, match_id: i64, player_id: i64) -> Result<u32> {
        self.check_online()?;
        let tables = self.tables.read().await;
        Ok(tables.versions.get(&(match_id, player_id)).copied().unwrap_or(0))
    }
}
