//! In-memory durable log
//!
//! Single-process log for tests and local development. Supports fault
//! injection (failing or slow streams, whole-log outage) so publisher
//! isolation and dead-letter paths can be exercised without a server.

use super::{DurableLog, GroupCreation, StreamEntry};
use crate::error::{Result, SyncError};
use crate::types::StreamFields;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryStream {
    entries: VecDeque<StreamEntry>,
    groups: HashSet<String>,
}

/// In-memory `DurableLog`
#[derive(Default)]
pub struct MemoryLog {
    streams: RwLock<HashMap<String, MemoryStream>>,
    sequence: AtomicU64,
    appends: AtomicU64,
    offline: AtomicBool,
    failing: RwLock<HashSet<String>>,
    delays: RwLock<HashMap<String, Duration>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append to `stream` fail
    pub async fn fail_stream(&self, stream: &str) {
        self.failing.write().await.insert(stream.to_string());
    }

    /// Undo [`fail_stream`](Self::fail_stream)
    pub async fn heal_stream(&self, stream: &str) {
        self.failing.write().await.remove(stream);
    }

    /// Delay every append to `stream`
    pub async fn delay_stream(&self, stream: &str, delay: Duration) {
        self.delays.write().await.insert(stream.to_string(), delay);
    }

    /// Simulate losing the connection entirely
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// All entries of a stream, oldest first
    pub async fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        let streams = self.streams.read().await;
        streams
            .get(stream)
            .map(|s| s.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, stream: &str) -> usize {
        let streams = self.streams.read().await;
        streams.get(stream).map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Entries in `stream` whose `event_id` field matches
    pub async fn count_event(&self, stream: &str, event_id: &str) -> usize {
        let streams = self.streams.read().await;
        streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|e| e.fields.get("event_id").map(String::as_str) == Some(event_id))
                    .count()
            })
            .unwrap_or(0)
    }

    pub async fn groups(&self, stream: &str) -> Vec<String> {
        let streams = self.streams.read().await;
        let mut groups: Vec<String> = streams
            .get(stream)
            .map(|s| s.groups.iter().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Successful appends across all streams
    pub fn total_appends(&self) -> u64 {
        self.appends.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Connection("memory log is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn append(
        &self,
        stream: &str,
        fields: &StreamFields,
        retention_limit: u64,
    ) -> Result<String> {
        self.check_online()?;

        let delay = self.delays.read().await.get(stream).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.read().await.contains(stream) {
            return Err(SyncError::Publish {
                stream: stream.to_string(),
                reason: "injected failure".into(),
            });
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{}", chrono::Utc::now().timestamp_millis(), seq);

        let mut streams = self.streams.write().await;
        let entry = streams.entry(stream.to_string()).or_default();
        entry.entries.push_back(StreamEntry {
            id: id.clone(),
            fields: fields.clone(),
        });
        let limit = usize::try_from(retention_limit).unwrap_or(usize::MAX);
        while limit > 0 && entry.entries.len() > limit {
            entry.entries.pop_front();
        }

        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn ensure_stream(&self, stream: &str, _retention_limit: u64) -> Result<()> {
        self.check_online()?;
        self.streams
            .write()
            .await
            .entry(stream.to_string())
            .or_default();
        Ok(())
    }

    async fn create_consumer_group(&self, stream: &str, group: &str) -> Result<GroupCreation> {
        self.check_online()?;
        let mut streams = self.streams.write().await;
        let entry = streams.entry(stream.to_string()).or_default();
        if entry.groups.insert(group.to_string()) {
            Ok(GroupCreation::Created)
        } else {
            Ok(GroupCreation::AlreadyExists)
        }
    }

    async fn read_last(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        self.check_online()?;
        let streams = self.streams.read().await;
        let stream = streams
            .get(stream)
            .ok_or_else(|| SyncError::Stream(format!("stream '{}' does not exist", stream)))?;
        Ok(stream.entries.iter().rev().take(count).cloned().collect())
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(n: usize) -> StreamFields {
        StreamFields::from([("n".to_string(), n.to_string())])
    }

    #[tokio::test]
    async fn test_append_and_read_last() {
        let log = MemoryLog::new();
        for i in 0..5 {
            log.append("s", &fields(i), 100).await.unwrap();
        }

        let last = log.read_last("s", 2).await.unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].fields["n"], "4");
        assert_eq!(last[1].fields["n"], "3");
        assert_eq!(log.total_appends(), 5);
    }

    #[tokio::test]
    async fn test_retention_trims_oldest() {
        let log = MemoryLog::new();
        for i in 0..10 {
            log.append("s", &fields(i), 3).await.unwrap();
        }
        let entries = log.entries("s").await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].fields["n"], "7");
    }

    #[tokio::test]
    async fn test_consumer_group_idempotent() {
        let log = MemoryLog::new();
        assert_eq!(
            log.create_consumer_group("s", "g").await.unwrap(),
            GroupCreation::Created
        );
        assert_eq!(
            log.create_consumer_group("s", "g").await.unwrap(),
            GroupCreation::AlreadyExists
        );
        assert_eq!(log.groups("s").await, vec!["g"]);
    }

    #[tokio::test]
    async fn test_read_missing_stream() {
        let log = MemoryLog::new();
        assert!(log.read_last("ghost", 1).await.is_err());
        log.ensure_stream("ghost", 10).await.unwrap();
        assert!(log.read_last("ghost", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let log = MemoryLog::new();
        log.fail_stream("s").await;
        let err = log.append("s", &fields(0), 10).await.unwrap_err();
        assert!(matches!(err, SyncError::Publish { .. }));

        log.heal_stream("s").await;
        log.append("s", &fields(0), 10).await.unwrap();
        assert_eq!(log.len("s").await, 1);
    }

    #[tokio::test]
    async fn test_offline() {
        let log = MemoryLog::new();
        log.set_offline(true);
        assert!(matches!(log.ping().await, Err(SyncError::Connection(_))));
        assert!(log.append("s", &fields(0), 10).await.is_err());
        log.set_offline(false);
        assert!(log.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_entry_ids_unique() {
        let log = MemoryLog::new();
        let a = log.append("s", &fields(0), 10).await.unwrap();
        let b = log.append("s", &fields(1), 10).await.unwrap();
        assert_ne!(a, b);
    }
}
