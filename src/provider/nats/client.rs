//! NATS JetStream client — connect, append, consumer groups, read-back

use super::config::{NatsConfig, StorageType};
use crate::error::{Result, SyncError};
use crate::provider::{GroupCreation, StreamEntry};
use crate::types::StreamFields;
use async_nats::jetstream;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// NATS JetStream client
///
/// One JetStream stream per logical stream, created on first use and
/// cached by logical name.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// JetStream context
    jetstream: jetstream::Context,

    /// Stream handles by logical name; cloned out before any I/O
    streams: Mutex<HashMap<String, jetstream::stream::Stream>>,

    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| SyncError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            streams: Mutex::new(HashMap::new()),
            config: Arc::new(config),
        })
    }

    /// Create the JetStream stream for `stream` if this client has not yet
    pub async fn ensure_stream(&self, stream: &str, retention_limit: u64) -> Result<()> {
        if self.streams.lock().await.contains_key(stream) {
            return Ok(());
        }
        // Concurrent creators race on get_or_create; the first cached handle wins
        let handle = create_stream(&self.jetstream, &self.config, stream, retention_limit).await?;
        self.streams
            .lock()
            .await
            .entry(stream.to_string())
            .or_insert(handle);
        Ok(())
    }

    /// Clone of a cached stream handle
    async fn stream_handle(&self, stream: &str) -> Result<jetstream::stream::Stream> {
        self.streams.lock().await.get(stream).cloned().ok_or_else(|| {
            SyncError::Stream(format!("stream '{}' has not been initialized", stream))
        })
    }

    /// Append a field map, returning the JetStream sequence as the entry id
    pub async fn append(
        &self,
        stream: &str,
        fields: &StreamFields,
        retention_limit: u64,
    ) -> Result<String> {
        self.ensure_stream(stream, retention_limit).await?;

        let payload = Bytes::from(serde_json::to_vec(fields)?);
        let subject = self.config.subject(stream);

        let ack = self
            .jetstream
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| SyncError::Publish {
                stream: stream.to_string(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| SyncError::Publish {
                stream: stream.to_string(),
                reason: format!("ack failed: {}", e),
            })?;

        tracing::debug!(
            stream = stream,
            subject = %subject,
            sequence = ack.sequence,
            "Entry appended"
        );

        Ok(ack.sequence.to_string())
    }

    /// Create a durable pull consumer named `group` unless it already exists
    pub async fn create_consumer_group(&self, stream: &str, group: &str) -> Result<GroupCreation> {
        let handle = self.stream_handle(stream).await?;

        if handle
            .get_consumer::<jetstream::consumer::pull::Config>(group)
            .await
            .is_ok()
        {
            tracing::debug!(stream = stream, group = group, "Consumer group already exists");
            return Ok(GroupCreation::AlreadyExists);
        }

        handle
            .create_consumer(jetstream::consumer::pull::Config {
                durable_name: Some(group.to_string()),
                filter_subject: self.config.subject(stream),
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                SyncError::Consumer(format!(
                    "Failed to create consumer group '{}' on '{}': {}",
                    group, stream, e
                ))
            })?;

        tracing::info!(stream = stream, group = group, "Consumer group created");
        Ok(GroupCreation::Created)
    }

    /// Fetch the last `count` entries, newest first
    pub async fn read_last(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let mut handle = self.stream_handle(stream).await?;

        let info = handle
            .info()
            .await
            .map_err(|e| SyncError::Stream(format!("Failed to get stream info: {}", e)))?;

        if info.state.messages == 0 || count == 0 {
            return Ok(Vec::new());
        }

        let start = info
            .state
            .last_sequence
            .saturating_sub(count as u64 - 1)
            .max(info.state.first_sequence);

        let consumer = handle
            .create_consumer(jetstream::consumer::pull::Config {
                deliver_policy: jetstream::consumer::DeliverPolicy::ByStartSequence {
                    start_sequence: start,
                },
                ack_policy: jetstream::consumer::AckPolicy::None,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                SyncError::Consumer(format!("Failed to create read-back consumer: {}", e))
            })?;

        let batch = consumer
            .fetch()
            .max_messages(count)
            .expires(Duration::from_secs(self.config.request_timeout_secs))
            .messages()
            .await
            .map_err(|e| SyncError::Stream(format!("Failed to fetch entries: {}", e)))?;

        let mut entries = Vec::with_capacity(count);
        let mut batch = std::pin::pin!(batch);
        while let Some(msg) = batch.next().await {
            match msg {
                Ok(msg) => {
                    let id = msg
                        .info()
                        .map(|i| i.stream_sequence.to_string())
                        .unwrap_or_default();
                    match serde_json::from_slice::<StreamFields>(&msg.payload) {
                        Ok(fields) => entries.push(StreamEntry { id, fields }),
                        Err(e) => tracing::warn!(stream = stream, error = %e, "Skipping undecodable entry"),
                    }
                    if entries.len() >= count {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(stream = stream, error = %e, "Error fetching entry");
                    break;
                }
            }
        }

        entries.reverse();
        Ok(entries)
    }

    /// Round-trip to the server
    pub async fn ping(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| SyncError::Connection(format!("{}: {}", self.config.url, e)))
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Get the JetStream context
    pub fn jetstream_context(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

pub(crate) fn storage_type(storage: StorageType) -> jetstream::stream::StorageType {
    match storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    }
}

/// Get or create the JetStream stream backing a logical stream
async fn create_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
    stream: &str,
    retention_limit: u64,
) -> Result<jetstream::stream::Stream> {
    let name = config.stream_name(stream);
    let stream_config = jetstream::stream::Config {
        name: name.clone(),
        subjects: vec![config.subject(stream)],
        storage: storage_type(config.storage),
        max_messages: i64::try_from(retention_limit).unwrap_or(i64::MAX),
        max_age: Duration::from_secs(config.max_age_secs),
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let handle = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| SyncError::Stream(format!("Failed to create/get stream '{}': {}", name, e)))?;

    tracing::info!(
        stream = stream,
        jetstream = %name,
        retention_limit,
        "JetStream stream ready"
    );

    Ok(handle)
}
