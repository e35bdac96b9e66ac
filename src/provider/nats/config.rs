//! NATS backend configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Connection and naming settings for the NATS JetStream backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,

    /// Optional auth token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    pub connect_timeout_secs: u64,

    pub request_timeout_secs: u64,

    pub storage: StorageType,

    /// Prefix isolating this deployment's streams and subjects; empty for none
    pub namespace: String,

    /// Age limit applied to every stream in addition to its entry limit (0 = none)
    pub max_age_secs: u64,

    /// Key/value bucket backing the dedup store
    pub dedup_bucket: String,

    /// Bucket-wide age limit; must cover the longest per-key TTL in use
    pub dedup_max_age_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 5,
            storage: StorageType::File,
            namespace: String::new(),
            max_age_secs: 0,
            dedup_bucket: "rsvp_dedup".to_string(),
            dedup_max_age_secs: 86_400,
        }
    }
}

impl NatsConfig {
    /// JetStream stream name for a logical stream (`rsvp:audit` → `RSVP_AUDIT`)
    pub fn stream_name(&self, logical: &str) -> String {
        let base = sanitize(logical, '_').to_uppercase();
        if self.namespace.is_empty() {
            base
        } else {
            format!("{}_{}", sanitize(&self.namespace, '_').to_uppercase(), base)
        }
    }

    /// Subject a logical stream is published on (`rsvp:audit` → `rsvp.audit`)
    pub fn subject(&self, logical: &str) -> String {
        let base = sanitize(logical, '.');
        if self.namespace.is_empty() {
            base
        } else {
            format!("{}.{}", sanitize(&self.namespace, '_'), base)
        }
    }
}

/// Replace characters JetStream rejects in names and subjects
fn sanitize(name: &str, separator: char) -> String {
    name.chars()
        .map(|c| match c {
            ':' | '.' => separator,
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_without_namespace() {
        let config = NatsConfig::default();
        assert_eq!(config.stream_name("rsvp:audit"), "RSVP_AUDIT");
        assert_eq!(config.subject("rsvp:audit"), "rsvp.audit");
    }

    #[test]
    fn test_names_with_namespace() {
        let config = NatsConfig {
            namespace: "it-run".to_string(),
            ..Default::default()
        };
        assert_eq!(config.stream_name("rsvp:dlq"), "IT-RUN_RSVP_DLQ");
        assert_eq!(config.subject("rsvp:dlq"), "it-run.rsvp.dlq");
    }

    #[test]
    fn test_sanitize_wildcards() {
        let config = NatsConfig::default();
        assert_eq!(config.subject("a*b>c"), "a_b_c");
    }

    #[test]
    fn test_deserialize_partial() {
        let config: NatsConfig =
            serde_json::from_str(r#"{"url": "nats://nats:4222", "storage": "memory"}"#).unwrap();
        assert_eq!(config.url, "nats://nats:4222");
        assert_eq!(config.storage, StorageType::Memory);
        assert_eq!(config.dedup_bucket, "rsvp_dedup");
    }
}
