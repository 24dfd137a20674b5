//! Configuration for caches, senders and the submitter.
//!
//! Everything loads from one TOML file. Durations are written in
//! milliseconds (`*_ms` keys); every key has a default, so a minimal file is
//! just the sender URLs and the topics:
//!
//! ```toml
//! [sender]
//! rest_url = "https://ingest.example.org/kafka"
//! schema_registry_url = "https://ingest.example.org/schema"
//!
//! [cache]
//! backend = "tape"
//! directory = "./data/cache"
//!
//! [[topics]]
//! name = "android_phone_acceleration"
//! key_schema = '{"type": "record", "name": "Key", "fields": [...]}'
//! value_schema = '{"type": "record", "name": "Acceleration", "fields": [...]}'
//! ```
//!
//! `SENSORLINK_REST_URL` and `SENSORLINK_SCHEMA_REGISTRY_URL` override the
//! sender URLs from the file.

use crate::error::{ClientError, Result};
use crate::topic::{Schema, Topic};
use sensorlink_queue::QueueFileConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const REST_URL_ENV: &str = "SENSORLINK_REST_URL";
pub const SCHEMA_REGISTRY_URL_ENV: &str = "SENSORLINK_SCHEMA_REGISTRY_URL";

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Storage backend for record caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// One ring-buffer file per topic
    #[default]
    Tape,

    /// One SQLite database shared by all topics
    Table,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Directory holding `<topic>.tape` files (tape backend)
    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,

    /// SQLite database URL (table backend)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// How long measurements are coalesced in memory before one durable write
    #[serde(
        rename = "time_window_ms",
        with = "duration_ms",
        default = "default_time_window"
    )]
    pub time_window: Duration,

    /// Records whose `timeReceived` is older than this are pruned
    #[serde(
        rename = "retention_ms",
        with = "duration_ms",
        default = "default_retention"
    )]
    pub retention: Duration,

    /// Ring-buffer sizing (tape backend)
    #[serde(default)]
    pub queue: QueueFileConfig,
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from("./data/cache")
}

fn default_database_url() -> String {
    "sqlite://./data/measurements.db".to_string()
}

fn default_time_window() -> Duration {
    Duration::from_millis(2500)
}

fn default_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            directory: default_cache_directory(),
            database_url: default_database_url(),
            time_window: default_time_window(),
            retention: default_retention(),
            queue: QueueFileConfig::default(),
        }
    }
}

// ============================================================================
// Submitter
// ============================================================================

/// Schedule of the submitter's background activities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitterConfig {
    /// Upload sweep period (default: 10s)
    #[serde(rename = "upload_interval_ms", with = "duration_ms", default = "default_upload_interval")]
    pub upload_interval: Duration,

    /// Retention sweep period (default: 1h)
    #[serde(rename = "clean_interval_ms", with = "duration_ms", default = "default_clean_interval")]
    pub clean_interval: Duration,

    /// Heartbeat period (default: 60s)
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Idle time after which a heartbeat probes the sender (default: 15s)
    #[serde(rename = "idle_probe_after_ms", with = "duration_ms", default = "default_idle_probe_after")]
    pub idle_probe_after: Duration,

    /// Lower bound of the randomized reconnect delay (default: 5min)
    #[serde(rename = "reconnect_min_ms", with = "duration_ms", default = "default_reconnect_min")]
    pub reconnect_min: Duration,

    /// Upper bound of the randomized reconnect delay (default: 15min)
    #[serde(rename = "reconnect_max_ms", with = "duration_ms", default = "default_reconnect_max")]
    pub reconnect_max: Duration,

    /// Records drained from one cache per upload iteration (default: 5000)
    #[serde(default = "default_send_limit")]
    pub send_limit: usize,

    /// Delay before a try-send batch is flushed (default: 5s)
    #[serde(rename = "try_send_delay_ms", with = "duration_ms", default = "default_try_send_delay")]
    pub try_send_delay: Duration,

    /// Upper bound on waiting for the submitter to stop (default: 5s)
    #[serde(rename = "join_timeout_ms", with = "duration_ms", default = "default_join_timeout")]
    pub join_timeout: Duration,
}

fn default_upload_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_clean_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_probe_after() -> Duration {
    Duration::from_secs(15)
}

fn default_reconnect_min() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_send_limit() -> usize {
    5000
}

fn default_try_send_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            upload_interval: default_upload_interval(),
            clean_interval: default_clean_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            idle_probe_after: default_idle_probe_after(),
            reconnect_min: default_reconnect_min(),
            reconnect_max: default_reconnect_max(),
            send_limit: default_send_limit(),
            try_send_delay: default_try_send_delay(),
            join_timeout: default_join_timeout(),
        }
    }
}

// ============================================================================
// Sender
// ============================================================================

/// Remote endpoints and decorator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Base URL of the REST proxy (`{rest_url}/topics/{name}`)
    pub rest_url: String,

    /// Base URL of the schema registry
    pub schema_registry_url: String,

    /// Records per forwarded request (default: 1000)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Longest a record waits in the batching decorator (default: 10s)
    #[serde(rename = "max_batch_age_ms", with = "duration_ms", default = "default_max_batch_age")]
    pub max_batch_age: Duration,

    /// HTTP request timeout (default: 10s)
    #[serde(rename = "request_timeout_ms", with = "duration_ms", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_batch_age() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

impl SenderConfig {
    pub fn new(rest_url: impl Into<String>, schema_registry_url: impl Into<String>) -> Self {
        Self {
            rest_url: rest_url.into(),
            schema_registry_url: schema_registry_url.into(),
            max_batch_size: default_max_batch_size(),
            max_batch_age: default_max_batch_age(),
            request_timeout: default_request_timeout(),
        }
    }
}

// ============================================================================
// Topics and top level
// ============================================================================

/// A topic with its schemas as JSON text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    pub key_schema: String,
    pub value_schema: String,
}

impl TopicConfig {
    pub fn to_topic(&self) -> Result<Topic> {
        Topic::new(
            self.name.clone(),
            Schema::parse(&self.key_schema)?,
            Schema::parse(&self.value_schema)?,
        )
    }
}

/// Complete configuration of a SensorLink uploader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorLinkConfig {
    #[serde(default)]
    pub topics: Vec<TopicConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub submitter: SubmitterConfig,

    /// Remote endpoints. Without them uploading is disabled.
    #[serde(default)]
    pub sender: Option<SenderConfig>,
}

impl SensorLinkConfig {
    /// Load a TOML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ClientError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides(
            std::env::var(REST_URL_ENV).ok(),
            std::env::var(SCHEMA_REGISTRY_URL_ENV).ok(),
        );
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ClientError::ConfigError(e.to_string()))
    }

    /// Save the configuration as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| ClientError::ConfigError(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self, rest_url: Option<String>, registry_url: Option<String>) {
        match (&mut self.sender, rest_url, registry_url) {
            (Some(sender), rest, registry) => {
                if let Some(rest) = rest {
                    sender.rest_url = rest;
                }
                if let Some(registry) = registry {
                    sender.schema_registry_url = registry;
                }
            }
            (None, Some(rest), Some(registry)) => {
                self.sender = Some(SenderConfig::new(rest, registry));
            }
            (None, _, _) => {}
        }
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        let submitter = &self.submitter;
        if submitter.reconnect_min > submitter.reconnect_max {
            return Err(ClientError::ConfigError(format!(
                "reconnect_min ({:?}) exceeds reconnect_max ({:?})",
                submitter.reconnect_min, submitter.reconnect_max
            )));
        }
        if submitter.send_limit == 0 {
            return Err(ClientError::ConfigError("send_limit must be positive".into()));
        }
        if let Some(sender) = &self.sender {
            if sender.max_batch_size == 0 {
                return Err(ClientError::ConfigError(
                    "max_batch_size must be positive".into(),
                ));
            }
        }
        let mut names = std::collections::HashSet::new();
        for topic in &self.topics {
            if !names.insert(topic.name.as_str()) {
                return Err(ClientError::ConfigError(format!(
                    "topic '{}' is configured twice",
                    topic.name
                )));
            }
        }
        Ok(())
    }
}
