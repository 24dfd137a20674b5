//! Error types for SensorLink client operations.
//!
//! ## Error Handling Strategy
//!
//! - **Transport errors** (`Transport`, `Timeout`, `Disconnected`): the batch
//!   stays in its cache and the submitter switches to reconnect mode.
//! - **Schema errors** (`SchemaRegistryError`): resolved by registering the
//!   schema, or by inlining it in the request.
//! - **Corruption** (`Queue` with a corrupted file): fatal to one cache file,
//!   which is deleted and recreated.
//! - **Record errors** (`SerializationError`): the record is skipped.
//! - **Setup errors** (`InvalidTopic`, `InvalidSchema`, `ConfigError`).
//!
//! Only `Transport`, `Timeout` and `Disconnected` are worth retrying; see
//! [`ClientError::is_retryable`].

use crate::schema_registry_client::SchemaLookupError;
use std::time::Duration;
use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error type for SensorLink client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The ring-buffer file behind a tape cache failed.
    #[error("Queue error: {0}")]
    Queue(#[from] sensorlink_queue::QueueError),

    /// The SQLite database behind a table cache failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Creating the measurement table failed.
    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Topic schemas do not describe a valid measurement topic.
    #[error("Invalid topic '{0}': {1}")]
    InvalidTopic(String, String),

    /// Schema text is not a usable Avro schema.
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// A single record could not be encoded or decoded.
    ///
    /// Fatal to that record only.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Schema registry lookup or registration failed.
    #[error("Schema registry error: {0}")]
    SchemaRegistryError(#[from] SchemaLookupError),

    /// Request could not be delivered or was rejected by the server.
    ///
    /// The whole batch failed; nothing in it counts as sent.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The sender is disconnected and refuses work until reconnected.
    #[error("Sender is disconnected")]
    Disconnected,

    /// The cache worker has stopped.
    #[error("Cache for topic '{0}' is closed")]
    CacheClosed(String),

    /// Unknown topic passed to a registry lookup.
    #[error("Topic '{0}' is not registered")]
    TopicNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::Timeout(_) | ClientError::Disconnected
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Transport(format!("request timed out: {}", e))
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::SerializationError(e.to_string())
    }
}
