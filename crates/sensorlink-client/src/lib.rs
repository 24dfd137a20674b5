//! SensorLink Client - Offline-tolerant measurement uploads
//!
//! Measurements are written to a per-topic cache on local storage first and
//! uploaded to a Kafka REST proxy whenever the server is reachable. Nothing
//! leaves a cache until the server has acknowledged it.
//!
//! # Example
//!
//! ```ignore
//! use sensorlink_client::{DataHandler, SensorLinkConfig};
//!
//! let config = SensorLinkConfig::load("sensorlink.toml")?;
//! let mut handler = DataHandler::open(config).await?;
//! handler.start()?;
//!
//! handler.add_measurement(
//!     "android_phone_acceleration",
//!     json!({"userId": "u1", "sourceId": "s1"}),
//!     json!({"time": 1.7e9, "timeReceived": 1.7e9, "x": 0.1, "y": 9.8, "z": 0.0}),
//! )?;
//!
//! handler.close().await?;
//! ```

pub mod cache;
pub mod config;
pub mod encoder;
pub mod error;
pub mod handler;
pub mod record;
pub mod retry;
pub mod schema_registry_client;
pub mod sender;
pub mod submitter;
pub mod topic;

pub use cache::{CacheRegistry, DataCache, RecordCache};
pub use config::{CacheBackend, CacheConfig, SenderConfig, SensorLinkConfig, SubmitterConfig, TopicConfig};
pub use encoder::{AvroJsonEncoder, RecordEncoder};
pub use error::{ClientError, Result};
pub use handler::DataHandler;
pub use record::Record;
pub use retry::{retry_with_backoff, RetryPolicy};
pub use schema_registry_client::{SchemaMetadata, SchemaRegistryClient, SchemaRetriever};
pub use sender::{BatchedSender, ConnectionState, RecordSender, RestSender, ThreadedSender, TopicSender};
pub use submitter::{ServerStatus, Submitter, SubmitterEvent};
pub use topic::{Schema, Topic};
