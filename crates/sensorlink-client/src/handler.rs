//! Data handler: caches plus submitter lifecycle.
//!
//! ```text
//! add_measurement(topic, ..) ─→ CacheRegistry ─→ DataCache (one per topic)
//!                                    │
//! start() ─→ Submitter ◄─────────────┘
//!              │ RestSender → ThreadedSender → BatchedSender
//!              └─ events ─→ status / records sent per topic
//! ```

use crate::cache::{connect_database, CacheRegistry, DataCache, RecordCache};
use crate::config::{CacheBackend, SensorLinkConfig};
use crate::error::{ClientError, Result};
use crate::sender::{BatchedSender, RecordSender, RestSender, ThreadedSender};
use crate::submitter::{ServerStatus, Submitter, SubmitterEvent};
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug)]
struct Progress {
    status: ServerStatus,
    /// Latest batch count per topic, -1 after a failed batch
    records_sent: HashMap<String, i64>,
}

/// Owns the caches of all configured topics and the submitter that
/// uploads them.
pub struct DataHandler {
    config: SensorLinkConfig,
    caches: CacheRegistry,
    pool: Option<SqlitePool>,
    submitter: Option<Submitter>,
    listener: Option<JoinHandle<()>>,
    progress: Arc<Mutex<Progress>>,
}

impl DataHandler {
    /// Open one cache per configured topic.
    pub async fn open(config: SensorLinkConfig) -> Result<Self> {
        config.validate()?;

        let pool = match config.cache.backend {
            CacheBackend::Table => Some(connect_database(&config.cache.database_url).await?),
            CacheBackend::Tape => None,
        };

        let mut caches = CacheRegistry::new();
        for topic_config in &config.topics {
            let topic = topic_config.to_topic()?;
            let cache = DataCache::open(topic, &config.cache, pool.as_ref()).await?;
            caches.register(Arc::new(cache))?;
        }

        let status = if config.sender.is_some() {
            ServerStatus::Ready
        } else {
            ServerStatus::Disabled
        };
        info!(
            topics = caches.len(),
            backend = ?config.cache.backend,
            status = %status,
            "Data handler opened"
        );

        Ok(Self {
            config,
            caches,
            pool,
            submitter: None,
            listener: None,
            progress: Arc::new(Mutex::new(Progress {
                status,
                records_sent: HashMap::new(),
            })),
        })
    }

    pub fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    /// Queue a measurement in its topic's cache.
    pub fn add_measurement(&self, topic: &str, key: Value, value: Value) -> Result<()> {
        self.caches.get(topic)?.add_measurement(key, value)
    }

    /// Send a measurement directly, skipping the cache. False when not
    /// started or disconnected.
    pub fn try_send(&self, topic: &str, offset: i64, key: Value, value: Value) -> bool {
        let (Some(submitter), Ok(cache)) = (&self.submitter, self.caches.get(topic)) else {
            return false;
        };
        submitter.try_send(cache.topic(), offset, key, value)
    }

    pub fn status(&self) -> ServerStatus {
        self.progress
            .lock()
            .map(|p| p.status)
            .unwrap_or(ServerStatus::Disconnected)
    }

    /// Latest batch count reported for `topic`.
    pub fn records_sent(&self, topic: &str) -> Option<i64> {
        self.progress
            .lock()
            .ok()
            .and_then(|p| p.records_sent.get(topic).copied())
    }

    pub fn is_started(&self) -> bool {
        self.submitter.is_some()
    }

    /// Start uploading through the configured REST endpoints.
    pub fn start(&mut self) -> Result<()> {
        let Some(sender_config) = self.config.sender.clone() else {
            return Err(ClientError::ConfigError(
                "uploading is disabled: no sender configured".to_string(),
            ));
        };
        if self.submitter.is_some() {
            return Err(ClientError::ConfigError("data handler already started".to_string()));
        }

        let rest = RestSender::new(&sender_config)?;
        let threaded = ThreadedSender::new(rest, self.config.submitter.heartbeat_interval);
        let batched = BatchedSender::new(
            Arc::new(threaded),
            sender_config.max_batch_size,
            sender_config.max_batch_age,
        );
        self.start_with_sender(Arc::new(batched))
    }

    /// Start uploading through `sender`.
    pub fn start_with_sender(&mut self, sender: Arc<dyn RecordSender>) -> Result<()> {
        if self.submitter.is_some() {
            return Err(ClientError::ConfigError("data handler already started".to_string()));
        }

        let submitter = Submitter::new(
            self.caches.clone(),
            sender,
            self.config.submitter.clone(),
            self.config.cache.retention,
        );
        let mut events = submitter.subscribe();
        let progress = Arc::clone(&self.progress);
        self.listener = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Ok(mut progress) = progress.lock() {
                            match event {
                                SubmitterEvent::Status(status) => progress.status = status,
                                SubmitterEvent::RecordsSent { topic, count } => {
                                    progress.records_sent.insert(topic, count);
                                }
                            }
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Status listener fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        submitter.start()?;
        self.submitter = Some(submitter);
        info!("Data handler started");
        Ok(())
    }

    /// Stop the submitter, waiting at most the configured join timeout.
    pub async fn stop(&mut self) {
        let Some(submitter) = self.submitter.take() else {
            return;
        };
        submitter.close();
        if !submitter.join(self.config.submitter.join_timeout).await {
            warn!("Submitter was aborted; unsent records stay cached");
        }
        drop(submitter);

        if let Some(listener) = self.listener.take() {
            let _ = listener.await;
        }
        if let Ok(mut progress) = self.progress.lock() {
            progress.status = ServerStatus::Ready;
        }
        info!("Data handler stopped");
    }

    /// Stop uploading and close every cache.
    pub async fn close(mut self) -> Result<()> {
        self.stop().await;

        let caches: Vec<Arc<dyn RecordCache>> = self.caches.iter().cloned().collect();
        let results = futures::future::join_all(caches.iter().map(|cache| cache.close())).await;
        let mut first_error = None;
        for (cache, result) in caches.iter().zip(results) {
            if let Err(e) = result {
                warn!(topic = %cache.topic(), error = %e, "Cannot close cache");
                first_error.get_or_insert(e);
            }
        }

        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        first_error.map_or(Ok(()), Err)
    }
}
