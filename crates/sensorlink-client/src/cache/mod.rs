//! Per-topic record caches.
//!
//! ## Architecture
//!
//! ```text
//! add_measurement ─┐
//! mark_sent ───────┤                       ┌─→ TapeStorage  (<topic>.tape)
//!                  ├─→ [mpsc] ─→ Worker ───┤
//! unsent_records ──┤      coalesces adds   └─→ TableStorage (SQLite)
//! flush / close ───┘      for time_window
//! ```
//!
//! Producers and the submitter talk to a cache through [`RecordCache`].
//! [`DataCache`] is the implementation: a handle in front of one worker
//! task that owns a [`CacheStorage`] backend. `add_measurement` and
//! `mark_sent` only enqueue; queries, `flush` and `close` wait for the
//! worker's reply.
//!
//! ## Guarantees
//!
//! - `unsent_records(limit)` returns stored records oldest first and never
//!   removes them.
//! - `mark_sent(offset)` removes every record up to `offset`, ignores
//!   offsets at or below the last acknowledged one, and never reaches past
//!   the highest offset `unsent_records` has handed out.
//! - Retention pruning removes old records whether or not they were sent.

mod table;
mod tape;
mod worker;

pub use table::{connect_database, TableStorage};
pub use tape::{RecordConverter, TapeStorage};
pub use worker::CacheStorage;

use crate::config::{CacheBackend, CacheConfig};
use crate::error::{ClientError, Result};
use crate::record::{now_ms, Record};
use crate::topic::Topic;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use worker::{CacheCmd, CacheWorker};

/// Storage of one topic's measurements until they are uploaded.
#[async_trait]
pub trait RecordCache: Send + Sync {
    fn topic(&self) -> &Topic;

    /// Queue a measurement for durable storage. Does not wait for disk I/O.
    fn add_measurement(&self, key: Value, value: Value) -> Result<()>;

    /// Up to `limit` unacknowledged records, oldest first.
    async fn unsent_records(&self, limit: usize) -> Result<Vec<Record>>;

    /// Acknowledge every record up to and including `offset`. Does not wait
    /// for disk I/O.
    fn mark_sent(&self, offset: i64) -> Result<()>;

    /// Remove records whose `timeReceived` is before `timestamp_ms`.
    async fn remove_before_timestamp(&self, timestamp_ms: u64) -> Result<usize>;

    /// Unacknowledged records, including those not yet written.
    async fn record_count(&self) -> Result<usize>;

    /// Wait until every queued measurement and acknowledgment is applied.
    async fn flush(&self) -> Result<()>;

    /// Flush and stop the worker.
    async fn close(&self) -> Result<()>;
}

/// A measurement waiting in memory for its durable write.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub key: Value,
    pub value: Value,
    pub enqueued_at_ms: u64,
}

/// Worker-backed [`RecordCache`] over any [`CacheStorage`].
pub struct DataCache {
    topic: Topic,
    cmd_tx: mpsc::UnboundedSender<CacheCmd>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DataCache {
    /// Start a worker for `storage`.
    ///
    /// Must be called within a tokio runtime.
    pub fn new<S: CacheStorage>(topic: Topic, storage: S, time_window: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = CacheWorker::new(topic.name().to_string(), storage, time_window);
        let handle = tokio::spawn(worker.run(cmd_rx));

        Self {
            topic,
            cmd_tx,
            worker_handle: Mutex::new(Some(handle)),
        }
    }

    /// Open a tape-backed cache at `<directory>/<topic>.tape`.
    pub async fn open_tape(topic: Topic, config: &CacheConfig) -> Result<Self> {
        let storage = TapeStorage::open(topic.name(), &config.directory, config.queue).await?;
        Ok(Self::new(topic, storage, config.time_window))
    }

    /// Open a table-backed cache in a shared SQLite pool.
    pub fn open_table(topic: Topic, pool: SqlitePool, config: &CacheConfig) -> Self {
        let storage = TableStorage::new(topic.name(), pool);
        Self::new(topic, storage, config.time_window)
    }

    /// Open the backend selected by `config.backend`.
    ///
    /// `pool` is required for the table backend.
    pub async fn open(topic: Topic, config: &CacheConfig, pool: Option<&SqlitePool>) -> Result<Self> {
        match (config.backend, pool) {
            (CacheBackend::Tape, _) => Self::open_tape(topic, config).await,
            (CacheBackend::Table, Some(pool)) => Ok(Self::open_table(topic, pool.clone(), config)),
            (CacheBackend::Table, None) => Err(ClientError::ConfigError(
                "table backend needs a database pool".to_string(),
            )),
        }
    }

    fn send(&self, cmd: CacheCmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| ClientError::CacheClosed(self.topic.name().to_string()))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> CacheCmd,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await
            .map_err(|_| ClientError::CacheClosed(self.topic.name().to_string()))?
    }
}

#[async_trait]
impl RecordCache for DataCache {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    fn add_measurement(&self, key: Value, value: Value) -> Result<()> {
        self.send(CacheCmd::Add(Measurement {
            key,
            value,
            enqueued_at_ms: now_ms(),
        }))
    }

    async fn unsent_records(&self, limit: usize) -> Result<Vec<Record>> {
        self.request(|reply| CacheCmd::Unsent { limit, reply }).await
    }

    fn mark_sent(&self, offset: i64) -> Result<()> {
        self.send(CacheCmd::MarkSent(offset))
    }

    async fn remove_before_timestamp(&self, timestamp_ms: u64) -> Result<usize> {
        self.request(|reply| CacheCmd::RemoveBefore {
            timestamp_ms,
            reply,
        })
        .await
    }

    async fn record_count(&self) -> Result<usize> {
        self.request(CacheCmd::Count).await
    }

    async fn flush(&self) -> Result<()> {
        self.request(CacheCmd::Flush).await
    }

    async fn close(&self) -> Result<()> {
        let result = match self.request(CacheCmd::Close).await {
            // Closing twice is fine.
            Err(ClientError::CacheClosed(_)) => Ok(()),
            other => other,
        };
        let handle = self
            .worker_handle
            .lock()
            .map_err(|_| ClientError::Internal("cache handle lock poisoned".to_string()))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        result
    }
}

/// The caches of every configured topic, by topic name.
///
/// Cheap to clone; clones share the caches.
#[derive(Clone, Default)]
pub struct CacheRegistry {
    caches: Vec<Arc<dyn RecordCache>>,
    by_name: HashMap<String, usize>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cache. Fails if its topic is already registered.
    pub fn register(&mut self, cache: Arc<dyn RecordCache>) -> Result<()> {
        let name = cache.topic().name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(ClientError::ConfigError(format!(
                "topic '{}' already has a cache",
                name
            )));
        }
        self.by_name.insert(name, self.caches.len());
        self.caches.push(cache);
        Ok(())
    }

    pub fn get(&self, topic: &str) -> Result<&Arc<dyn RecordCache>> {
        self.by_name
            .get(topic)
            .map(|&i| &self.caches[i])
            .ok_or_else(|| ClientError::TopicNotFound(topic.to_string()))
    }

    /// Caches in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn RecordCache>> {
        self.caches.iter()
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

impl Drop for DataCache {
    fn drop(&mut self) {
        // Dropping the sender lets the worker write pending measurements and
        // exit on its own; the handle is detached, not aborted.
        if let Ok(mut guard) = self.worker_handle.lock() {
            guard.take();
        }
    }
}
