//! Submitter - moves cached records to the server
//!
//! One background task owns every sender and runs all activities in turn:
//!
//! ```text
//!                ┌──────────────── select! ─────────────────┐
//! commands ─────→│ try_send, check_connection, upload_now,   │
//!                │ close                                     │
//! next deadline →│ clean │ upload │ heartbeat │ reconnect │   │
//!                │ try-send flush │ held-batch flush         │
//!                └───────────────────────────────────────────┘
//!         connected                          disconnected
//!   upload every upload_interval       reconnect probe after a random
//!   heartbeat every heartbeat_interval delay in [reconnect_min, reconnect_max]
//! ```
//!
//! ## Upload sweep
//!
//! Every cache is drained in batches of `send_limit`. After each batch the
//! cache is acknowledged up to the sender's last sent offset, which may lag
//! the batch when a decorator holds records back. A cache keeps draining
//! while full batches come back and the sender makes progress. Records a
//! decorator holds back are flushed when their
//! [`flush_due_in`](TopicSender::flush_due_in) deadline passes, without
//! waiting for the next sweep.
//!
//! Try-send batches use [`RecordSender::direct_sender`], since their
//! offsets come from the caller and may repeat.
//!
//! ## Disconnects
//!
//! A failed send or heartbeat flips the shared [`ConnectionState`] once,
//! tries one immediate reconnect and otherwise drops pending try-send
//! batches and waits for the reconnect probe. Records in the caches stay
//! there until a later sweep delivers them.
//!
//! Status changes and delivered counts are published on a broadcast
//! channel; lagging listeners lose events, the scheduler never waits.

use crate::cache::{CacheRegistry, RecordCache};
use crate::config::SubmitterConfig;
use crate::error::{ClientError, Result};
use crate::record::{now_ms, Record};
use crate::sender::{ConnectionState, RecordSender, TopicSender};
use crate::topic::Topic;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Connection status reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    /// Configured, not started
    Ready,
    Connecting,
    Connected,
    Uploading,
    UploadingFailed,
    Disconnected,
    /// No sender configured
    Disabled,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerStatus::Ready => "READY",
            ServerStatus::Connecting => "CONNECTING",
            ServerStatus::Connected => "CONNECTED",
            ServerStatus::Uploading => "UPLOADING",
            ServerStatus::UploadingFailed => "UPLOADING_FAILED",
            ServerStatus::Disconnected => "DISCONNECTED",
            ServerStatus::Disabled => "DISABLED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitterEvent {
    Status(ServerStatus),

    /// Records of `topic` delivered by one batch, -1 if the batch failed
    RecordsSent { topic: String, count: i64 },
}

enum Command {
    TrySend { topic: Topic, record: Record },
    CheckConnection,
    Upload(oneshot::Sender<Result<()>>),
    Close,
}

/// Handle to the submitter task.
pub struct Submitter {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: Arc<ConnectionState>,
    events: broadcast::Sender<SubmitterEvent>,
    task: Mutex<Option<SubmitterTask>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Submitter {
    /// Prepare a submitter. Nothing runs until [`start`](Self::start), so
    /// listeners can [`subscribe`](Self::subscribe) first.
    pub fn new(
        caches: CacheRegistry,
        sender: Arc<dyn RecordSender>,
        config: SubmitterConfig,
        retention: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = Arc::new(ConnectionState::new(false));

        let now = Instant::now();
        let task = SubmitterTask {
            caches,
            sender,
            state: Arc::clone(&state),
            events: events.clone(),
            cmd_rx,
            status: ServerStatus::Ready,
            topic_senders: HashMap::new(),
            try_senders: HashMap::new(),
            try_batches: HashMap::new(),
            flush_deadlines: HashMap::new(),
            next_upload: now + config.upload_interval,
            next_clean: now + config.clean_interval,
            next_heartbeat: now + config.heartbeat_interval,
            next_reconnect: None,
            last_activity: now,
            retention,
            config,
        };

        Self {
            cmd_tx,
            state,
            events,
            task: Mutex::new(Some(task)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the background task. Fails if already started.
    pub fn start(&self) -> Result<()> {
        let task = lock(&self.task)?
            .take()
            .ok_or_else(|| ClientError::Internal("submitter already started".to_string()))?;
        *lock(&self.handle)? = Some(tokio::spawn(task.run()));
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubmitterEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Send a record without caching it first.
    ///
    /// Returns false at once when disconnected. Accepted records are
    /// batched per topic and sent after the try-send delay; a failed batch
    /// is lost.
    pub fn try_send(&self, topic: &Topic, offset: i64, key: Value, value: Value) -> bool {
        if !self.state.is_connected() {
            return false;
        }
        self.cmd_tx
            .send(Command::TrySend {
                topic: topic.clone(),
                record: Record::new(offset, key, value),
            })
            .is_ok()
    }

    /// Ask the task to verify the connection now.
    pub fn check_connection(&self) {
        let _ = self.cmd_tx.send(Command::CheckConnection);
    }

    /// Run one upload sweep and wait for it.
    pub async fn upload_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Upload(tx))
            .map_err(|_| ClientError::Internal("submitter is stopped".to_string()))?;
        rx.await
            .map_err(|_| ClientError::Internal("submitter is stopped".to_string()))?
    }

    /// Ask the task to deliver what it can and stop.
    ///
    /// Use [`join`](Self::join) to wait for it.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Wait up to `timeout` for the task to stop. Returns false if it had
    /// to be aborted.
    pub async fn join(&self, timeout: Duration) -> bool {
        let handle = match lock(&self.handle) {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(mut handle) = handle else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Submitter did not stop in time, aborting");
                handle.abort();
                false
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ClientError::Internal("submitter lock poisoned".to_string()))
}

// ============================================================================
// Task
// ============================================================================

struct TryBatch {
    topic: Topic,
    records: Vec<Record>,
    deadline: Instant,
}

struct SubmitterTask {
    caches: CacheRegistry,
    sender: Arc<dyn RecordSender>,
    config: SubmitterConfig,
    retention: Duration,
    state: Arc<ConnectionState>,
    events: broadcast::Sender<SubmitterEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,

    status: ServerStatus,
    topic_senders: HashMap<String, Box<dyn TopicSender>>,
    try_senders: HashMap<String, Box<dyn TopicSender>>,
    try_batches: HashMap<String, TryBatch>,
    /// When each topic sender's held-back records must go out
    flush_deadlines: HashMap<String, Instant>,

    next_upload: Instant,
    next_clean: Instant,
    next_heartbeat: Instant,
    next_reconnect: Option<Instant>,
    /// Last successful contact, on the tokio clock
    last_activity: Instant,
}

impl SubmitterTask {
    async fn run(mut self) {
        info!(topics = self.caches.len(), "Submitter started");

        self.set_status(ServerStatus::Connecting);
        self.check_connection().await;
        self.clean().await;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Close) | None => {
                        self.shutdown().await;
                        break;
                    }
                    Some(cmd) => self.handle(cmd).await,
                },
                _ = sleep_until(deadline) => self.run_due().await,
            }
        }

        info!("Submitter stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::TrySend { topic, record } => self.queue_try_send(topic, record),
            Command::CheckConnection => self.check_connection().await,
            Command::Upload(reply) => {
                let result = if self.state.is_connected() {
                    self.upload().await
                } else {
                    Err(ClientError::Disconnected)
                };
                let _ = reply.send(result);
            }
            // Handled by the run loop
            Command::Close => {}
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.next_clean;
        if self.state.is_connected() {
            deadline = deadline.min(self.next_upload).min(self.next_heartbeat);
            if let Some(flush) = self.try_batches.values().map(|b| b.deadline).min() {
                deadline = deadline.min(flush);
            }
            if let Some(flush) = self.flush_deadlines.values().min() {
                deadline = deadline.min(*flush);
            }
        } else if let Some(reconnect) = self.next_reconnect {
            deadline = deadline.min(reconnect);
        }
        deadline
    }

    async fn run_due(&mut self) {
        let now = Instant::now();

        if now >= self.next_clean {
            self.clean().await;
            self.next_clean = now + self.config.clean_interval;
        }

        if self.state.is_connected() {
            let due: Vec<String> = self
                .try_batches
                .iter()
                .filter(|(_, batch)| batch.deadline <= now)
                .map(|(name, _)| name.clone())
                .collect();
            for name in due {
                self.flush_try_batch(&name).await;
            }

            let held: Vec<String> = self
                .flush_deadlines
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(name, _)| name.clone())
                .collect();
            for name in held {
                if !self.state.is_connected() {
                    break;
                }
                self.flush_held(&name).await;
            }
        }

        if self.state.is_connected() && now >= self.next_upload {
            if let Err(e) = self.upload().await {
                debug!(error = %e, "Upload sweep ended early");
            }
            self.next_upload = Instant::now() + self.config.upload_interval;
        }

        if self.state.is_connected() && now >= self.next_heartbeat {
            self.heartbeat().await;
            self.next_heartbeat = Instant::now() + self.config.heartbeat_interval;
        }

        if !self.state.is_connected() && self.next_reconnect.is_some_and(|at| at <= now) {
            self.next_reconnect = None;
            self.check_connection().await;
        }
    }

    fn set_status(&mut self, status: ServerStatus) {
        if self.status != status {
            debug!(from = %self.status, to = %status, "Server status changed");
            self.status = status;
        }
        let _ = self.events.send(SubmitterEvent::Status(status));
    }

    fn records_sent(&self, topic: &str, count: i64) {
        let _ = self.events.send(SubmitterEvent::RecordsSent {
            topic: topic.to_string(),
            count,
        });
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    async fn check_connection(&mut self) {
        if self.sender.is_connected().await || self.sender.reset_connection().await {
            self.did_connect();
            return;
        }

        if self.state.did_disconnect() {
            // Was connected; the immediate retry just failed.
            self.set_status(ServerStatus::Disconnected);
            self.drop_try_batches().await;
        } else if self.status != ServerStatus::Disconnected {
            self.set_status(ServerStatus::Disconnected);
        }
        self.schedule_reconnect();
    }

    fn did_connect(&mut self) {
        let was_connected = self.state.is_connected();
        self.state.did_connect();
        self.last_activity = Instant::now();
        self.next_reconnect = None;
        if !was_connected {
            let now = Instant::now();
            self.next_upload = now + self.config.upload_interval;
            self.next_heartbeat = now + self.config.heartbeat_interval;
            info!("Connected to server");
            self.set_status(ServerStatus::Connected);
        }
    }

    /// React to a failed send or probe.
    async fn disconnected(&mut self) {
        if !self.state.did_disconnect() {
            return;
        }
        warn!("Lost connection to server");
        self.set_status(ServerStatus::Disconnected);

        if self.sender.reset_connection().await {
            self.did_connect();
            return;
        }
        self.drop_try_batches().await;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let min = self.config.reconnect_min.as_millis() as u64;
        let max = (self.config.reconnect_max.as_millis() as u64).max(min);
        let delay = Duration::from_millis(rand::thread_rng().gen_range(min..=max));
        info!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        self.next_reconnect = Some(Instant::now() + delay);
    }

    async fn heartbeat(&mut self) {
        if self.last_activity.elapsed() <= self.config.idle_probe_after {
            return;
        }
        if self.sender.is_connected().await {
            debug!("Heartbeat probe succeeded");
            self.state.did_connect();
            self.last_activity = Instant::now();
        } else {
            warn!("Heartbeat probe failed");
            self.disconnected().await;
        }
    }

    // ------------------------------------------------------------------------
    // Upload and retention
    // ------------------------------------------------------------------------

    async fn clean(&mut self) {
        let horizon = now_ms().saturating_sub(self.retention.as_millis() as u64);
        let caches: Vec<Arc<dyn RecordCache>> = self.caches.iter().cloned().collect();
        for cache in caches {
            match cache.remove_before_timestamp(horizon).await {
                Ok(0) => {}
                Ok(removed) => {
                    info!(topic = %cache.topic(), removed, "Removed records past retention")
                }
                Err(e) => warn!(topic = %cache.topic(), error = %e, "Retention sweep failed"),
            }
        }
    }

    async fn upload(&mut self) -> Result<()> {
        let caches: Vec<Arc<dyn RecordCache>> = self.caches.iter().cloned().collect();
        let mut sent_any = false;
        let mut uploading = false;

        for cache in caches {
            let topic = cache.topic().clone();
            loop {
                let records = match cache.unsent_records(self.config.send_limit).await {
                    Ok(records) => records,
                    Err(e) => {
                        error!(topic = %topic, error = %e, "Cannot read unsent records");
                        break;
                    }
                };
                if records.is_empty() {
                    break;
                }
                if !uploading {
                    uploading = true;
                    self.set_status(ServerStatus::Uploading);
                }

                let pulled = records.len();
                match self.send_batch(&topic, records).await {
                    Ok((delivered, last_sent)) => {
                        if delivered > 0 {
                            sent_any = true;
                            acknowledge(cache.as_ref(), last_sent);
                            self.records_sent(topic.name(), delivered as i64);
                        }
                        if pulled < self.config.send_limit || delivered == 0 {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(topic = %topic, records = pulled, error = %e, "Upload failed");
                        self.set_status(ServerStatus::UploadingFailed);
                        self.records_sent(topic.name(), -1);
                        self.disconnected().await;
                        return Err(e);
                    }
                }
            }
        }

        if sent_any {
            self.last_activity = Instant::now();
            self.set_status(ServerStatus::Connected);
        } else if uploading {
            self.set_status(ServerStatus::Connected);
        }
        Ok(())
    }

    /// Send one batch. Returns how many of its records were delivered and
    /// the sender's last sent offset.
    async fn send_batch(&mut self, topic: &Topic, records: Vec<Record>) -> Result<(usize, i64)> {
        let mut sender = match self.topic_senders.remove(topic.name()) {
            Some(sender) => sender,
            None => self.sender.sender(topic).await?,
        };

        let before = sender.last_sent_offset();
        let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
        let result = sender.send(records).await;
        if result.is_err() {
            sender.clear().await;
        }
        let last_sent = sender.last_sent_offset();
        self.keep_topic_sender(topic.name(), sender);
        result?;

        let delivered = offsets
            .iter()
            .filter(|&&offset| offset > before && offset <= last_sent)
            .count();
        debug!(topic = %topic, delivered, last_sent, "Batch sent");
        Ok((delivered, last_sent))
    }

    fn keep_topic_sender(&mut self, name: &str, sender: Box<dyn TopicSender>) {
        match sender.flush_due_in() {
            Some(due_in) => {
                self.flush_deadlines.insert(name.to_string(), Instant::now() + due_in);
            }
            None => {
                self.flush_deadlines.remove(name);
            }
        }
        self.topic_senders.insert(name.to_string(), sender);
    }

    /// Flush records a topic sender held back past their age bound.
    async fn flush_held(&mut self, name: &str) {
        self.flush_deadlines.remove(name);
        let Some(mut sender) = self.topic_senders.remove(name) else {
            return;
        };

        let before = sender.last_sent_offset();
        let result = sender.flush().await;
        if result.is_err() {
            sender.clear().await;
        }
        let last_sent = sender.last_sent_offset();
        self.keep_topic_sender(name, sender);

        match result {
            Ok(()) => {
                if last_sent > before {
                    if let Ok(cache) = self.caches.get(name) {
                        acknowledge(cache.as_ref(), last_sent);
                    }
                    self.last_activity = Instant::now();
                    debug!(topic = %name, last_sent, "Held records flushed");
                }
            }
            Err(e) => {
                warn!(topic = %name, error = %e, "Flushing held records failed");
                self.set_status(ServerStatus::UploadingFailed);
                self.records_sent(name, -1);
                self.disconnected().await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Try-send
    // ------------------------------------------------------------------------

    fn queue_try_send(&mut self, topic: Topic, record: Record) {
        if !self.state.is_connected() {
            debug!(topic = %topic, offset = record.offset, "Dropping try-send record while disconnected");
            return;
        }
        let deadline = Instant::now() + self.config.try_send_delay;
        self.try_batches
            .entry(topic.name().to_string())
            .or_insert_with(|| TryBatch {
                topic,
                records: Vec::new(),
                deadline,
            })
            .records
            .push(record);
    }

    async fn flush_try_batch(&mut self, name: &str) {
        let Some(batch) = self.try_batches.remove(name) else {
            return;
        };
        let count = batch.records.len();

        let mut sender = match self.try_senders.remove(name) {
            Some(sender) => sender,
            None => match self.sender.direct_sender(&batch.topic).await {
                Ok(sender) => sender,
                Err(e) => {
                    warn!(topic = %batch.topic, records = count, error = %e, "Discarding try-send batch");
                    return;
                }
            },
        };

        let result = match sender.send(batch.records).await {
            Ok(()) => sender.flush().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.last_activity = Instant::now();
                debug!(topic = %batch.topic, records = count, "Try-send batch sent");
            }
            Err(e) => {
                sender.clear().await;
                warn!(topic = %batch.topic, records = count, error = %e, "Discarding try-send batch");
            }
        }
        self.try_senders.insert(name.to_string(), sender);
    }

    async fn drop_try_batches(&mut self) {
        let dropped: usize = self.try_batches.drain().map(|(_, b)| b.records.len()).sum();
        if dropped > 0 {
            warn!(records = dropped, "Dropped try-send records after disconnect");
        }
        for sender in self.try_senders.values_mut() {
            sender.clear().await;
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    async fn shutdown(&mut self) {
        info!("Submitter closing");

        let caches: Vec<Arc<dyn RecordCache>> = self.caches.iter().cloned().collect();
        let flushed = futures::future::join_all(caches.iter().map(|cache| cache.flush())).await;
        for (cache, result) in caches.iter().zip(flushed) {
            if let Err(e) = result {
                warn!(topic = %cache.topic(), error = %e, "Cannot flush cache");
            }
        }

        if self.state.is_connected() {
            if let Err(e) = self.upload().await {
                warn!(error = %e, "Final upload failed");
            }
        }
        if self.state.is_connected() {
            let names: Vec<String> = self.try_batches.keys().cloned().collect();
            for name in names {
                self.flush_try_batch(&name).await;
            }
        } else {
            self.drop_try_batches().await;
        }

        // Closing flushes records a decorator still holds back
        self.flush_deadlines.clear();
        for (name, mut sender) in self.topic_senders.drain().collect::<Vec<_>>() {
            let before = sender.last_sent_offset();
            if let Err(e) = sender.close().await {
                warn!(topic = %name, error = %e, "Cannot close topic sender");
            }
            let last_sent = sender.last_sent_offset();
            if last_sent > before {
                if let Ok(cache) = self.caches.get(&name) {
                    acknowledge(cache.as_ref(), last_sent);
                }
            }
        }
        for (name, mut sender) in self.try_senders.drain().collect::<Vec<_>>() {
            if let Err(e) = sender.close().await {
                warn!(topic = %name, error = %e, "Cannot close try-send sender");
            }
        }
        if let Err(e) = self.sender.close().await {
            warn!(error = %e, "Cannot close sender");
        }
    }
}

/// Tell a cache its records up to `offset` were delivered.
fn acknowledge(cache: &dyn RecordCache, offset: i64) {
    if let Err(e) = cache.mark_sent(offset) {
        error!(topic = %cache.topic(), offset, error = %e, "Cannot acknowledge records");
    }
}
