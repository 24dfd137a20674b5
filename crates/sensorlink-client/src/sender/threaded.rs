//! Threaded decorator: the wrapped sender lives on one worker task.
//!
//! ## Architecture
//!
//! ```text
//! ThreadedTopicSender ─┐
//! ThreadedTopicSender ─┼─→ [bounded mpsc: Job] ─→ Worker ─→ inner RecordSender
//! is_connected ────────┘                           │
//!        ▲                                         ▼
//!        └──────── ConnectionState ◄──── success / final failure
//! ```
//!
//! Jobs run one at a time, so at most one request is in flight and callers
//! queue behind it. A send is attempted up to three times; when the last
//! attempt fails the connection is marked disconnected.
//!
//! `is_connected` answers without I/O while a recent contact exists. Past
//! that window it queues a probe; concurrent callers wait on the same one.

use super::{ConnectionState, RecordSender, TopicSender};
use crate::error::{ClientError, Result};
use crate::record::Record;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::topic::Topic;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Slack on top of the heartbeat interval before a contact counts as stale.
pub const HEARTBEAT_MARGIN: Duration = Duration::from_secs(10);

const JOB_QUEUE_CAPACITY: usize = 128;

type ProbeWaiters = Arc<Mutex<Vec<oneshot::Sender<bool>>>>;

enum Job {
    Open {
        topic: Topic,
        reply: oneshot::Sender<Result<u64>>,
    },
    /// Replies with the topic sender's last sent offset
    Send {
        id: u64,
        records: Vec<Record>,
        reply: oneshot::Sender<Result<i64>>,
    },
    Flush {
        id: u64,
        reply: oneshot::Sender<Result<i64>>,
    },
    Clear {
        id: u64,
        reply: oneshot::Sender<()>,
    },
    CloseTopic {
        id: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Answers everyone in the probe waiter list
    Probe,
    Reset(oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<Result<()>>),
}

/// [`RecordSender`] that runs the wrapped sender on its own task.
pub struct ThreadedSender {
    job_tx: mpsc::Sender<Job>,
    state: Arc<ConnectionState>,
    probe_waiters: ProbeWaiters,
    contact_window: Duration,
    close_timeout: Duration,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedSender {
    /// Wrap `inner`. Contacts older than `heartbeat_interval` plus
    /// [`HEARTBEAT_MARGIN`] are re-checked by a probe.
    ///
    /// Must be called within a tokio runtime.
    pub fn new<S: RecordSender + 'static>(inner: S, heartbeat_interval: Duration) -> Self {
        Self::with_policy(inner, heartbeat_interval, RetryPolicy::default())
    }

    pub fn with_policy<S: RecordSender + 'static>(
        inner: S,
        heartbeat_interval: Duration,
        policy: RetryPolicy,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let state = Arc::new(ConnectionState::new(false));
        let probe_waiters: ProbeWaiters = Arc::new(Mutex::new(Vec::new()));

        let worker = Worker {
            inner: Box::new(inner),
            senders: HashMap::new(),
            next_id: 0,
            policy,
            state: Arc::clone(&state),
            probe_waiters: Arc::clone(&probe_waiters),
        };
        let handle = tokio::spawn(worker.run(job_rx));

        Self {
            job_tx,
            state,
            probe_waiters,
            contact_window: heartbeat_interval + HEARTBEAT_MARGIN,
            close_timeout: Duration::from_secs(5),
            worker_handle: Mutex::new(Some(handle)),
        }
    }

    /// How long a successful contact keeps `is_connected` from probing.
    pub fn with_contact_window(mut self, window: Duration) -> Self {
        self.contact_window = window;
        self
    }

    /// Upper bound on waiting for queued jobs in [`close`](RecordSender::close).
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn connection_state(&self) -> Arc<ConnectionState> {
        Arc::clone(&self.state)
    }

    fn answer_waiters(&self, connected: bool) {
        if let Ok(mut waiters) = self.probe_waiters.lock() {
            for waiter in waiters.drain(..) {
                let _ = waiter.send(connected);
            }
        }
    }
}

async fn request<T>(
    job_tx: &mpsc::Sender<Job>,
    make: impl FnOnce(oneshot::Sender<T>) -> Job,
) -> std::result::Result<T, ClientError> {
    let (tx, rx) = oneshot::channel();
    job_tx
        .send(make(tx))
        .await
        .map_err(|_| ClientError::Internal("sender worker stopped".to_string()))?;
    rx.await
        .map_err(|_| ClientError::Internal("sender worker dropped the job".to_string()))
}

#[async_trait]
impl RecordSender for ThreadedSender {
    async fn sender(&self, topic: &Topic) -> Result<Box<dyn TopicSender>> {
        let topic = topic.clone();
        let id = request(&self.job_tx, |reply| Job::Open {
            topic: topic.clone(),
            reply,
        })
        .await??;

        Ok(Box::new(ThreadedTopicSender {
            topic,
            id,
            job_tx: self.job_tx.clone(),
            last_sent_offset: -1,
        }))
    }

    async fn is_connected(&self) -> bool {
        if !self.state.is_connected() {
            return false;
        }
        if self.state.since_last_connection() < self.contact_window {
            return true;
        }

        let (tx, rx) = oneshot::channel();
        let first = match self.probe_waiters.lock() {
            Ok(mut waiters) => {
                waiters.push(tx);
                waiters.len() == 1
            }
            Err(_) => return false,
        };
        if first && self.job_tx.send(Job::Probe).await.is_err() {
            self.answer_waiters(false);
        }
        rx.await.unwrap_or(false)
    }

    async fn reset_connection(&self) -> bool {
        request(&self.job_tx, Job::Reset).await.unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        let result = match tokio::time::timeout(self.close_timeout, request(&self.job_tx, Job::Shutdown)).await {
            Ok(Ok(closed)) => closed,
            // Already stopped
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(ClientError::Timeout(self.close_timeout)),
        };

        let handle = self
            .worker_handle
            .lock()
            .map_err(|_| ClientError::Internal("sender handle lock poisoned".to_string()))?
            .take();
        if let Some(handle) = handle {
            if result.is_err() {
                handle.abort();
            } else {
                let _ = handle.await;
            }
        }
        self.answer_waiters(false);
        result
    }
}

/// Handle to one topic sender on the worker.
pub struct ThreadedTopicSender {
    topic: Topic,
    id: u64,
    job_tx: mpsc::Sender<Job>,
    last_sent_offset: i64,
}

#[async_trait]
impl TopicSender for ThreadedTopicSender {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    async fn send(&mut self, records: Vec<Record>) -> Result<()> {
        let id = self.id;
        self.last_sent_offset =
            request(&self.job_tx, |reply| Job::Send { id, records, reply }).await??;
        Ok(())
    }

    fn last_sent_offset(&self) -> i64 {
        self.last_sent_offset
    }

    async fn flush(&mut self) -> Result<()> {
        let id = self.id;
        self.last_sent_offset = request(&self.job_tx, |reply| Job::Flush { id, reply }).await??;
        Ok(())
    }

    async fn clear(&mut self) {
        let id = self.id;
        let _ = request(&self.job_tx, |reply| Job::Clear { id, reply }).await;
    }

    async fn close(&mut self) -> Result<()> {
        let id = self.id;
        match request(&self.job_tx, |reply| Job::CloseTopic { id, reply }).await {
            Ok(result) => result,
            // Closed along with the worker
            Err(_) => Ok(()),
        }
    }
}

/// Owns the wrapped sender and its topic senders.
struct Worker {
    inner: Box<dyn RecordSender>,
    senders: HashMap<u64, Box<dyn TopicSender>>,
    next_id: u64,
    policy: RetryPolicy,
    state: Arc<ConnectionState>,
    probe_waiters: ProbeWaiters,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Job>) {
        while let Some(job) = rx.recv().await {
            match job {
                Job::Open { topic, reply } => {
                    let result = self.open(&topic).await;
                    let _ = reply.send(result);
                }
                Job::Send { id, records, reply } => {
                    let _ = reply.send(self.send(id, records).await);
                }
                Job::Flush { id, reply } => {
                    let _ = reply.send(self.flush(id).await);
                }
                Job::Clear { id, reply } => {
                    if let Some(sender) = self.senders.get_mut(&id) {
                        sender.clear().await;
                    }
                    let _ = reply.send(());
                }
                Job::CloseTopic { id, reply } => {
                    let result = match self.senders.remove(&id) {
                        Some(mut sender) => sender.close().await,
                        None => Ok(()),
                    };
                    let _ = reply.send(result);
                }
                Job::Probe => {
                    let connected = self.inner.is_connected().await;
                    self.update_state(connected);
                    if let Ok(mut waiters) = self.probe_waiters.lock() {
                        for waiter in waiters.drain(..) {
                            let _ = waiter.send(connected);
                        }
                    }
                }
                Job::Reset(reply) => {
                    let connected = self.inner.reset_connection().await;
                    self.update_state(connected);
                    let _ = reply.send(connected);
                }
                Job::Shutdown(reply) => {
                    let _ = reply.send(self.shutdown().await);
                    return;
                }
            }
        }
        let _ = self.shutdown().await;
    }

    fn update_state(&self, connected: bool) {
        if connected {
            self.state.did_connect();
        } else if self.state.did_disconnect() {
            info!("Server unreachable");
        }
    }

    async fn open(&mut self, topic: &Topic) -> Result<u64> {
        let sender = self.inner.sender(topic).await?;
        let id = self.next_id;
        self.next_id += 1;
        self.senders.insert(id, sender);
        Ok(id)
    }

    fn topic_sender(&mut self, id: u64) -> Result<&mut Box<dyn TopicSender>> {
        self.senders
            .get_mut(&id)
            .ok_or_else(|| ClientError::Internal(format!("topic sender {} is closed", id)))
    }

    async fn send(&mut self, id: u64, records: Vec<Record>) -> Result<i64> {
        let policy = self.policy.clone();
        let sender = self.topic_sender(id)?;
        let count = records.len();

        let result =
            retry_with_backoff(&policy, &mut **sender, |sender| sender.send(records.clone())).await;
        let last_sent_offset = sender.last_sent_offset();
        let topic = sender.topic().clone();

        match result {
            Ok(()) => {
                self.state.did_connect();
                debug!(topic = %topic, records = count, last_sent_offset, "Batch delivered");
                Ok(last_sent_offset)
            }
            Err(e) => {
                warn!(topic = %topic, records = count, error = %e, "Batch failed after retries");
                self.update_state(false);
                Err(e)
            }
        }
    }

    async fn flush(&mut self, id: u64) -> Result<i64> {
        let sender = self.topic_sender(id)?;
        let result = sender.flush().await;
        let last_sent_offset = sender.last_sent_offset();
        match result {
            Ok(()) => Ok(last_sent_offset),
            Err(e) => {
                self.update_state(false);
                Err(e)
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        let mut result = Ok(());
        for (_, mut sender) in self.senders.drain() {
            if let Err(e) = sender.close().await {
                warn!(topic = %sender.topic(), error = %e, "Failed to close topic sender");
                result = Err(e);
            }
        }
        self.inner.close().await.and(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::fake::{records, FakeSender};
    use crate::topic::tests::test_topic;

    #[tokio::test]
    async fn test_send_retries_three_times_then_disconnects() {
        let fake = FakeSender::reachable();
        let sender = ThreadedSender::new(fake.clone(), Duration::from_secs(60));
        assert!(sender.reset_connection().await);
        assert!(sender.is_connected().await);

        let mut topic_sender = sender.sender(&test_topic("t")).await.unwrap();
        fake.state.lock().unwrap().failures = 3;
        assert!(topic_sender.send(records(1..=3)).await.is_err());
        assert_eq!(fake.state.lock().unwrap().attempts, 3);
        assert!(!sender.is_connected().await);

        assert!(sender.reset_connection().await);
        topic_sender.send(records(1..=3)).await.unwrap();
        assert_eq!(topic_sender.last_sent_offset(), 3);
        sender.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let fake = FakeSender::reachable();
        let sender = ThreadedSender::new(fake.clone(), Duration::from_secs(60));
        assert!(sender.reset_connection().await);

        let mut topic_sender = sender.sender(&test_topic("t")).await.unwrap();
        fake.state.lock().unwrap().failures = 2;
        topic_sender.send(records(1..=2)).await.unwrap();

        let state = fake.state.lock().unwrap();
        assert_eq!(state.attempts, 3);
        assert_eq!(state.requests, vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_recent_contact_skips_probe() {
        let fake = FakeSender::reachable();
        let sender = ThreadedSender::new(fake.clone(), Duration::from_secs(60));
        assert!(sender.reset_connection().await);
        let probes = fake.state.lock().unwrap().probes;

        for _ in 0..5 {
            assert!(sender.is_connected().await);
        }
        assert_eq!(fake.state.lock().unwrap().probes, probes);
    }

    #[tokio::test]
    async fn test_stale_contact_probes_once_for_concurrent_callers() {
        let fake = FakeSender::reachable();
        // Every contact is stale at once
        let sender = Arc::new(
            ThreadedSender::new(fake.clone(), Duration::from_secs(60))
                .with_contact_window(Duration::ZERO),
        );
        assert!(sender.reset_connection().await);
        let probes_before = fake.state.lock().unwrap().probes;

        let checks: Vec<_> = (0..4)
            .map(|_| {
                let sender = Arc::clone(&sender);
                tokio::spawn(async move { sender.is_connected().await })
            })
            .collect();
        for check in futures::future::join_all(checks).await {
            assert!(check.unwrap());
        }

        // Callers that queue behind an outstanding probe share its answer
        let probes = fake.state.lock().unwrap().probes - probes_before;
        assert!((1..4).contains(&probes), "{} probes for 4 callers", probes);
    }
}
