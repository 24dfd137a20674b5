use super::Measurement;
use crate::error::Result;
use crate::record::Record;
use async_trait::async_trait;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Durable backend of a [`DataCache`](super::DataCache).
///
/// Owned by exactly one worker task, so methods take `&mut self`.
#[async_trait]
pub trait CacheStorage: Send + 'static {
    /// Durably append measurements, assigning each the next offset.
    async fn append(&mut self, measurements: Vec<Measurement>) -> Result<()>;

    /// Up to `limit` of the oldest stored records.
    async fn peek(&mut self, limit: usize) -> Result<Vec<Record>>;

    /// Remove every stored record with an offset up to and including `offset`.
    async fn remove_through(&mut self, offset: i64) -> Result<usize>;

    /// Remove stored records received before `timestamp_ms`.
    async fn remove_before(&mut self, timestamp_ms: u64) -> Result<usize>;

    /// Number of stored records.
    async fn count(&mut self) -> Result<usize>;

    async fn close(&mut self) -> Result<()>;
}

pub(crate) enum CacheCmd {
    /// Buffer a measurement (no response)
    Add(Measurement),

    /// Acknowledge through an offset (no response)
    MarkSent(i64),

    Unsent {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<Record>>>,
    },

    RemoveBefore {
        timestamp_ms: u64,
        reply: oneshot::Sender<Result<usize>>,
    },

    Count(oneshot::Sender<Result<usize>>),

    /// Write buffered measurements and notify when durable
    Flush(oneshot::Sender<Result<()>>),

    /// Write buffered measurements, close storage, stop
    Close(oneshot::Sender<Result<()>>),
}

/// Task that owns the storage and coalesces writes.
///
/// The loop:
/// 1. Wait for a command, bounded by the write deadline when measurements
///    are buffered
/// 2. Process it and drain every other queued command without blocking
/// 3. On deadline, write the whole buffer in one append
pub(crate) struct CacheWorker<S> {
    topic: String,
    storage: S,
    time_window: Duration,
    pending: Vec<Measurement>,
    deadline: Option<Instant>,
    /// Highest offset acknowledged so far, -1 before the first
    last_acked: i64,
    /// Highest offset handed out by `unsent_records`, -1 before the first
    highest_returned: i64,
}

impl<S: CacheStorage> CacheWorker<S> {
    pub(crate) fn new(topic: String, storage: S, time_window: Duration) -> Self {
        Self {
            topic,
            storage,
            time_window,
            pending: Vec::new(),
            deadline: None,
            last_acked: -1,
            highest_returned: -1,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CacheCmd>) {
        loop {
            let first = match self.deadline {
                None => match rx.recv().await {
                    Some(cmd) => cmd,
                    None => break,
                },
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => break,
                    Err(_) => {
                        let _ = self.write_pending().await;
                        continue;
                    }
                },
            };

            if self.process(first).await.is_break() {
                return;
            }
            while let Ok(cmd) = rx.try_recv() {
                if self.process(cmd).await.is_break() {
                    return;
                }
            }
        }

        // All handles dropped without close
        let _ = self.write_pending().await;
        if let Err(e) = self.storage.close().await {
            warn!(topic = %self.topic, error = %e, "Failed to close cache storage");
        }
    }

    async fn process(&mut self, cmd: CacheCmd) -> ControlFlow<()> {
        match cmd {
            CacheCmd::Add(measurement) => {
                if self.deadline.is_none() {
                    self.deadline = Some(Instant::now() + self.time_window);
                }
                self.pending.push(measurement);
            }
            CacheCmd::MarkSent(offset) => self.mark_sent(offset).await,
            CacheCmd::Unsent { limit, reply } => {
                let result = self.storage.peek(limit).await;
                if let Ok(records) = &result {
                    if let Some(last) = records.last() {
                        self.highest_returned = self.highest_returned.max(last.offset);
                    }
                }
                let _ = reply.send(result);
            }
            CacheCmd::RemoveBefore {
                timestamp_ms,
                reply,
            } => {
                let _ = reply.send(self.storage.remove_before(timestamp_ms).await);
            }
            CacheCmd::Count(reply) => {
                let pending = self.pending.len();
                let _ = reply.send(self.storage.count().await.map(|stored| stored + pending));
            }
            CacheCmd::Flush(reply) => {
                let _ = reply.send(self.write_pending().await);
            }
            CacheCmd::Close(reply) => {
                let written = self.write_pending().await;
                let closed = self.storage.close().await;
                debug!(topic = %self.topic, "Cache closed");
                let _ = reply.send(written.and(closed));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn mark_sent(&mut self, offset: i64) {
        let target = offset.min(self.highest_returned);
        if target <= self.last_acked {
            return;
        }
        match self.storage.remove_through(target).await {
            Ok(removed) => {
                self.last_acked = target;
                debug!(topic = %self.topic, offset = target, removed, "Marked records as sent");
            }
            Err(e) => {
                error!(topic = %self.topic, offset = target, error = %e, "Failed to remove sent records");
            }
        }
    }

    /// Write buffered measurements in one append.
    ///
    /// A failed append drops the batch; the error is logged and returned.
    async fn write_pending(&mut self) -> Result<()> {
        self.deadline = None;
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        let count = batch.len();
        match self.storage.append(batch).await {
            Ok(()) => {
                debug!(topic = %self.topic, count, "Cache write");
                Ok(())
            }
            Err(e) => {
                error!(topic = %self.topic, count, error = %e, "Failed to write measurements, dropping them");
                Err(e)
            }
        }
    }
}
