//! Batching decorator.
//!
//! Holds small sends back until enough records, or old enough ones, have
//! accumulated, and splits large sends into requests of bounded size:
//!
//! ```text
//! send(3) ──→ [buffer: 3]
//! send(2) ──→ [buffer: 5]            (still under max_batch_size, young)
//! send(4) ──→ [buffer: 9] ──→ inner.send(9 ≤ max)
//! send(2500), max 1000 ──→ inner.send(1000), (1000), (500)
//! ```
//!
//! Records at or below the highest buffered or delivered offset are
//! dropped, so sending the same batch twice delivers it once. The owner
//! polls [`TopicSender::flush_due_in`] to flush a partial batch once its
//! oldest record reaches `max_age`.

use super::{RecordSender, TopicSender};
use crate::error::Result;
use crate::record::{now_ms, Record};
use crate::topic::Topic;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// [`RecordSender`] whose topic senders batch records.
pub struct BatchedSender {
    inner: Arc<dyn RecordSender>,
    max_batch_size: usize,
    max_age: Duration,
}

impl BatchedSender {
    pub fn new(inner: Arc<dyn RecordSender>, max_batch_size: usize, max_age: Duration) -> Self {
        Self {
            inner,
            max_batch_size: max_batch_size.max(1),
            max_age,
        }
    }
}

#[async_trait]
impl RecordSender for BatchedSender {
    async fn sender(&self, topic: &Topic) -> Result<Box<dyn TopicSender>> {
        Ok(Box::new(BatchedTopicSender {
            inner: self.inner.sender(topic).await?,
            buffer: Vec::new(),
            max_batch_size: self.max_batch_size,
            max_age: self.max_age,
        }))
    }

    async fn direct_sender(&self, topic: &Topic) -> Result<Box<dyn TopicSender>> {
        self.inner.direct_sender(topic).await
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    async fn reset_connection(&self) -> bool {
        self.inner.reset_connection().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub struct BatchedTopicSender {
    inner: Box<dyn TopicSender>,
    buffer: Vec<Record>,
    max_batch_size: usize,
    max_age: Duration,
}

impl BatchedTopicSender {
    /// Whether `records` should be forwarded now.
    fn exceeds_bounds(&self, records: &[Record]) -> bool {
        match records.first() {
            None => false,
            Some(first) => {
                records.len() >= self.max_batch_size || first.age(now_ms()) >= self.max_age
            }
        }
    }

    /// Highest offset that must not be sent again.
    fn high_water_mark(&self) -> i64 {
        let buffered = self.buffer.last().map_or(-1, |r| r.offset);
        buffered.max(self.inner.last_sent_offset())
    }

    async fn forward(&mut self, mut records: Vec<Record>) -> Result<()> {
        while !records.is_empty() {
            let rest = records.split_off(records.len().min(self.max_batch_size));
            self.inner.send(records).await?;
            records = rest;
        }
        Ok(())
    }
}

#[async_trait]
impl TopicSender for BatchedTopicSender {
    fn topic(&self) -> &Topic {
        self.inner.topic()
    }

    async fn send(&mut self, mut records: Vec<Record>) -> Result<()> {
        let high_water_mark = self.high_water_mark();
        let before = records.len();
        records.retain(|r| r.offset > high_water_mark);
        if records.len() < before {
            debug!(
                topic = %self.topic(),
                dropped = before - records.len(),
                high_water_mark,
                "Dropped records that were already buffered or sent"
            );
        }

        if self.buffer.is_empty() && self.exceeds_bounds(&records) {
            return self.forward(records).await;
        }

        self.buffer.extend(records);
        if self.exceeds_bounds(&self.buffer) {
            self.flush().await?;
        }
        Ok(())
    }

    fn last_sent_offset(&self) -> i64 {
        self.inner.last_sent_offset()
    }

    async fn flush(&mut self) -> Result<()> {
        let buffered = std::mem::take(&mut self.buffer);
        self.forward(buffered).await?;
        self.inner.flush().await
    }

    async fn clear(&mut self) {
        self.buffer.clear();
        self.inner.clear().await;
    }

    async fn close(&mut self) -> Result<()> {
        let flushed = self.flush().await;
        let closed = self.inner.close().await;
        flushed.and(closed)
    }

    fn flush_due_in(&self) -> Option<Duration> {
        let oldest = self.buffer.first()?;
        Some(self.max_age.saturating_sub(oldest.age(now_ms())))
    }
}
