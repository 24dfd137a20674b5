//! Senders that deliver cached records to the ingestion service.
//!
//! ## Layers
//!
//! ```text
//! Submitter
//!    │ TopicSender::send(records)
//!    ▼
//! BatchedSender   buffers and chunks records, drops duplicates
//!    │
//!    ▼
//! ThreadedSender  one worker task, 3 attempts per send, connection tracking
//!    │
//!    ▼
//! RestSender      POST {rest_url}/topics/{topic}
//! ```
//!
//! Every layer implements [`RecordSender`], so they stack in any order and
//! tests can replace the bottom layer with a fake.

pub mod batched;
pub mod rest;
pub mod threaded;

pub use batched::BatchedSender;
pub use rest::RestSender;
pub use threaded::ThreadedSender;

use crate::error::Result;
use crate::record::{now_ms, Record};
use crate::topic::Topic;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Sends records of one topic.
#[async_trait]
pub trait TopicSender: Send {
    fn topic(&self) -> &Topic;

    /// Send records, oldest first.
    ///
    /// Decorators may hold records back; [`last_sent_offset`](Self::last_sent_offset)
    /// tells what has actually been delivered.
    async fn send(&mut self, records: Vec<Record>) -> Result<()>;

    /// Highest offset known to be delivered, -1 if none.
    fn last_sent_offset(&self) -> i64;

    /// Deliver everything held back.
    async fn flush(&mut self) -> Result<()>;

    /// Drop everything held back.
    async fn clear(&mut self);

    /// Flush and release the sender.
    async fn close(&mut self) -> Result<()>;

    /// Time left until records held back must be flushed, `None` when
    /// nothing is held.
    fn flush_due_in(&self) -> Option<Duration> {
        None
    }
}

/// Creates topic senders and tracks the connection to the server.
#[async_trait]
pub trait RecordSender: Send + Sync {
    async fn sender(&self, topic: &Topic) -> Result<Box<dyn TopicSender>>;

    /// Topic sender that sends every batch as given, with no buffering or
    /// duplicate filtering. Used for records that never pass through a
    /// cache, whose offsets need not increase.
    async fn direct_sender(&self, topic: &Topic) -> Result<Box<dyn TopicSender>> {
        self.sender(topic).await
    }

    /// Whether the server is believed reachable.
    async fn is_connected(&self) -> bool;

    /// Re-establish the connection. Returns whether the server is reachable.
    async fn reset_connection(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Connected flag plus the time of the last successful contact.
///
/// Shared between a connection owner and the callers that only read it.
#[derive(Debug)]
pub struct ConnectionState {
    connected: AtomicBool,
    last_connection_ms: AtomicU64,
}

impl ConnectionState {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            last_connection_ms: AtomicU64::new(if connected { now_ms() } else { 0 }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record a successful contact.
    pub fn did_connect(&self) {
        self.last_connection_ms.store(now_ms(), Ordering::Release);
        self.connected.store(true, Ordering::Release);
    }

    /// Mark disconnected. Returns true for the caller that made the
    /// transition, false if already disconnected.
    pub fn did_disconnect(&self) -> bool {
        self.connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Time since the last successful contact.
    pub fn since_last_connection(&self) -> Duration {
        let last = self.last_connection_ms.load(Ordering::Acquire);
        Duration::from_millis(now_ms().saturating_sub(last))
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(false)
    }
}
