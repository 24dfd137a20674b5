//! SensorLink Queue - Crash-safe on-disk ring buffer
//!
//! This crate stores opaque byte elements in a single circular file with a
//! checksummed header, and layers a typed queue on top of it.
//!
//! ## Components
//!
//! - [`QueueFile`]: the ring-buffer store. Append, peek the oldest, bulk
//!   remove the oldest, and recover after a crash by re-reading the header.
//! - [`BackedObjectQueue`]: serializes values through a [`Converter`] into
//!   single queue elements.
//!
//! ## Failure model
//!
//! A header rewrite commits every mutation, so an interrupted write leaves
//! the previous state. A checksum mismatch is reported as
//! [`QueueError::Corrupted`] and is fatal to the file; owners delete and
//! recreate it.

pub mod backed_queue;
pub mod error;
pub mod header;
pub mod queue_file;
mod storage;

pub use backed_queue::{BackedObjectQueue, Converter};
pub use error::{QueueError, Result};
pub use header::{ELEMENT_HEADER_LENGTH, HEADER_LENGTH};
pub use queue_file::{Iter, QueueFile, QueueFileConfig, QueueFileElement};
