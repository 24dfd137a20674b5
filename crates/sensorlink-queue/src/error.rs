//! Queue Error Types
//!
//! ## Error Categories
//!
//! ### I/O
//! - `Io`: the backing file could not be read, written or resized
//!
//! ### Integrity
//! - `Corrupted`: a header or element checksum did not match, or the header
//!   describes a layout the file cannot hold. Fatal to the queue instance:
//!   the caller must delete and recreate the file.
//!
//! ### Capacity
//! - `Full`: the file would have to grow past its configured maximum
//! - `NoSuchElement`: more elements were requested than are stored
//!
//! ### Setup
//! - `InvalidConfig`: minimum and maximum lengths do not describe a usable file
//!
//! ### Typed queues
//! - `Conversion`: an element could not be turned into or out of its value

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue file corrupted: {0}")]
    Corrupted(String),

    #[error("Queue full: {required} bytes required, maximum file length is {maximum}")]
    Full { required: u64, maximum: u64 },

    #[error("Cannot take {requested} elements from a queue holding {available}")]
    NoSuchElement { requested: usize, available: usize },

    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error("Element conversion failed: {0}")]
    Conversion(String),
}

impl QueueError {
    /// Whether the backing file can no longer be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, QueueError::Corrupted(_))
    }
}
