//! Queue file header and element framing.
//!
//! ## File Header
//!
//! ```text
//! ┌──────────┬─────────────┬──────────┬────────────────┬───────────────┬──────────┐
//! │ Version  │ File Length │ Count    │ First Position │ Last Position │ CRC32    │
//! │ (4 bytes)│ (8 bytes)   │ (4 bytes)│ (8 bytes)      │ (8 bytes)     │ (4 bytes)│
//! └──────────┴─────────────┴──────────┴────────────────┴───────────────┴──────────┘
//! ```
//!
//! The CRC covers the first 32 bytes. All integers are little-endian.
//!
//! ## Element Header
//!
//! ```text
//! ┌────────────────┬──────────────────────┬──────────────────┐
//! │ Payload Length │ CRC32 of length bytes│ Payload          │
//! │ (4 bytes)      │ (4 bytes)            │ (length bytes)   │
//! └────────────────┴──────────────────────┴──────────────────┘
//! ```

use crate::error::{QueueError, Result};

/// Size of the fixed file header.
pub const HEADER_LENGTH: u64 = 36;

/// Size of the header in front of every element payload.
pub const ELEMENT_HEADER_LENGTH: u64 = 8;

/// On-disk format version.
pub const VERSION: u32 = 0x0000_0001;

/// Structural pointers of a queue file.
///
/// `first_position` and `last_position` are zero when the queue is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFileHeader {
    /// Logical file length. The data region is `[HEADER_LENGTH, length)`.
    pub length: u64,

    /// Number of stored elements
    pub count: u32,

    /// Position of the oldest element
    pub first_position: u64,

    /// Position of the newest element
    pub last_position: u64,
}

impl QueueFileHeader {
    /// Header of an empty queue of the given length.
    pub fn empty(length: u64) -> Self {
        Self {
            length,
            count: 0,
            first_position: 0,
            last_position: 0,
        }
    }

    /// Serialize the header, checksum included.
    pub fn encode(&self) -> [u8; HEADER_LENGTH as usize] {
        let mut buf = [0u8; HEADER_LENGTH as usize];
        buf[0..4].copy_from_slice(&VERSION.to_le_bytes());
        buf[4..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.first_position.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_position.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..32]);
        buf[32..36].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse and validate a header read from a file of `storage_length` bytes.
    ///
    /// # Errors
    ///
    /// `QueueError::Corrupted` if the version, checksum or any pointer is
    /// inconsistent with the file.
    pub fn decode(buf: &[u8; HEADER_LENGTH as usize], storage_length: u64) -> Result<Self> {
        let version = u32::from_le_bytes(array(&buf[0..4]));
        if version != VERSION {
            return Err(QueueError::Corrupted(format!(
                "unsupported format version {:#010x}",
                version
            )));
        }

        let stored_crc = u32::from_le_bytes(array(&buf[32..36]));
        let crc = crc32fast::hash(&buf[0..32]);
        if stored_crc != crc {
            return Err(QueueError::Corrupted(format!(
                "header checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, crc
            )));
        }

        let header = Self {
            length: u64::from_le_bytes(array(&buf[4..12])),
            count: u32::from_le_bytes(array(&buf[12..16])),
            first_position: u64::from_le_bytes(array(&buf[16..24])),
            last_position: u64::from_le_bytes(array(&buf[24..32])),
        };

        if header.length < HEADER_LENGTH + ELEMENT_HEADER_LENGTH {
            return Err(QueueError::Corrupted(format!(
                "file length {} is smaller than the header",
                header.length
            )));
        }
        if header.length > storage_length {
            return Err(QueueError::Corrupted(format!(
                "file is truncated: header says {} bytes, file has {}",
                header.length, storage_length
            )));
        }
        if header.count > 0 {
            for (name, position) in [
                ("first", header.first_position),
                ("last", header.last_position),
            ] {
                if position < HEADER_LENGTH || position >= header.length {
                    return Err(QueueError::Corrupted(format!(
                        "{} element position {} outside data region [{}, {})",
                        name, position, HEADER_LENGTH, header.length
                    )));
                }
            }
        }

        Ok(header)
    }

    /// Map a position that may run past the end of the file back into the
    /// data region.
    pub fn wrap_position(&self, position: u64) -> u64 {
        if position < self.length {
            position
        } else {
            HEADER_LENGTH + position - self.length
        }
    }
}

/// Encode an element header for a payload of `length` bytes.
pub fn encode_element_header(length: u32) -> [u8; ELEMENT_HEADER_LENGTH as usize] {
    let length_bytes = length.to_le_bytes();
    let mut buf = [0u8; ELEMENT_HEADER_LENGTH as usize];
    buf[0..4].copy_from_slice(&length_bytes);
    buf[4..8].copy_from_slice(&crc32fast::hash(&length_bytes).to_le_bytes());
    buf
}

/// Decode an element header read at `position`, verifying its checksum.
pub fn decode_element_header(buf: &[u8; ELEMENT_HEADER_LENGTH as usize], position: u64) -> Result<u32> {
    let length_bytes: [u8; 4] = array(&buf[0..4]);
    let stored_crc = u32::from_le_bytes(array(&buf[4..8]));
    if crc32fast::hash(&length_bytes) != stored_crc {
        return Err(QueueError::Corrupted(format!(
            "element header checksum mismatch at position {}",
            position
        )));
    }
    Ok(u32::from_le_bytes(length_bytes))
}

fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

// ============================================================================
// Tests
// ============================================================================
