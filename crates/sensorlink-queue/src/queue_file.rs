//! Ring-Buffer Store: a single-file circular queue of byte elements.
//!
//! ## Layout
//!
//! ```text
//! ┌────────┬──────────────────────────────────────────────────────────┐
//! │ Header │ data region: elements in insertion order, wrapping       │
//! │  36 B  │ from the end of the file back to byte 36                 │
//! └────────┴──────────────────────────────────────────────────────────┘
//!
//!   not wrapped:   [H][   ][first ... last][        ]
//!   wrapped:       [H][... last][          ][first ...]
//! ```
//!
//! ## Commit protocol
//!
//! Every mutation writes element data first and rewrites the header last.
//! The header rewrite is the commit point: a crash before it leaves the
//! previous header, which still describes the previous, intact state.
//!
//! ## Sizing
//!
//! The file starts at `min_length` and doubles when an append needs more
//! room, up to `max_length`. After removals it halves again while less than
//! half of the smaller size would be in use and no data has to move.
//!
//! ## Usage
//!
//! ```ignore
//! use sensorlink_queue::{QueueFile, QueueFileConfig};
//!
//! let mut queue = QueueFile::open("accelerometer.tape", QueueFileConfig::default())?;
//! queue.add(b"first")?;
//! queue.add_all(&[b"second".to_vec(), b"third".to_vec()])?;
//!
//! assert_eq!(queue.peek()?, Some(b"first".to_vec()));
//! queue.remove(1)?;
//! assert_eq!(queue.size(), 2);
//! ```

use crate::error::{QueueError, Result};
use crate::header::{
    decode_element_header, encode_element_header, QueueFileHeader, ELEMENT_HEADER_LENGTH,
    HEADER_LENGTH,
};
use crate::storage::QueueStorage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

// ============================================================================
// Configuration
// ============================================================================

/// Queue file sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueFileConfig {
    /// Initial and minimum file length in bytes (default: 4096, one block)
    #[serde(default = "default_min_length")]
    pub min_length: u64,

    /// Maximum file length in bytes (default: 256MB)
    #[serde(default = "default_max_length")]
    pub max_length: u64,
}

fn default_min_length() -> u64 {
    4096
}

fn default_max_length() -> u64 {
    256 * 1024 * 1024
}

impl Default for QueueFileConfig {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            max_length: default_max_length(),
        }
    }
}

// ============================================================================
// Element
// ============================================================================

/// Location of one element in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFileElement {
    /// Position of the element header
    pub position: u64,

    /// Payload length in bytes
    pub length: u32,
}

impl QueueFileElement {
    const EMPTY: QueueFileElement = QueueFileElement {
        position: 0,
        length: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.position == 0
    }

    /// Position just past the payload, before wrapping.
    fn end_position(&self) -> u64 {
        self.position + ELEMENT_HEADER_LENGTH + self.length as u64
    }
}

// ============================================================================
// QueueFile
// ============================================================================

/// A checksummed circular queue stored in one file.
///
/// Not thread-safe: a queue file must be owned and driven by a single worker.
pub struct QueueFile {
    storage: QueueStorage,
    header: QueueFileHeader,
    first: QueueFileElement,
    last: QueueFileElement,
    config: QueueFileConfig,
}

impl QueueFile {
    /// Open a queue file, creating it when it does not exist.
    ///
    /// Opening an existing file re-reads the header and the first and last
    /// element headers and verifies their checksums.
    ///
    /// # Errors
    ///
    /// `QueueError::Corrupted` when any check fails. The file is left as is;
    /// the caller decides whether to delete and recreate it.
    pub fn open(path: impl AsRef<Path>, config: QueueFileConfig) -> Result<Self> {
        let path = path.as_ref();
        if config.min_length < HEADER_LENGTH + ELEMENT_HEADER_LENGTH
            || config.max_length < config.min_length
        {
            return Err(QueueError::InvalidConfig(format!(
                "min_length {} max_length {}",
                config.min_length, config.max_length
            )));
        }

        let mut storage = QueueStorage::open(path)?;

        let header = if storage.physical_length() == 0 {
            storage.resize(config.min_length)?;
            let header = QueueFileHeader::empty(config.min_length);
            storage.commit_header(&header)?;
            debug!(path = ?path, length = config.min_length, "Queue file created");
            header
        } else {
            let bytes = storage.read_header()?;
            QueueFileHeader::decode(&bytes, storage.physical_length())?
        };

        let mut queue = Self {
            storage,
            header,
            first: QueueFileElement::EMPTY,
            last: QueueFileElement::EMPTY,
            config,
        };

        if header.count > 0 {
            queue.first = queue.read_element(header.first_position)?;
            queue.last = queue.read_element(header.last_position)?;
        }

        info!(
            path = ?path,
            elements = header.count,
            length = header.length,
            "Queue file opened"
        );

        Ok(queue)
    }

    /// Number of elements in the queue.
    pub fn size(&self) -> usize {
        self.header.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.count == 0
    }

    /// Logical file length in bytes.
    pub fn file_length(&self) -> u64 {
        self.header.length
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    /// Bytes in use, header included.
    pub fn used_bytes(&self) -> u64 {
        if self.header.count == 0 {
            HEADER_LENGTH
        } else if self.last.position >= self.first.position {
            self.last.end_position() - self.first.position + HEADER_LENGTH
        } else {
            self.last.end_position() + self.header.length - self.first.position
        }
    }

    /// Append one element.
    pub fn add(&mut self, data: &[u8]) -> Result<()> {
        self.add_all(&[data])
    }

    /// Append several elements with a single header commit.
    pub fn add_all<T: AsRef<[u8]>>(&mut self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut required = 0u64;
        for item in items {
            let len = item.as_ref().len();
            if len > u32::MAX as usize {
                return Err(QueueError::Full {
                    required: len as u64,
                    maximum: self.config.max_length,
                });
            }
            required += ELEMENT_HEADER_LENGTH + len as u64;
        }
        let added = u32::try_from(items.len()).map_err(|_| QueueError::Full {
            required,
            maximum: self.config.max_length,
        })?;

        self.expand_if_necessary(required)?;

        let length = self.header.length;
        let mut position = self.next_free_position();
        let mut first = self.first;
        let mut last = self.last;

        for item in items {
            let data = item.as_ref();
            let element = QueueFileElement {
                position,
                length: data.len() as u32,
            };
            self.storage
                .write(length, position, &encode_element_header(element.length))?;
            let data_position = self.header.wrap_position(position + ELEMENT_HEADER_LENGTH);
            self.storage.write(length, data_position, data)?;

            if first.is_empty() {
                first = element;
            }
            last = element;
            position = self.header.wrap_position(element.end_position());
        }

        let header = QueueFileHeader {
            length,
            count: self.header.count + added,
            first_position: first.position,
            last_position: last.position,
        };
        self.storage.commit_header(&header)?;

        self.header = header;
        self.first = first;
        self.last = last;
        Ok(())
    }

    /// Read the oldest element without removing it.
    pub fn peek(&mut self) -> Result<Option<Vec<u8>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let first = self.first;
        self.read_data(first).map(Some)
    }

    /// Read up to `n` of the oldest elements without removing them.
    pub fn peek_n(&mut self, n: usize) -> Result<Vec<Vec<u8>>> {
        self.iter().take(n).collect()
    }

    /// Iterate over all elements, oldest first.
    pub fn iter(&mut self) -> Iter<'_> {
        Iter {
            remaining: self.size(),
            next: self.first,
            started: false,
            queue: self,
        }
    }

    /// Remove the `n` oldest elements.
    ///
    /// # Errors
    ///
    /// `QueueError::NoSuchElement` if fewer than `n` elements are stored.
    pub fn remove(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let count = self.size();
        if n > count {
            return Err(QueueError::NoSuchElement {
                requested: n,
                available: count,
            });
        }
        if n == count {
            return self.clear();
        }

        let mut element = self.first;
        for _ in 0..n {
            let next = self.header.wrap_position(element.end_position());
            element = self.read_element(next)?;
        }

        let header = QueueFileHeader {
            count: self.header.count - n as u32,
            first_position: element.position,
            ..self.header
        };
        self.storage.commit_header(&header)?;
        self.header = header;
        self.first = element;

        self.shrink_if_possible()
    }

    /// Remove every element and truncate the file to its minimum length.
    pub fn clear(&mut self) -> Result<()> {
        let header = QueueFileHeader::empty(self.config.min_length);
        self.storage.commit_header(&header)?;
        if self.storage.physical_length() != self.config.min_length {
            self.storage.resize(self.config.min_length)?;
        }

        self.header = header;
        self.first = QueueFileElement::EMPTY;
        self.last = QueueFileElement::EMPTY;
        Ok(())
    }

    /// Sync and release the file.
    pub fn close(mut self) -> Result<()> {
        self.storage.sync()
    }

    // ------------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------------

    fn next_free_position(&self) -> u64 {
        if self.last.is_empty() {
            HEADER_LENGTH
        } else {
            self.header.wrap_position(self.last.end_position())
        }
    }

    fn read_element(&mut self, position: u64) -> Result<QueueFileElement> {
        let mut buf = [0u8; ELEMENT_HEADER_LENGTH as usize];
        self.storage.read(self.header.length, position, &mut buf)?;
        let length = decode_element_header(&buf, position)?;

        let capacity = self.header.length - HEADER_LENGTH - ELEMENT_HEADER_LENGTH;
        if length as u64 > capacity {
            return Err(QueueError::Corrupted(format!(
                "element at {} claims {} bytes, data region holds {}",
                position, length, capacity
            )));
        }
        Ok(QueueFileElement { position, length })
    }

    fn read_data(&mut self, element: QueueFileElement) -> Result<Vec<u8>> {
        let mut data = vec![0u8; element.length as usize];
        let position = self
            .header
            .wrap_position(element.position + ELEMENT_HEADER_LENGTH);
        self.storage.read(self.header.length, position, &mut data)?;
        Ok(data)
    }

    /// Grow the file until `required` more bytes fit.
    fn expand_if_necessary(&mut self, required: u64) -> Result<()> {
        let used = self.used_bytes();
        let old_length = self.header.length;
        if old_length - used >= required {
            return Ok(());
        }

        let mut new_length = old_length;
        while new_length - used < required {
            new_length *= 2;
            if new_length > self.config.max_length {
                return Err(QueueError::Full {
                    required: used + required,
                    maximum: self.config.max_length,
                });
            }
        }

        self.storage.resize(new_length)?;

        let mut last = self.last;
        if !self.is_empty() {
            let end_of_last = self.header.wrap_position(self.last.end_position());
            if end_of_last <= self.first.position {
                // The tail wrapped to the start of the data region: move it
                // behind the old end so the data becomes contiguous.
                let count = end_of_last - HEADER_LENGTH;
                if count > 0 {
                    self.storage.copy(HEADER_LENGTH, old_length, count)?;
                }
                if self.last.position < self.first.position {
                    last.position = old_length + self.last.position - HEADER_LENGTH;
                }
            }
        }

        let header = QueueFileHeader {
            length: new_length,
            last_position: last.position,
            ..self.header
        };
        self.storage.commit_header(&header)?;
        self.header = header;
        self.last = last;

        debug!(
            from = old_length,
            to = new_length,
            elements = self.header.count,
            "Queue file expanded"
        );
        Ok(())
    }

    /// Halve the file while the data fits into the first quarter of the
    /// current length and lies contiguously before the new end.
    fn shrink_if_possible(&mut self) -> Result<()> {
        if self.is_empty() || self.last.position < self.first.position {
            return Ok(());
        }
        let extent = self.last.end_position();
        if extent > self.header.length {
            return Ok(());
        }

        let used = self.used_bytes();
        let mut new_length = self.header.length;
        while new_length / 2 >= self.config.min_length
            && extent <= new_length / 2
            && used <= new_length / 4
        {
            new_length /= 2;
        }

        if new_length < self.header.length {
            let header = QueueFileHeader {
                length: new_length,
                ..self.header
            };
            self.storage.commit_header(&header)?;
            self.storage.resize(new_length)?;
            debug!(
                from = self.header.length,
                to = new_length,
                "Queue file truncated"
            );
            self.header = header;
        }
        Ok(())
    }
}

impl std::fmt::Debug for QueueFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueFile")
            .field("path", &self.storage.path())
            .field("header", &self.header)
            .field("first", &self.first)
            .field("last", &self.last)
            .finish()
    }
}

/// Iterator over the payloads of a [`QueueFile`], oldest first.
pub struct Iter<'a> {
    queue: &'a mut QueueFile,
    next: QueueFileElement,
    remaining: usize,
    started: bool,
}

impl Iterator for Iter<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            let position = self.queue.header.wrap_position(self.next.end_position());
            match self.queue.read_element(position) {
                Ok(element) => self.next = element,
                Err(e) => {
                    self.remaining = 0;
                    return Some(Err(e));
                }
            }
        }
        self.started = true;
        self.remaining -= 1;

        let result = self.queue.read_data(self.next);
        if result.is_err() {
            self.remaining = 0;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn element(i: usize, size: usize) -> Vec<u8> {
        (0..size).map(|j| ((i + j) % 251) as u8).collect()
    }

    #[test]
    fn test_add_peek_remove() {
        let dir = TempDir::new().unwrap();
        let mut queue = QueueFile::open(dir.path().join("q.tape"), QueueFileConfig::default()).unwrap();

        assert!(queue.is_empty());
        assert_eq!(queue.peek().unwrap(), None);

        queue.add(b"one").unwrap();
        queue.add(b"two").unwrap();
        queue.add(b"three").unwrap();

        assert_eq!(queue.size(), 3);
        assert_eq!(queue.peek().unwrap(), Some(b"one".to_vec()));
        assert_eq!(
            queue.peek_n(2).unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );

        queue.remove(2).unwrap();
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.peek().unwrap(), Some(b"three".to_vec()));
    }

    #[test]
    fn test_remove_more_than_stored() {
        let dir = TempDir::new().unwrap();
        let mut queue = QueueFile::open(dir.path().join("q.tape"), QueueFileConfig::default()).unwrap();
        queue.add(b"only").unwrap();

        let err = queue.remove(2).unwrap_err();
        assert!(matches!(
            err,
            QueueError::NoSuchElement {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_remove_all_truncates_to_minimum() {
        let dir = TempDir::new().unwrap();
        let mut queue = QueueFile::open(dir.path().join("q.tape"), QueueFileConfig::default()).unwrap();
        for i in 0..100 {
            queue.add(&element(i, 200)).unwrap();
        }
        assert!(queue.file_length() > 4096);

        queue.remove(100).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.file_length(), 4096);
        assert_eq!(queue.used_bytes(), HEADER_LENGTH);
    }

    #[test]
    fn test_grows_by_doubling() {
        let dir = TempDir::new().unwrap();
        let mut queue = QueueFile::open(dir.path().join("q.tape"), QueueFileConfig::default()).unwrap();

        queue.add(&element(0, 5000)).unwrap();
        assert_eq!(queue.file_length(), 8192);

        queue.add(&element(1, 5000)).unwrap();
        assert_eq!(queue.file_length(), 16384);
        assert_eq!(queue.peek_n(2).unwrap(), vec![element(0, 5000), element(1, 5000)]);
    }

    #[test]
    fn test_full_at_maximum_length() {
        let dir = TempDir::new().unwrap();
        let config = QueueFileConfig {
            min_length: 4096,
            max_length: 8192,
        };
        let mut queue = QueueFile::open(dir.path().join("q.tape"), config).unwrap();

        queue.add(&element(0, 6000)).unwrap();
        let err = queue.add(&element(1, 6000)).unwrap_err();
        assert!(matches!(err, QueueError::Full { maximum: 8192, .. }));
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.peek().unwrap(), Some(element(0, 6000)));
    }

    #[test]
    fn test_expansion_keeps_wrapped_tail_contiguous() {
        let dir = TempDir::new().unwrap();
        let mut queue = QueueFile::open(dir.path().join("q.tape"), QueueFileConfig::default()).unwrap();

        // Fill most of the file, free the front, then wrap the tail around.
        for i in 0..7 {
            queue.add(&element(i, 500)).unwrap();
        }
        queue.remove(4).unwrap();
        for i in 7..11 {
            queue.add(&element(i, 500)).unwrap();
        }
        assert_eq!(queue.file_length(), 4096);

        // This append no longer fits and forces a growth with a wrapped tail.
        queue.add(&element(11, 3000)).unwrap();
        assert!(queue.file_length() > 4096);

        let expected: Vec<Vec<u8>> = (4..11)
            .map(|i| element(i, 500))
            .chain(std::iter::once(element(11, 3000)))
            .collect();
        assert_eq!(queue.peek_n(100).unwrap(), expected);
    }

    #[test]
    fn test_no_shrink_while_data_sits_at_the_end() {
        let dir = TempDir::new().unwrap();
        let mut queue = QueueFile::open(dir.path().join("q.tape"), QueueFileConfig::default()).unwrap();
        for i in 0..64 {
            queue.add(&element(i, 1000)).unwrap();
        }
        assert_eq!(queue.file_length(), 65536);

        queue.remove(60).unwrap();
        assert_eq!(queue.file_length(), 65536);
        assert_eq!(queue.peek().unwrap(), Some(element(60, 1000)));
    }

    #[test]
    fn test_shrinks_once_data_wrapped_to_the_front() {
        let dir = TempDir::new().unwrap();
        let mut queue = QueueFile::open(dir.path().join("q.tape"), QueueFileConfig::default()).unwrap();
        for i in 0..10 {
            queue.add(&element(i, 1000)).unwrap();
        }
        assert_eq!(queue.file_length(), 16384);
        queue.remove(9).unwrap();

        // Six fit before the end of the file, the seventh wraps around.
        for i in 10..17 {
            queue.add(&element(i, 1000)).unwrap();
        }
        queue.add(&element(17, 100)).unwrap();
        assert_eq!(queue.file_length(), 16384);

        queue.remove(8).unwrap();
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.file_length(), 4096);
        assert_eq!(queue.peek().unwrap(), Some(element(17, 100)));
    }

    #[test]
    fn test_iter_reports_all_elements() {
        let dir = TempDir::new().unwrap();
        let mut queue = QueueFile::open(dir.path().join("q.tape"), QueueFileConfig::default()).unwrap();
        let items: Vec<Vec<u8>> = (0..20).map(|i| element(i, 10 + i)).collect();
        queue.add_all(&items).unwrap();

        let read: Vec<Vec<u8>> = queue.iter().collect::<Result<_>>().unwrap();
        assert_eq!(read, items);
    }
}
