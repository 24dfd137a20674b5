//! Typed queue on top of a [`QueueFile`].

use crate::error::Result;
use crate::queue_file::{QueueFile, QueueFileConfig};
use std::marker::PhantomData;
use std::path::Path;

/// Turns values into queue elements and back.
pub trait Converter<T> {
    /// Append the encoded form of `value` to `out`.
    fn serialize(&self, value: &T, out: &mut Vec<u8>) -> Result<()>;

    /// Decode one element. Must be the exact inverse of [`serialize`](Self::serialize).
    fn deserialize(&self, data: &[u8]) -> Result<T>;
}

/// Durable FIFO of `T` values, one element per value.
pub struct BackedObjectQueue<T, C> {
    queue: QueueFile,
    converter: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: Converter<T>> BackedObjectQueue<T, C> {
    pub fn new(queue: QueueFile, converter: C) -> Self {
        Self {
            queue,
            converter,
            _marker: PhantomData,
        }
    }

    pub fn open(path: impl AsRef<Path>, config: QueueFileConfig, converter: C) -> Result<Self> {
        Ok(Self::new(QueueFile::open(path, config)?, converter))
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn file_length(&self) -> u64 {
        self.queue.file_length()
    }

    pub fn add(&mut self, value: &T) -> Result<()> {
        let mut buf = Vec::new();
        self.converter.serialize(value, &mut buf)?;
        self.queue.add(&buf)
    }

    /// Add all values with one header commit.
    pub fn add_all<'a, I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        let mut encoded = Vec::new();
        for value in values {
            let mut buf = Vec::new();
            self.converter.serialize(value, &mut buf)?;
            encoded.push(buf);
        }
        self.queue.add_all(&encoded)
    }

    pub fn peek(&mut self) -> Result<Option<T>> {
        match self.queue.peek()? {
            Some(data) => self.converter.deserialize(&data).map(Some),
            None => Ok(None),
        }
    }

    /// Up to `n` of the oldest values, oldest first.
    pub fn peek_n(&mut self, n: usize) -> Result<Vec<T>> {
        self.iter().take(n).collect()
    }

    /// Values oldest first, without removing them.
    pub fn iter(&mut self) -> impl Iterator<Item = Result<T>> + '_ {
        let converter = &self.converter;
        self.queue
            .iter()
            .map(move |data| data.and_then(|data| converter.deserialize(&data)))
    }

    pub fn remove(&mut self, n: usize) -> Result<()> {
        self.queue.remove(n)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.queue.clear()
    }

    pub fn close(self) -> Result<()> {
        self.queue.close()
    }
}
