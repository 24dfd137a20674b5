//! Tape cache backend: one ring-buffer file per topic.
//!
//! Element layout:
//!
//! ```text
//! ┌──────────┬──────────┬────────────┬──────────────┐
//! │ Offset   │ Key Len  │ Key (JSON) │ Value (JSON) │
//! │ (8 bytes)│ (4 bytes)│ (variable) │ (rest)       │
//! └──────────┴──────────┴────────────┴──────────────┘
//! ```
//!
//! Integers are little-endian. The highest assigned offset is also kept in
//! `<topic>.offset`, so offsets keep increasing after the tape has been
//! emptied or recreated.

use super::worker::CacheStorage;
use super::Measurement;
use crate::error::{ClientError, Result};
use crate::record::{now_ms, Record};
use async_trait::async_trait;
use bytes::{Buf, BufMut};
use sensorlink_queue::{BackedObjectQueue, Converter, QueueError, QueueFileConfig};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

type TapeQueue = BackedObjectQueue<Record, RecordConverter>;

/// Encodes records as queue elements.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordConverter;

impl Converter<Record> for RecordConverter {
    fn serialize(&self, record: &Record, out: &mut Vec<u8>) -> sensorlink_queue::Result<()> {
        let key = serde_json::to_vec(&record.key).map_err(|e| QueueError::Conversion(e.to_string()))?;
        let value =
            serde_json::to_vec(&record.value).map_err(|e| QueueError::Conversion(e.to_string()))?;

        out.reserve(12 + key.len() + value.len());
        out.put_i64_le(record.offset);
        out.put_u32_le(key.len() as u32);
        out.put_slice(&key);
        out.put_slice(&value);
        Ok(())
    }

    fn deserialize(&self, mut data: &[u8]) -> sensorlink_queue::Result<Record> {
        if data.remaining() < 12 {
            return Err(QueueError::Conversion(format!(
                "record element too short: {} bytes",
                data.len()
            )));
        }
        let offset = data.get_i64_le();
        let key_len = data.get_u32_le() as usize;
        if data.remaining() < key_len {
            return Err(QueueError::Conversion(format!(
                "key length {} exceeds element ({} bytes left)",
                key_len,
                data.remaining()
            )));
        }
        let (key, value) = data.split_at(key_len);

        Ok(Record {
            offset,
            key: serde_json::from_slice(key).map_err(|e| QueueError::Conversion(e.to_string()))?,
            value: serde_json::from_slice(value)
                .map_err(|e| QueueError::Conversion(e.to_string()))?,
            enqueued_at_ms: now_ms(),
        })
    }
}

/// [`CacheStorage`] over a `<directory>/<topic>.tape` ring-buffer file.
///
/// File access runs on the blocking pool.
pub struct TapeStorage {
    topic: String,
    path: PathBuf,
    offset_path: PathBuf,
    config: QueueFileConfig,
    queue: Option<TapeQueue>,
    next_offset: i64,
}

impl TapeStorage {
    /// Open or create the tape for `topic`.
    ///
    /// A tape that cannot be opened is deleted and recreated; its contents
    /// are lost.
    pub async fn open(topic: &str, directory: &Path, config: QueueFileConfig) -> Result<Self> {
        tokio::fs::create_dir_all(directory).await?;
        let path = directory.join(format!("{}.tape", topic));
        let offset_path = directory.join(format!("{}.offset", topic));

        let queue = match open_queue(path.clone(), config).await {
            Ok(queue) => queue,
            Err(e) => {
                error!(
                    topic,
                    path = %path.display(),
                    error = %e,
                    "Cannot open tape cache, deleting it. Its measurements are lost"
                );
                recreate_queue(path.clone(), config).await?
            }
        };

        let mut storage = Self {
            topic: topic.to_string(),
            path,
            offset_path,
            config,
            queue: Some(queue),
            next_offset: 1,
        };
        storage.next_offset = match storage.recover_next_offset().await {
            Ok(next_offset) => next_offset,
            // The tape was recreated empty, only the sidecar is left
            Err(ClientError::Queue(e)) if e.is_corruption() || matches!(e, QueueError::Conversion(_)) => {
                storage.recover_next_offset().await?
            }
            Err(e) => return Err(e),
        };

        info!(
            topic,
            path = %storage.path.display(),
            next_offset = storage.next_offset,
            "Opened tape cache"
        );
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn recover_next_offset(&mut self) -> Result<i64> {
        let from_tape = self
            .with_queue(|queue| {
                let size = queue.size() as i64;
                Ok(queue.peek()?.map(|first| first.offset + size))
            })
            .await?;

        let from_sidecar = match tokio::fs::read(&self.offset_path).await {
            Ok(bytes) if bytes.len() == 8 => {
                let mut buf = bytes.as_slice();
                Some(buf.get_i64_le() + 1)
            }
            Ok(_) => {
                warn!(topic = %self.topic, "Ignoring malformed offset file");
                None
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(from_tape.unwrap_or(1).max(from_sidecar.unwrap_or(1)))
    }

    /// Run `f` against the queue on the blocking pool.
    ///
    /// A corrupted or undecodable tape is replaced with an empty one before
    /// the error is returned.
    async fn with_queue<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TapeQueue) -> sensorlink_queue::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut queue = match self.queue.take() {
            Some(queue) => queue,
            // Lost to a panicked blocking task
            None => open_queue(self.path.clone(), self.config).await?,
        };

        let (queue, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut queue);
            (queue, result)
        })
        .await
        .map_err(|e| ClientError::Internal(format!("tape task failed: {}", e)))?;

        match result {
            Err(e) if e.is_corruption() || matches!(e, QueueError::Conversion(_)) => {
                error!(
                    topic = %self.topic,
                    path = %self.path.display(),
                    error = %e,
                    "Tape cache is corrupted, recreating it. Its measurements are lost"
                );
                drop(queue);
                self.queue = Some(recreate_queue(self.path.clone(), self.config).await?);
                Err(e.into())
            }
            other => {
                self.queue = Some(queue);
                other.map_err(Into::into)
            }
        }
    }
}

async fn open_queue(path: PathBuf, config: QueueFileConfig) -> Result<TapeQueue> {
    tokio::task::spawn_blocking(move || TapeQueue::open(&path, config, RecordConverter))
        .await
        .map_err(|e| ClientError::Internal(format!("tape task failed: {}", e)))?
        .map_err(Into::into)
}

async fn recreate_queue(path: PathBuf, config: QueueFileConfig) -> Result<TapeQueue> {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    open_queue(path, config).await
}

#[async_trait]
impl CacheStorage for TapeStorage {
    async fn append(&mut self, measurements: Vec<Measurement>) -> Result<()> {
        let first_offset = self.next_offset;
        let records: Vec<Record> = measurements
            .into_iter()
            .enumerate()
            .map(|(i, m)| Record {
                offset: first_offset + i as i64,
                key: m.key,
                value: m.value,
                enqueued_at_ms: m.enqueued_at_ms,
            })
            .collect();
        let next_offset = first_offset + records.len() as i64;

        self.with_queue(move |queue| queue.add_all(&records)).await?;
        self.next_offset = next_offset;

        if let Err(e) = tokio::fs::write(&self.offset_path, (next_offset - 1).to_le_bytes()).await {
            warn!(topic = %self.topic, error = %e, "Failed to persist offset high-water mark");
        }
        Ok(())
    }

    async fn peek(&mut self, limit: usize) -> Result<Vec<Record>> {
        self.with_queue(move |queue| queue.peek_n(limit)).await
    }

    async fn remove_through(&mut self, offset: i64) -> Result<usize> {
        self.with_queue(move |queue| {
            let Some(first) = queue.peek()? else {
                return Ok(0);
            };
            if offset < first.offset {
                return Ok(0);
            }
            let n = ((offset - first.offset + 1) as usize).min(queue.size());
            queue.remove(n)?;
            Ok(n)
        })
        .await
    }

    /// Removes the expired prefix of the tape. Records are appended roughly
    /// in `timeReceived` order, so the scan stops at the first fresh one.
    async fn remove_before(&mut self, timestamp_ms: u64) -> Result<usize> {
        self.with_queue(move |queue| {
            let mut expired = 0;
            for record in queue.iter() {
                let record = record?;
                let is_fresh = record
                    .time_received_ms()
                    .map_or(true, |received| received >= timestamp_ms);
                if is_fresh {
                    break;
                }
                expired += 1;
            }
            queue.remove(expired)?;
            Ok(expired)
        })
        .await
    }

    async fn count(&mut self) -> Result<usize> {
        self.with_queue(|queue| Ok(queue.size())).await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(queue) = self.queue.take() {
            tokio::task::spawn_blocking(move || queue.close())
                .await
                .map_err(|e| ClientError::Internal(format!("tape task failed: {}", e)))??;
        }
        Ok(())
    }
}
