//! Positioned, wrap-aware access to the queue file on disk.

use crate::error::{QueueError, Result};
use crate::header::{QueueFileHeader, HEADER_LENGTH};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Chunk size used when moving data inside the file during growth.
const COPY_CHUNK: usize = 64 * 1024;

/// The backing file of a queue.
///
/// Reads and writes take the logical file length so that a range running
/// past the end continues right after the header.
pub(crate) struct QueueStorage {
    file: File,
    path: PathBuf,
    physical_length: u64,
}

impl QueueStorage {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let physical_length = file.metadata()?.len();

        Ok(Self {
            file,
            path: path.to_path_buf(),
            physical_length,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn physical_length(&self) -> u64 {
        self.physical_length
    }

    pub(crate) fn read_header(&mut self) -> Result<[u8; HEADER_LENGTH as usize]> {
        if self.physical_length < HEADER_LENGTH {
            return Err(QueueError::Corrupted(format!(
                "file of {} bytes cannot hold a header",
                self.physical_length
            )));
        }
        let mut buf = [0u8; HEADER_LENGTH as usize];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write and sync the header. Everything written before this call is
    /// synced first, so the header never points at data that is not on disk.
    pub(crate) fn commit_header(&mut self, header: &QueueFileHeader) -> Result<()> {
        self.file.sync_data()?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `position`, wrapping at `length`.
    pub(crate) fn read(&mut self, length: u64, position: u64, buf: &mut [u8]) -> Result<()> {
        let (head, tail) = split_at_wrap(length, position, buf.len());
        let (first, second) = buf.split_at_mut(head);
        self.file.seek(SeekFrom::Start(position))?;
        self.file.read_exact(first)?;
        if tail > 0 {
            self.file.seek(SeekFrom::Start(HEADER_LENGTH))?;
            self.file.read_exact(second)?;
        }
        Ok(())
    }

    /// Write `buf` starting at `position`, wrapping at `length`.
    pub(crate) fn write(&mut self, length: u64, position: u64, buf: &[u8]) -> Result<()> {
        let (head, tail) = split_at_wrap(length, position, buf.len());
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(&buf[..head])?;
        if tail > 0 {
            self.file.seek(SeekFrom::Start(HEADER_LENGTH))?;
            self.file.write_all(&buf[head..])?;
        }
        Ok(())
    }

    /// Copy `count` bytes from `from` to `to`. The ranges must not overlap.
    pub(crate) fn copy(&mut self, from: u64, to: u64, count: u64) -> Result<()> {
        let mut buf = vec![0u8; COPY_CHUNK.min(count as usize)];
        let mut done = 0u64;
        while done < count {
            let n = ((count - done) as usize).min(buf.len());
            self.file.seek(SeekFrom::Start(from + done))?;
            self.file.read_exact(&mut buf[..n])?;
            self.file.seek(SeekFrom::Start(to + done))?;
            self.file.write_all(&buf[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    pub(crate) fn resize(&mut self, new_length: u64) -> Result<()> {
        self.file.set_len(new_length)?;
        self.file.sync_all()?;
        self.physical_length = new_length;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Split a `len`-byte range at `position` into the part before the end of the
/// file and the part that continues after the header.
fn split_at_wrap(length: u64, position: u64, len: usize) -> (usize, usize) {
    let end = position + len as u64;
    if end <= length {
        (len, 0)
    } else {
        let head = length.saturating_sub(position) as usize;
        (head, len - head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_at_wrap() {
        assert_eq!(split_at_wrap(4096, 100, 50), (50, 0));
        assert_eq!(split_at_wrap(4096, 4090, 6), (6, 0));
        assert_eq!(split_at_wrap(4096, 4090, 10), (6, 4));
    }

    #[test]
    fn test_wrapped_write_and_read() {
        let dir = TempDir::new().unwrap();
        let mut storage = QueueStorage::open(&dir.path().join("wrap.tape")).unwrap();
        storage.resize(4096).unwrap();

        storage.write(4096, 4090, b"0123456789").unwrap();

        let mut buf = [0u8; 10];
        storage.read(4096, 4090, &mut buf).unwrap();
        assert_eq!(&buf, b"0123456789");

        let mut tail = [0u8; 4];
        storage.read(4096, HEADER_LENGTH, &mut tail).unwrap();
        assert_eq!(&tail, b"6789");
    }
}
