//! Queue File Recovery Tests
//!
//! These tests reopen queue files after writes, removals and deliberate
//! damage to validate what survives a restart.

use sensorlink_queue::{QueueError, QueueFile, QueueFileConfig, ELEMENT_HEADER_LENGTH, HEADER_LENGTH};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::TempDir;

/// Helper to build a recognizable payload
fn payload(i: usize, size: usize) -> Vec<u8> {
    let mut data = format!("element-{:05}-", i).into_bytes();
    data.resize(size.max(data.len()), (i % 256) as u8);
    data
}

/// Helper to flip one byte at `position` of the file
fn flip_byte(path: &Path, position: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(position)).unwrap();
    std::io::Read::read_exact(&mut file, &mut byte).unwrap();
    byte[0] ^= 0x5A;
    file.seek(SeekFrom::Start(position)).unwrap();
    file.write_all(&byte).unwrap();
    file.sync_all().unwrap();
}

fn read_all(queue: &mut QueueFile) -> Vec<Vec<u8>> {
    queue.iter().collect::<Result<_, _>>().unwrap()
}

// ============================================================================
// Durability
// ============================================================================

#[test]
fn test_reopen_restores_all_appends() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("durable.tape");

    for n in [1usize, 7, 250] {
        std::fs::remove_file(&path).ok();
        {
            let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
            for i in 0..n {
                queue.add(&payload(i, 40)).unwrap();
            }
            // Dropped without close
        }

        let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
        assert_eq!(queue.size(), n);
        assert_eq!(queue.peek().unwrap(), Some(payload(0, 40)));
    }
}

#[test]
fn test_uncommitted_bytes_are_ignored_on_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("torn.tape");
    let next_free;
    {
        let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
        queue.add(&payload(0, 100)).unwrap();
        queue.add(&payload(1, 100)).unwrap();
        next_free = HEADER_LENGTH + 2 * (ELEMENT_HEADER_LENGTH + 100);
    }

    // A torn append: element bytes landed but the header was never rewritten.
    {
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(next_free)).unwrap();
        file.write_all(&[0xAB; 64]).unwrap();
    }

    let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
    assert_eq!(queue.size(), 2);
    assert_eq!(read_all(&mut queue), vec![payload(0, 100), payload(1, 100)]);

    queue.add(&payload(2, 100)).unwrap();
    assert_eq!(queue.size(), 3);
}

// ============================================================================
// Recovery across wraparound
// ============================================================================

#[test]
fn test_remove_then_append_keeps_order_across_wraparound() {
    let temp_dir = TempDir::new().unwrap();

    for (initial, removed, appended) in [(10usize, 3usize, 5usize), (30, 25, 40), (60, 59, 12)] {
        let path = temp_dir
            .path()
            .join(format!("wrap-{}-{}-{}.tape", initial, removed, appended));
        {
            let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
            for i in 0..initial {
                queue.add(&payload(i, 90)).unwrap();
            }
            queue.remove(removed).unwrap();
            for i in initial..initial + appended {
                queue.add(&payload(i, 90)).unwrap();
            }
        }

        let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
        let all = read_all(&mut queue);
        assert_eq!(all.len(), initial - removed + appended);
        assert_eq!(all.first(), Some(&payload(removed, 90)));
        assert_eq!(all.last(), Some(&payload(initial + appended - 1, 90)));

        let expected: Vec<Vec<u8>> = (removed..initial + appended).map(|i| payload(i, 90)).collect();
        assert_eq!(all, expected);
    }
}

#[test]
fn test_wrapped_element_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("wrapped.tape");
    {
        let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
        for i in 0..7 {
            queue.add(&payload(i, 500)).unwrap();
        }
        queue.remove(5).unwrap();
        // Starts near the end of the 4096-byte file and wraps to the front.
        queue.add(&payload(7, 900)).unwrap();
        assert_eq!(queue.file_length(), 4096);
    }

    let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
    assert_eq!(
        read_all(&mut queue),
        vec![payload(5, 500), payload(6, 500), payload(7, 900)]
    );
}

// ============================================================================
// Checksums
// ============================================================================

#[test]
fn test_damaged_header_fails_open() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("header.tape");
    {
        let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
        queue.add(&payload(0, 10)).unwrap();
    }

    flip_byte(&path, 12);

    let err = QueueFile::open(&path, QueueFileConfig::default()).unwrap_err();
    assert!(err.is_corruption(), "unexpected error: {}", err);
}

#[test]
fn test_damaged_first_element_header_fails_open() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("first.tape");
    {
        let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
        queue.add(&payload(0, 10)).unwrap();
        queue.add(&payload(1, 10)).unwrap();
    }

    flip_byte(&path, HEADER_LENGTH + 1);

    let err = QueueFile::open(&path, QueueFileConfig::default()).unwrap_err();
    assert!(matches!(err, QueueError::Corrupted(_)));
}

#[test]
fn test_damaged_middle_element_header_fails_read() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("middle.tape");
    {
        let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
        for i in 0..3 {
            queue.add(&payload(i, 20)).unwrap();
        }
    }

    // Second element header starts right after the first element.
    flip_byte(&path, HEADER_LENGTH + ELEMENT_HEADER_LENGTH + 20 + 2);

    // First and last elements are intact, so the open succeeds ...
    let mut queue = QueueFile::open(&path, QueueFileConfig::default()).unwrap();
    assert_eq!(queue.peek().unwrap(), Some(payload(0, 20)));

    // ... but reading past the damaged header fails every time.
    for _ in 0..2 {
        let err = queue.peek_n(3).unwrap_err();
        assert!(err.is_corruption());
    }
    assert!(queue.remove(1).unwrap_err().is_corruption());
}
