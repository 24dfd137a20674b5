//! Cached measurement records.

use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A measurement with its per-topic offset.
#[derive(Debug, Clone)]
pub struct Record {
    /// Per-topic sequence number assigned by the cache on durable append
    pub offset: i64,

    /// Key record (user and source identifiers)
    pub key: Value,

    /// Value record, with `time` and `timeReceived` fields
    pub value: Value,

    /// Local wall-clock time the record entered memory, in milliseconds
    pub enqueued_at_ms: u64,
}

impl Record {
    /// Create a record stamped with the current time.
    pub fn new(offset: i64, key: Value, value: Value) -> Self {
        Self {
            offset,
            key,
            value,
            enqueued_at_ms: now_ms(),
        }
    }

    /// The value's `timeReceived` field in milliseconds, if present.
    pub fn time_received_ms(&self) -> Option<u64> {
        time_received_ms(&self.value)
    }

    /// Time since the record was enqueued.
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.enqueued_at_ms))
    }
}

/// Read `timeReceived` (seconds, possibly fractional) from a value record.
pub fn time_received_ms(value: &Value) -> Option<u64> {
    value
        .get("timeReceived")
        .and_then(Value::as_f64)
        .filter(|seconds| *seconds >= 0.0)
        .map(|seconds| (seconds * 1000.0) as u64)
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
