//! Table cache backend: one SQLite database shared by every topic.
//!
//! Each topic's records are the rows of `measurements` with its name; the
//! autoincrement row id is the record offset. Acknowledged rows are deleted.

use super::worker::CacheStorage;
use super::Measurement;
use crate::error::Result;
use crate::record::{time_received_ms, Record};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

/// Open the measurement database at `url`, creating it and its table if
/// needed.
///
/// `sqlite::memory:` gives a private in-memory database held open by a
/// single connection.
pub async fn connect_database(url: &str) -> Result<SqlitePool> {
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await?
    } else {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!(url, "Opened measurement database");
    Ok(pool)
}

/// [`CacheStorage`] holding one topic's rows.
pub struct TableStorage {
    topic: String,
    pool: SqlitePool,
}

impl TableStorage {
    pub fn new(topic: &str, pool: SqlitePool) -> Self {
        Self {
            topic: topic.to_string(),
            pool,
        }
    }
}

#[async_trait]
impl CacheStorage for TableStorage {
    async fn append(&mut self, measurements: Vec<Measurement>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for m in measurements {
            sqlx::query(
                "INSERT INTO measurements (topic, key, value, time_received, enqueued_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&self.topic)
            .bind(serde_json::to_string(&m.key)?)
            .bind(serde_json::to_string(&m.value)?)
            .bind(time_received_ms(&m.value).map(|t| t as i64))
            .bind(m.enqueued_at_ms as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn peek(&mut self, limit: usize) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            "SELECT record_offset, key, value, enqueued_at
             FROM measurements WHERE topic = ?
             ORDER BY record_offset LIMIT ?",
        )
        .bind(&self.topic)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Record {
                    offset: row.get("record_offset"),
                    key: serde_json::from_str(row.get("key"))?,
                    value: serde_json::from_str(row.get("value"))?,
                    enqueued_at_ms: row.get::<i64, _>("enqueued_at") as u64,
                })
            })
            .collect()
    }

    async fn remove_through(&mut self, offset: i64) -> Result<usize> {
        let result = sqlx::query("DELETE FROM measurements WHERE topic = ? AND record_offset <= ?")
            .bind(&self.topic)
            .bind(offset)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn remove_before(&mut self, timestamp_ms: u64) -> Result<usize> {
        let result = sqlx::query("DELETE FROM measurements WHERE topic = ? AND time_received < ?")
            .bind(&self.topic)
            .bind(timestamp_ms as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&mut self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM measurements WHERE topic = ?")
            .bind(&self.topic)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") as usize)
    }

    /// The pool is shared with other topics and closed by its owner.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
