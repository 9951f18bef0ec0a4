//! Partitioned key-value store with lazy TTL expiry.

use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Logical partitions of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Cached GET responses.
    Cache,
    /// Pending sync operations.
    Queue,
    /// Miscellaneous application key-values (configuration lives here).
    Data,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Cache, Partition::Queue, Partition::Data];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Cache => "cache",
            Partition::Queue => "queue",
            Partition::Data => "data",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable store backed by a single SQLite connection.
///
/// Cloning is cheap and every clone shares the same connection. All calls run
/// on the blocking pool, so awaiting them never stalls the async executor.
/// The connection mutex serializes every read and write.
#[derive(Clone)]
pub struct PersistentStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStore").finish_non_exhaustive()
    }
}

impl PersistentStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the time source used for TTL checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the live value for `key`, or `None` if absent or expired.
    ///
    /// An expired record is deleted on the way out, but a failure to delete
    /// does not change the answer.
    pub async fn get(&self, partition: Partition, key: &str) -> StoreResult<Option<Value>> {
        let key = key.to_string();
        self.with_conn(move |conn, now| {
            let row: Option<(String, Option<i64>)> = conn
                .query_row(
                    "SELECT value, expires_at FROM entries WHERE partition = ?1 AND key = ?2",
                    params![partition.as_str(), key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((raw, expires_at)) = row else {
                return Ok(None);
            };

            if is_expired(expires_at, now) {
                if let Err(e) = conn.execute(
                    "DELETE FROM entries WHERE partition = ?1 AND key = ?2",
                    params![partition.as_str(), key],
                ) {
                    debug!("lazy expiry of {partition}/{key} failed: {e}");
                }
                return Ok(None);
            }

            Ok(Some(serde_json::from_str(&raw)?))
        })
        .await
    }

    /// Writes `value` under `key`. With a `ttl`, the entry expires once
    /// `now >= write_time + ttl`.
    ///
    /// Overwriting an existing key keeps its position in [`list_all`](Self::list_all).
    pub async fn set(
        &self,
        partition: Partition,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let key = key.to_string();
        let raw = serde_json::to_string(value)?;
        self.with_conn(move |conn, now| {
            let expires_at = ttl.map(|t| now.saturating_add(t.as_millis() as i64));
            conn.execute(
                "INSERT INTO entries (partition, key, value, written_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(partition, key) DO UPDATE SET
                     value = excluded.value,
                     written_at = excluded.written_at,
                     expires_at = excluded.expires_at",
                params![partition.as_str(), key, raw, now, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    /// Deletes `key`. Returns true if a record was removed.
    pub async fn delete(&self, partition: Partition, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.with_conn(move |conn, _| {
            let removed = conn.execute(
                "DELETE FROM entries WHERE partition = ?1 AND key = ?2",
                params![partition.as_str(), key],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    /// Lists live entries in first-insertion order.
    pub async fn list_all(&self, partition: Partition) -> StoreResult<Vec<(String, Value)>> {
        self.with_conn(move |conn, now| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM entries
                 WHERE partition = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![partition.as_str(), now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (key, raw) = row?;
                entries.push((key, serde_json::from_str(&raw)?));
            }
            Ok(entries)
        })
        .await
    }

    /// Removes every record in the partition.
    pub async fn clear(&self, partition: Partition) -> StoreResult<()> {
        self.with_conn(move |conn, _| {
            conn.execute(
                "DELETE FROM entries WHERE partition = ?1",
                params![partition.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    /// Number of live entries in the partition.
    pub async fn count(&self, partition: Partition) -> StoreResult<usize> {
        self.with_conn(move |conn, now| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entries
                 WHERE partition = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![partition.as_str(), now],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    /// Deletes every expired record across all partitions.
    pub async fn purge_expired(&self) -> StoreResult<usize> {
        let removed = self
            .with_conn(move |conn, now| {
                let removed = conn.execute(
                    "DELETE FROM entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                    params![now],
                )?;
                Ok(removed)
            })
            .await?;
        if removed > 0 {
            debug!("purged {removed} expired entries");
        }
        Ok(removed)
    }

    // ── Typed helpers ──

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        partition: Partition,
        key: &str,
    ) -> StoreResult<Option<T>> {
        match self.get(partition, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        partition: Partition,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(partition, key, &value, ttl).await
    }

    /// Read-modify-write of a live entry in one step.
    ///
    /// `change` edits the decoded value and returns whether to write it back.
    /// Returns the current value, or `None` without writing when the key is
    /// absent or expired. Expiry and list position are left as they were.
    pub async fn update_json<T, F>(
        &self,
        partition: Partition,
        key: &str,
        change: F,
    ) -> StoreResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(&mut T) -> bool + Send + 'static,
    {
        let key = key.to_string();
        self.with_conn(move |conn, now| {
            let row: Option<(String, Option<i64>)> = conn
                .query_row(
                    "SELECT value, expires_at FROM entries WHERE partition = ?1 AND key = ?2",
                    params![partition.as_str(), key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((raw, expires_at)) = row else {
                return Ok(None);
            };
            if is_expired(expires_at, now) {
                return Ok(None);
            }

            let mut value: T = serde_json::from_str(&raw)?;
            if change(&mut value) {
                conn.execute(
                    "UPDATE entries SET value = ?3, written_at = ?4
                     WHERE partition = ?1 AND key = ?2",
                    params![partition.as_str(), key, serde_json::to_string(&value)?, now],
                )?;
            }
            Ok(Some(value))
        })
        .await
    }

    pub async fn list_json<T: DeserializeOwned>(&self, partition: Partition) -> StoreResult<Vec<T>> {
        self.list_all(partition)
            .await?
            .into_iter()
            .map(|(_, value)| serde_json::from_value(value).map_err(StoreError::from))
            .collect()
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, i64) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let now = self.clock.now_millis();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&*guard, now)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

fn is_expired(expires_at: Option<i64>, now: i64) -> bool {
    expires_at.is_some_and(|t| now >= t)
}

fn initialize_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            partition TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            written_at INTEGER NOT NULL,
            expires_at INTEGER,
            UNIQUE(partition, key)
        );
        CREATE INDEX IF NOT EXISTS idx_entries_expiry ON entries(expires_at);
        "#,
    )?;
    Ok(())
}
