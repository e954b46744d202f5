//! Main store implementation.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, info};

use chapel_types::{
    CacheEntry, CacheStats, OperationMetadata, OperationType, Priority, QueueStats,
    QueuedOperation,
};

use crate::error::{Error, Result};
use crate::models::StoredAsset;
use crate::queries::QueueQuery;
use crate::schema;

/// SQLite-based store for the offline cache, operation queue, metadata and
/// precached assets.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

pub(crate) fn to_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}

fn conversion_error(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, message.into())
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let ms: i64 = row.get(idx)?;
    from_millis(ms)
        .ok_or_else(|| conversion_error(idx, Type::Integer, format!("timestamp out of range: {}", ms)))
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(ms) => from_millis(ms).map(Some).ok_or_else(|| {
            conversion_error(idx, Type::Integer, format!("timestamp out of range: {}", ms))
        }),
        None => Ok(None),
    }
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, Type::Text, e.to_string()))
}

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: T::Err| conversion_error(idx, Type::Text, e.to_string()))
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedOperation> {
    let payload = match row.get::<_, Option<String>>(4)? {
        Some(text) => Some(
            serde_json::from_str(&text).map_err(|e| conversion_error(4, Type::Text, e.to_string()))?,
        ),
        None => None,
    };
    let rank: u8 = row.get(6)?;
    let priority = Priority::try_from(rank)
        .map_err(|e| conversion_error(6, Type::Integer, e.to_string()))?;

    Ok(QueuedOperation {
        id: row.get(0)?,
        op_type: parsed_column(row, 1)?,
        endpoint: row.get(2)?,
        method: parsed_column(row, 3)?,
        payload,
        headers: json_column::<BTreeMap<String, String>>(row, 5)?,
        priority,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        last_error: row.get(9)?,
        last_retry_time: optional_time_column(row, 10)?,
        enqueued_at: time_column(row, 11)?,
        metadata: OperationMetadata {
            category: row.get(12)?,
            description: row.get(13)?,
        },
    })
}

// Cache operations
impl Store {
    /// Insert or replace the cache entry for `entry.key`.
    pub fn put_cache_entry(&self, entry: &CacheEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        self.conn.execute(
            "INSERT INTO cache_entries (key, payload, size, stored_at, etag)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                size = excluded.size,
                stored_at = excluded.stored_at,
                etag = excluded.etag",
            rusqlite::params![
                entry.key,
                payload,
                payload.len() as i64,
                to_millis(entry.stored_at),
                entry.etag,
            ],
        )?;
        Ok(())
    }

    /// Get the cache entry for a key.
    pub fn get_cache_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row = self
            .conn
            .query_row(
                "SELECT payload, stored_at, etag FROM cache_entries WHERE key = ?",
                [key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        time_column(row, 1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((payload, stored_at, etag)) => Ok(Some(CacheEntry {
                key: key.to_string(),
                payload: serde_json::from_str(&payload)?,
                stored_at,
                etag,
            })),
            None => Ok(None),
        }
    }

    /// Delete a cache entry. Returns whether it existed.
    pub fn delete_cache_entry(&self, key: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM cache_entries WHERE key = ?", [key])?;
        Ok(n > 0)
    }

    /// Remove every cache entry.
    pub fn clear_cache(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM cache_entries", [])?)
    }

    /// Remove entries written before `cutoff`.
    pub fn evict_cache_older_than(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM cache_entries WHERE stored_at < ?",
            [to_millis(cutoff)],
        )?;
        debug!("Evicted {} cache entries older than {}", n, cutoff);
        Ok(n)
    }

    /// List cached keys, most recently written first.
    pub fn list_cache_keys(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM cache_entries ORDER BY stored_at DESC")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Aggregate statistics over the cache.
    pub fn cache_stats(&self) -> Result<CacheStats> {
        let stats = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0), MIN(stored_at), MAX(stored_at)
             FROM cache_entries",
            [],
            |row| {
                Ok(CacheStats {
                    total_items: row.get::<_, i64>(0)? as u64,
                    total_size: row.get::<_, i64>(1)? as u64,
                    oldest_item: optional_time_column(row, 2)?,
                    newest_item: optional_time_column(row, 3)?,
                })
            },
        )?;
        Ok(stats)
    }
}

// Queue operations
impl Store {
    /// Persist a newly queued operation.
    pub fn enqueue_operation(&self, op: &QueuedOperation) -> Result<()> {
        let payload = op
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let headers = serde_json::to_string(&op.headers)?;

        self.conn.execute(
            "INSERT INTO operation_queue (id, op_type, endpoint, method, payload, headers,
             priority, retry_count, max_retries, last_error, last_retry_time, enqueued_at,
             category, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            rusqlite::params![
                op.id,
                op.op_type.as_str(),
                op.endpoint,
                op.method.as_str(),
                payload,
                headers,
                op.priority.rank(),
                op.retry_count,
                op.max_retries,
                op.last_error,
                op.last_retry_time.map(to_millis),
                to_millis(op.enqueued_at),
                op.metadata.category,
                op.metadata.description,
            ],
        )?;

        debug!(
            "Queued {} {} {} (priority {})",
            op.id, op.method, op.endpoint, op.priority
        );
        Ok(())
    }

    /// Get a queued operation by id.
    pub fn get_operation(&self, id: &str) -> Result<Option<QueuedOperation>> {
        let sql = "SELECT id, op_type, endpoint, method, payload, headers, priority, retry_count, \
                   max_retries, last_error, last_retry_time, enqueued_at, category, description \
                   FROM operation_queue WHERE id = ?";
        Ok(self
            .conn
            .query_row(sql, [id], operation_from_row)
            .optional()?)
    }

    /// Query queued operations in replay order.
    pub fn query_operations(&self, query: &QueueQuery) -> Result<Vec<QueuedOperation>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let ops = stmt
            .query_map(params_ref.as_slice(), operation_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ops)
    }

    /// All queued operations in replay order.
    pub fn pending_operations(&self) -> Result<Vec<QueuedOperation>> {
        self.query_operations(&QueueQuery::new())
    }

    /// Record a failed replay attempt.
    pub fn record_operation_failure(
        &self,
        id: &str,
        retry_count: u32,
        error: &str,
        at: OffsetDateTime,
    ) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE operation_queue SET retry_count = ?2, last_error = ?3, last_retry_time = ?4
             WHERE id = ?1",
            rusqlite::params![id, retry_count, error, to_millis(at)],
        )?;

        if n == 0 {
            return Err(Error::OperationNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete a queued operation. Returns whether it existed.
    pub fn delete_operation(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM operation_queue WHERE id = ?", [id])?;
        Ok(n > 0)
    }

    /// Remove every queued operation.
    pub fn clear_queue(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM operation_queue", [])?)
    }

    pub fn count_operations(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM operation_queue", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Aggregate statistics over the queue.
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let mut stats = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN retry_count = 0 THEN 1 ELSE 0 END), 0),
                    MIN(enqueued_at), MAX(enqueued_at)
             FROM operation_queue",
            [],
            |row| {
                let total = row.get::<_, i64>(0)? as u64;
                let pending = row.get::<_, i64>(1)? as u64;
                Ok(QueueStats {
                    total,
                    pending,
                    retrying: total - pending,
                    oldest: optional_time_column(row, 2)?,
                    newest: optional_time_column(row, 3)?,
                    ..Default::default()
                })
            },
        )?;

        let mut stmt = self
            .conn
            .prepare("SELECT op_type, COUNT(*) FROM operation_queue GROUP BY op_type")?;
        let by_type = stmt
            .query_map([], |row| {
                Ok((
                    parsed_column::<OperationType>(row, 0)?,
                    row.get::<_, i64>(1)? as u64,
                ))
            })?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT priority, COUNT(*) FROM operation_queue GROUP BY priority")?;
        let by_priority = stmt
            .query_map([], |row| {
                let rank: u8 = row.get(0)?;
                let priority = Priority::try_from(rank)
                    .map_err(|e| conversion_error(0, Type::Integer, e.to_string()))?;
                Ok((priority, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

        stats.by_type = by_type;
        stats.by_priority = by_priority;
        Ok(stats)
    }
}

// Metadata operations
impl Store {
    /// Store a JSON-serializable value under `key`.
    pub fn set_metadata<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, text, to_millis(OffsetDateTime::now_utc())],
        )?;
        Ok(())
    }

    /// Load the value stored under `key`.
    pub fn get_metadata<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let text: Option<String> = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;

        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub fn delete_metadata(&self, key: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM metadata WHERE key = ?", [key])?;
        Ok(n > 0)
    }
}

// Asset cache operations
impl Store {
    /// Store a precached asset under a cache version.
    pub fn put_asset(
        &self,
        cache_version: &str,
        path: &str,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO asset_cache (cache_version, path, body, content_type, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                cache_version,
                path,
                body,
                content_type,
                to_millis(OffsetDateTime::now_utc())
            ],
        )?;
        Ok(())
    }

    pub fn get_asset(&self, cache_version: &str, path: &str) -> Result<Option<StoredAsset>> {
        Ok(self
            .conn
            .query_row(
                "SELECT cache_version, path, body, content_type, stored_at
                 FROM asset_cache WHERE cache_version = ?1 AND path = ?2",
                [cache_version, path],
                |row| {
                    Ok(StoredAsset {
                        cache_version: row.get(0)?,
                        path: row.get(1)?,
                        body: row.get(2)?,
                        content_type: row.get(3)?,
                        stored_at: time_column(row, 4)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn count_assets(&self, cache_version: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM asset_cache WHERE cache_version = ?",
            [cache_version],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Distinct cache versions currently stored.
    pub fn asset_versions(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT cache_version FROM asset_cache ORDER BY cache_version")?;
        let versions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(versions)
    }

    /// Delete every asset whose version differs from `keep`.
    pub fn delete_asset_versions_except(&self, keep: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM asset_cache WHERE cache_version != ?", [keep])?)
    }
}
