//! SQLite storage backend.
//!
//! rusqlite is synchronous, so every call hops onto the blocking pool with
//! `tokio::task::spawn_blocking` and the shared connection sits behind a
//! mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{KvRecord, LogRecord, StorageBackend, StorageError};

const BACKEND: &str = "sqlite";

/// SQLite-backed implementation of [`StorageBackend`].
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    /// Database location, `None` for an in-memory database.
    pub db_path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) a database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::backend(BACKEND, e))?;
            }
        }
        let conn = Connection::open(&path).map_err(|e| StorageError::backend(BACKEND, e))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(|e| StorageError::backend(BACKEND, e))?;
        Self::init(conn, Some(path))
    }

    /// A private in-memory database, mostly useful in tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::backend(BACKEND, e))?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, db_path: Option<PathBuf>) -> Result<Self, StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS log (
                stream TEXT NOT NULL,
                seq INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (stream, seq)
            );",
        )
        .map_err(|e| StorageError::backend(BACKEND, e))?;

        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| StorageError::backend(BACKEND, format!("blocking task failed: {e}")))?
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::backend(BACKEND, format!("bad timestamp '{raw}': {e}")))
}

fn decode_kv(value: &str, updated_at: &str) -> Result<KvRecord, StorageError> {
    Ok(KvRecord {
        value: serde_json::from_str(value)?,
        updated_at: parse_time(updated_at)?,
    })
}

fn decode_log(seq: i64, recorded_at: &str, payload: &str) -> Result<LogRecord, StorageError> {
    Ok(LogRecord {
        seq: seq as u64,
        recorded_at: parse_time(recorded_at)?,
        payload: serde_json::from_str(payload)?,
    })
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| StorageError::backend(BACKEND, e))
        })
        .await
    }

    async fn put(&self, key: &str, record: &KvRecord) -> Result<(), StorageError> {
        let key = key.to_string();
        let value = serde_json::to_string(&record.value)?;
        let updated_at = record.updated_at.to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, updated_at],
            )
            .map_err(|e| StorageError::backend(BACKEND, e))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<KvRecord>, StorageError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT value, updated_at FROM kv WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()
                .map_err(|e| StorageError::backend(BACKEND, e))?;
            row.map(|(value, updated_at)| decode_kv(&value, &updated_at))
                .transpose()
        })
        .await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, KvRecord)>, StorageError> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key, value, updated_at FROM kv
                     WHERE substr(key, 1, ?2) = ?1
                     ORDER BY key",
                )
                .map_err(|e| StorageError::backend(BACKEND, e))?;
            let rows = stmt
                .query_map(params![prefix, prefix.chars().count() as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| StorageError::backend(BACKEND, e))?;

            let mut out = Vec::new();
            for row in rows {
                let (key, value, updated_at) = row.map_err(|e| StorageError::backend(BACKEND, e))?;
                out.push((key, decode_kv(&value, &updated_at)?));
            }
            Ok(out)
        })
        .await
    }

    async fn append(&self, stream: &str, record: &LogRecord) -> Result<(), StorageError> {
        let stream = stream.to_string();
        let seq = record.seq as i64;
        let recorded_at = record.recorded_at.to_rfc3339();
        let payload = serde_json::to_string(&record.payload)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO log (stream, seq, recorded_at, payload) VALUES (?1, ?2, ?3, ?4)",
                params![stream, seq, recorded_at, payload],
            )
            .map_err(|e| StorageError::backend(BACKEND, e))?;
            Ok(())
        })
        .await
    }

    async fn tail(&self, stream: &str, n: usize) -> Result<Vec<LogRecord>, StorageError> {
        let stream = stream.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT seq, recorded_at, payload FROM log
                     WHERE stream = ?1
                     ORDER BY seq DESC
                     LIMIT ?2",
                )
                .map_err(|e| StorageError::backend(BACKEND, e))?;
            let rows = stmt
                .query_map(params![stream, n.min(i64::MAX as usize) as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| StorageError::backend(BACKEND, e))?;

            let mut out = Vec::new();
            for row in rows {
                let (seq, recorded_at, payload) =
                    row.map_err(|e| StorageError::backend(BACKEND, e))?;
                out.push(decode_log(seq, &recorded_at, &payload)?);
            }
            out.reverse();
            Ok(out)
        })
        .await
    }

    async fn max_seq(&self, stream: &str) -> Result<Option<u64>, StorageError> {
        let stream = stream.to_string();
        self.with_conn(move |conn| {
            let max: Option<i64> = conn
                .query_row(
                    "SELECT MAX(seq) FROM log WHERE stream = ?1",
                    params![stream],
                    |row| row.get(0),
                )
                .map_err(|e| StorageError::backend(BACKEND, e))?;
            Ok(max.map(|v| v as u64))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kv(value: serde_json::Value) -> KvRecord {
        KvRecord {
            value,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sqlite_put_overwrites() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.put("bb/k", &kv(json!("v1"))).await.unwrap();
        backend.put("bb/k", &kv(json!("v2"))).await.unwrap();

        let got = backend.get("bb/k").await.unwrap().unwrap();
        assert_eq!(got.value, json!("v2"));
        assert!(backend.get("bb/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_scan_prefix() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.put("budget/a", &kv(json!(1))).await.unwrap();
        backend.put("budget/b", &kv(json!(2))).await.unwrap();
        backend.put("bb/c", &kv(json!(3))).await.unwrap();

        let rows = backend.scan("budget/").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "budget/a");
        assert_eq!(rows[1].1.value, json!(2));
    }

    #[tokio::test]
    async fn test_sqlite_log_tail_is_chronological() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for seq in 1..=5u64 {
            let record = LogRecord {
                seq,
                recorded_at: Utc::now(),
                payload: json!({ "seq": seq }),
            };
            backend.append("audit", &record).await.unwrap();
        }

        let tail = backend.tail("audit", 3).await.unwrap();
        let seqs: Vec<u64> = tail.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(backend.max_seq("audit").await.unwrap(), Some(5));
        assert_eq!(backend.max_seq("usage").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.put("bb/k", &kv(json!({"x": 1}))).await.unwrap();
        }
        let reopened = SqliteBackend::open(&path).unwrap();
        let got = reopened.get("bb/k").await.unwrap().unwrap();
        assert_eq!(got.value["x"], 1);
    }
}
