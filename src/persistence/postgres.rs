//! PostgreSQL storage backend.
//!
//! Requires the `postgres` feature flag:
//! ```toml
//! [dependencies]
//! agentgate = { features = ["postgres"] }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use super::{KvRecord, LogRecord, StorageBackend, StorageError};

const BACKEND: &str = "postgres";

/// PostgreSQL implementation of [`StorageBackend`].
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect lazily; the first real query establishes the connection.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect_lazy(database_url).map_err(|e| StorageError::backend(BACKEND, e))?;
        Ok(Self::new(pool))
    }

    /// Create the `agentgate_kv` and `agentgate_log` tables if missing.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agentgate_kv (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::backend(BACKEND, e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agentgate_log (
                stream TEXT NOT NULL,
                seq BIGINT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                PRIMARY KEY (stream, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::backend(BACKEND, e))?;

        Ok(())
    }
}

#[async_trait]
impl StorageBackend for PgBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::backend(BACKEND, e))?;
        Ok(())
    }

    async fn put(&self, key: &str, record: &KvRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO agentgate_kv (key, value, updated_at) VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(&record.value)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::backend(BACKEND, e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KvRecord>, StorageError> {
        let row = sqlx::query("SELECT value, updated_at FROM agentgate_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::backend(BACKEND, e))?;

        Ok(row.map(|row| KvRecord {
            value: row.get::<Value, _>("value"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        }))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, KvRecord)>, StorageError> {
        let rows = sqlx::query(
            "SELECT key, value, updated_at FROM agentgate_kv WHERE left(key, $2) = $1 ORDER BY key",
        )
        .bind(prefix)
        .bind(prefix.chars().count() as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::backend(BACKEND, e))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("key"),
                    KvRecord {
                        value: row.get::<Value, _>("value"),
                        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
                    },
                )
            })
            .collect())
    }

    async fn append(&self, stream: &str, record: &LogRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO agentgate_log (stream, seq, recorded_at, payload) VALUES ($1, $2, $3, $4)",
        )
        .bind(stream)
        .bind(record.seq as i64)
        .bind(record.recorded_at)
        .bind(&record.payload)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::backend(BACKEND, e))?;
        Ok(())
    }

    async fn tail(&self, stream: &str, n: usize) -> Result<Vec<LogRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT seq, recorded_at, payload FROM agentgate_log
             WHERE stream = $1 ORDER BY seq DESC LIMIT $2",
        )
        .bind(stream)
        .bind(n.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::backend(BACKEND, e))?;

        let mut out: Vec<LogRecord> = rows
            .into_iter()
            .map(|row| LogRecord {
                seq: row.get::<i64, _>("seq") as u64,
                recorded_at: row.get::<DateTime<Utc>, _>("recorded_at"),
                payload: row.get::<Value, _>("payload"),
            })
            .collect();
        out.reverse();
        Ok(out)
    }

    async fn max_seq(&self, stream: &str) -> Result<Option<u64>, StorageError> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(seq) FROM agentgate_log WHERE stream = $1")
                .bind(stream)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::backend(BACKEND, e))?;
        Ok(max.map(|v| v as u64))
    }
}
