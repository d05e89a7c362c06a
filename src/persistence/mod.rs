//! Durable key-value and append-only log storage.
//!
//! Components above this layer talk to a [`FallbackStore`], which wraps a
//! primary [`StorageBackend`] and an embedded fallback. Switching between the
//! two is invisible to callers; the only failure they ever see is
//! [`StorageError::Unavailable`] when neither backend confirmed the operation.
//!
//! Backends:
//!
//! - [`SqliteBackend`]: rusqlite, file-backed or in-memory.
//! - [`MemoryBackend`]: process-local maps, with an offline switch for
//!   outage drills.
//! - `PgBackend`: PostgreSQL via sqlx (feature `postgres`).

pub mod fallback;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use fallback::{FallbackStore, LogTail, StoreOptions, StoreStatus};
pub use memory::MemoryBackend;
#[cfg(feature = "postgres")]
pub use postgres::PgBackend;
pub use sqlite::SqliteBackend;

/// Errors raised by storage backends and the fallback store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A single backend rejected or failed the operation.
    #[error("{backend} backend error: {message}")]
    Backend { backend: String, message: String },

    /// A single backend did not answer in time.
    #[error("{backend} backend timed out during {op} after {timeout_ms}ms")]
    Timeout {
        backend: String,
        op: &'static str,
        timeout_ms: u64,
    },

    /// Neither the primary nor the fallback confirmed the operation.
    #[error("storage unavailable: {message}")]
    Unavailable { message: String },

    /// A stored payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn backend(backend: &str, message: impl fmt::Display) -> Self {
        StorageError::Backend {
            backend: backend.to_string(),
            message: message.to_string(),
        }
    }
}

/// A value stored under a key, with the time it was last written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvRecord {
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

/// One entry of an append-only log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Position in the stream, strictly increasing within one backend.
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub payload: Value,
}

/// In-memory state that caches what storage holds and can catch up with it.
#[async_trait]
pub trait Resync: Send + Sync {
    fn label(&self) -> &str;

    /// Adopt stored items that are missing from, or newer than, the cached
    /// copy. Returns how many were adopted.
    async fn resync(&self) -> Result<usize, StorageError>;
}

/// A storage backend: last-write-wins key-value pairs plus named
/// append-only log streams.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &str;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Insert or overwrite `key`.
    async fn put(&self, key: &str, record: &KvRecord) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Option<KvRecord>, StorageError>;

    /// All pairs whose key starts with `prefix`, ordered by key.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, KvRecord)>, StorageError>;

    /// Append a record. Appending an already-used `seq` is an error.
    async fn append(&self, stream: &str, record: &LogRecord) -> Result<(), StorageError>;

    /// The last `n` records of `stream`, oldest first.
    async fn tail(&self, stream: &str, n: usize) -> Result<Vec<LogRecord>, StorageError>;

    /// Highest `seq` written to `stream`, if any.
    async fn max_seq(&self, stream: &str) -> Result<Option<u64>, StorageError>;
}
