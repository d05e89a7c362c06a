//! Primary/fallback storage switching.
//!
//! Every operation is tried against the primary first. A primary failure or
//! timeout marks the store degraded and the operation is retried against the
//! fallback. While degraded, the primary is re-probed at most once per
//! `reprobe_interval`; the first successful probe routes traffic back.
//!
//! Reads consult both backends and keep the copy with the newest
//! `updated_at`, so a value written during an outage wins over the primary's
//! older copy even after a restart. Keys diverted by this process skip the
//! comparison.
//!
//! Log sequence numbers are assigned here, not by the backends. While the
//! primary's position is unknown (degraded since startup) a fallback seq can
//! repeat one the primary already holds, so `tail` merges by record time and
//! keeps both records of a collision.
//!
//! Every return of the primary bumps the [`FallbackStore::recoveries`]
//! counter; [`FallbackStore::spawn_resync`] re-reads cached state on each
//! bump.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{KvRecord, LogRecord, MemoryBackend, Resync, StorageBackend, StorageError};

/// Timing knobs for [`FallbackStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Upper bound for any single backend call.
    pub op_timeout: Duration,
    /// Minimum delay between primary probes while degraded.
    pub reprobe_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(2),
            reprobe_interval: Duration::from_secs(5),
        }
    }
}

/// Health summary for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub primary: String,
    pub fallback: String,
    pub degraded: bool,
    pub diverted_keys: usize,
    /// Times the primary came back after an outage.
    pub recoveries: u64,
}

/// The tail of a log stream and whether both backends contributed to it.
#[derive(Debug, Clone)]
pub struct LogTail {
    pub records: Vec<LogRecord>,
    /// `false` when one backend did not answer; records only it holds are
    /// missing.
    pub complete: bool,
}

/// Merge position of a log record: record time, then seq, then which
/// backend it came from.
type LogKey = (DateTime<Utc>, u64, u8);

const FROM_PRIMARY: u8 = 0;
const FROM_FALLBACK: u8 = 1;

/// Persistence adapter with transparent fallback.
#[derive(Debug)]
pub struct FallbackStore {
    primary: Arc<dyn StorageBackend>,
    fallback: Arc<dyn StorageBackend>,
    options: StoreOptions,
    degraded: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
    /// Keys whose latest value lives in the fallback.
    diverted: DashSet<String>,
    /// Per-stream append lock holding the last assigned seq.
    streams: DashMap<String, Arc<tokio::sync::Mutex<Option<u64>>>>,
    recovered: watch::Sender<u64>,
}

impl FallbackStore {
    /// Build a store without probing the primary.
    pub fn new(
        primary: Arc<dyn StorageBackend>,
        fallback: Arc<dyn StorageBackend>,
        options: StoreOptions,
    ) -> Self {
        Self {
            primary,
            fallback,
            options,
            degraded: AtomicBool::new(false),
            last_probe: Mutex::new(None),
            diverted: DashSet::new(),
            streams: DashMap::new(),
            recovered: watch::Sender::new(0),
        }
    }

    /// Build a store and probe the primary once; an unreachable primary
    /// starts the store in degraded mode.
    pub async fn connect(
        primary: Arc<dyn StorageBackend>,
        fallback: Arc<dyn StorageBackend>,
        options: StoreOptions,
    ) -> Self {
        let store = Self::new(primary, fallback, options);
        if let Err(e) = store
            .bounded(store.primary.name(), "ping", store.primary.ping())
            .await
        {
            warn!(
                primary = store.primary.name(),
                fallback = store.fallback.name(),
                error = %e,
                "Primary storage unreachable at startup, serving from fallback"
            );
            store.mark_degraded();
        }
        store
    }

    /// Two process-local backends. Handy for tests and throwaway runs.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBackend::new("memory-primary")),
            Arc::new(MemoryBackend::new("memory-fallback")),
            StoreOptions::default(),
        )
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            primary: self.primary.name().to_string(),
            fallback: self.fallback.name().to_string(),
            degraded: self.is_degraded(),
            diverted_keys: self.diverted.len(),
            recoveries: *self.recovered.borrow(),
        }
    }

    /// Counter bumped every time the primary is reachable again after an
    /// outage.
    pub fn recoveries(&self) -> watch::Receiver<u64> {
        self.recovered.subscribe()
    }

    /// Run every target's [`Resync::resync`] after each primary recovery.
    /// The task ends when the store is dropped.
    pub fn spawn_resync(&self, targets: Vec<Arc<dyn Resync>>) -> JoinHandle<()> {
        let mut recoveries = self.recoveries();
        tokio::spawn(async move {
            while recoveries.changed().await.is_ok() {
                for target in &targets {
                    match target.resync().await {
                        Ok(adopted) => {
                            info!(cache = target.label(), adopted, "Cached state resynced after primary recovery")
                        }
                        Err(e) => warn!(cache = target.label(), error = %e, "Resync after primary recovery failed"),
                    }
                }
            }
        })
    }

    // --- Key-value ---

    /// Durably store `value` under `key`. Returns only after a backend
    /// confirmed the write.
    pub async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let record = KvRecord {
            value,
            updated_at: Utc::now(),
        };

        if self.primary_usable().await {
            match self
                .bounded(self.primary.name(), "put", self.primary.put(key, &record))
                .await
            {
                Ok(()) => {
                    self.diverted.remove(key);
                    return Ok(());
                }
                Err(e) => self.note_primary_failure("put", &e),
            }
        }

        match self
            .bounded(self.fallback.name(), "put", self.fallback.put(key, &record))
            .await
        {
            Ok(()) => {
                self.diverted.insert(key.to_string());
                Ok(())
            }
            Err(e) => Err(StorageError::Unavailable {
                message: format!("write of '{key}' not confirmed by any backend: {e}"),
            }),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        if self.diverted.contains(key) {
            return self
                .bounded(self.fallback.name(), "get", self.fallback.get(key))
                .await
                .map(|r| r.map(|r| r.value))
                .map_err(|e| StorageError::Unavailable {
                    message: format!("read of '{key}' failed on fallback: {e}"),
                });
        }

        let mut from_primary = None;
        let mut primary_answered = false;
        if self.primary_usable().await {
            match self
                .bounded(self.primary.name(), "get", self.primary.get(key))
                .await
            {
                Ok(record) => {
                    primary_answered = true;
                    from_primary = record;
                }
                Err(e) => self.note_primary_failure("get", &e),
            }
        }

        // The fallback may hold a newer copy from an earlier outage, possibly
        // one from before this process started.
        match self
            .bounded(self.fallback.name(), "get", self.fallback.get(key))
            .await
        {
            Ok(from_fallback) => Ok(newest(from_primary, from_fallback).map(|r| r.value)),
            Err(_) if primary_answered => Ok(from_primary.map(|r| r.value)),
            Err(e) => Err(StorageError::Unavailable {
                message: format!("read of '{key}' failed on every backend: {e}"),
            }),
        }
    }

    /// Every pair under `prefix`, merged across both backends.
    pub async fn scan(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let mut merged: BTreeMap<String, KvRecord> = BTreeMap::new();
        let mut answered = false;
        let mut last_error = None;

        if self.primary_usable().await {
            match self
                .bounded(self.primary.name(), "scan", self.primary.scan(prefix))
                .await
            {
                Ok(rows) => {
                    answered = true;
                    merged.extend(rows);
                }
                Err(e) => {
                    self.note_primary_failure("scan", &e);
                    last_error = Some(e);
                }
            }
        }

        match self
            .bounded(self.fallback.name(), "scan", self.fallback.scan(prefix))
            .await
        {
            Ok(rows) => {
                answered = true;
                for (key, record) in rows {
                    let prefer_fallback = self.diverted.contains(&key)
                        || merged
                            .get(&key)
                            .map_or(true, |existing| record.updated_at > existing.updated_at);
                    if prefer_fallback {
                        merged.insert(key, record);
                    }
                }
            }
            Err(e) => last_error = Some(e),
        }

        if !answered {
            return Err(StorageError::Unavailable {
                message: format!(
                    "scan of '{prefix}' failed on every backend: {}",
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                ),
            });
        }

        Ok(merged.into_iter().map(|(k, r)| (k, r.value)).collect())
    }

    // --- Logs ---

    /// Append `payload` to `stream`. Appends to one stream are serialized,
    /// so sequence numbers follow commit order.
    pub async fn append(&self, stream: &str, payload: Value) -> Result<LogRecord, StorageError> {
        let lock = self
            .streams
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone();
        let mut last = lock.lock().await;

        let base = match *last {
            Some(seq) => seq,
            None => {
                let (seed, complete) = self.seed_seq(stream).await?;
                // A seed seen by only one backend is recomputed next time.
                if complete {
                    *last = Some(seed);
                }
                seed
            }
        };

        let record = LogRecord {
            seq: base + 1,
            recorded_at: Utc::now(),
            payload,
        };

        let mut written = false;
        if self.primary_usable().await {
            match self
                .bounded(self.primary.name(), "append", self.primary.append(stream, &record))
                .await
            {
                Ok(()) => written = true,
                Err(e) => self.note_primary_failure("append", &e),
            }
        }
        if !written {
            self.bounded(self.fallback.name(), "append", self.fallback.append(stream, &record))
                .await
                .map_err(|e| StorageError::Unavailable {
                    message: format!("append to '{stream}' not confirmed by any backend: {e}"),
                })?;
        }

        if last.is_some() {
            *last = Some(record.seq);
        }
        Ok(record)
    }

    /// The last `n` records of `stream` across both backends, oldest first.
    pub async fn tail(&self, stream: &str, n: usize) -> Result<Vec<LogRecord>, StorageError> {
        Ok(self.tail_with_coverage(stream, n).await?.records)
    }

    /// [`tail`](Self::tail), also reporting whether both backends answered.
    pub async fn tail_with_coverage(&self, stream: &str, n: usize) -> Result<LogTail, StorageError> {
        let mut merged: BTreeMap<LogKey, LogRecord> = BTreeMap::new();
        let mut answers = 0;
        let mut last_error = None;

        if self.primary_usable().await {
            match self
                .bounded(self.primary.name(), "tail", self.primary.tail(stream, n))
                .await
            {
                Ok(records) => {
                    answers += 1;
                    merged.extend(
                        records
                            .into_iter()
                            .map(|r| ((r.recorded_at, r.seq, FROM_PRIMARY), r)),
                    );
                }
                Err(e) => {
                    self.note_primary_failure("tail", &e);
                    last_error = Some(e);
                }
            }
        }

        match self
            .bounded(self.fallback.name(), "tail", self.fallback.tail(stream, n))
            .await
        {
            Ok(records) => {
                answers += 1;
                merged.extend(
                    records
                        .into_iter()
                        .map(|r| ((r.recorded_at, r.seq, FROM_FALLBACK), r)),
                );
            }
            Err(e) => last_error = Some(e),
        }

        if answers == 0 {
            return Err(StorageError::Unavailable {
                message: format!(
                    "tail of '{stream}' failed on every backend: {}",
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                ),
            });
        }

        let skip = merged.len().saturating_sub(n);
        Ok(LogTail {
            records: merged.into_values().skip(skip).collect(),
            complete: answers == 2,
        })
    }

    // --- Internals ---

    async fn seed_seq(&self, stream: &str) -> Result<(u64, bool), StorageError> {
        let mut seed = 0;
        let mut answers = 0;

        if self.primary_usable().await {
            match self
                .bounded(self.primary.name(), "max_seq", self.primary.max_seq(stream))
                .await
            {
                Ok(max) => {
                    answers += 1;
                    seed = seed.max(max.unwrap_or(0));
                }
                Err(e) => self.note_primary_failure("max_seq", &e),
            }
        }
        match self
            .bounded(self.fallback.name(), "max_seq", self.fallback.max_seq(stream))
            .await
        {
            Ok(max) => {
                answers += 1;
                seed = seed.max(max.unwrap_or(0));
            }
            Err(e) if answers == 0 => {
                return Err(StorageError::Unavailable {
                    message: format!("cannot position stream '{stream}': {e}"),
                })
            }
            Err(_) => {}
        }

        Ok((seed, answers == 2))
    }

    async fn bounded<T>(
        &self,
        backend: &str,
        op: &'static str,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.options.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                backend: backend.to_string(),
                op,
                timeout_ms: self.options.op_timeout.as_millis() as u64,
            }),
        }
    }

    async fn primary_usable(&self) -> bool {
        if !self.is_degraded() {
            return true;
        }
        {
            let mut last = self.last_probe.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.options.reprobe_interval {
                    return false;
                }
            }
            *last = Some(Instant::now());
        }

        match self
            .bounded(self.primary.name(), "ping", self.primary.ping())
            .await
        {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!(primary = self.primary.name(), "Primary storage reachable again");
                    self.recovered.send_modify(|n| *n += 1);
                }
                true
            }
            Err(e) => {
                debug!(primary = self.primary.name(), error = %e, "Primary storage still unreachable");
                false
            }
        }
    }

    fn note_primary_failure(&self, op: &'static str, error: &StorageError) {
        warn!(
            primary = self.primary.name(),
            fallback = self.fallback.name(),
            op,
            error = %error,
            "Primary storage failed, switching to fallback"
        );
        self.mark_degraded();
    }

    fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::SeqCst);
        *self.last_probe.lock() = Some(Instant::now());
    }
}

/// The more recently written of two copies; the fallback wins ties.
fn newest(primary: Option<KvRecord>, fallback: Option<KvRecord>) -> Option<KvRecord> {
    match (primary, fallback) {
        (Some(p), Some(f)) if p.updated_at > f.updated_at => Some(p),
        (_, Some(f)) => Some(f),
        (p, None) => p,
    }
}
