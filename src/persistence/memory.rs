//! Process-local storage backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{KvRecord, LogRecord, StorageBackend, StorageError};

/// In-memory backend.
///
/// Serves as the embedded fallback when no fallback file is configured.
/// [`MemoryBackend::set_online`] flips the backend into a failing state so
/// outages can be rehearsed without a real network.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    kv: RwLock<BTreeMap<String, KvRecord>>,
    logs: RwLock<HashMap<String, Vec<LogRecord>>>,
    online: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kv: RwLock::new(BTreeMap::new()),
            logs: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away (`false`) or coming back (`true`).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of stored keys, regardless of the online flag.
    pub fn key_count(&self) -> usize {
        self.kv.read().len()
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(StorageError::backend(&self.name, "backend offline"))
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_online()
    }

    async fn put(&self, key: &str, record: &KvRecord) -> Result<(), StorageError> {
        self.check_online()?;
        self.kv.write().insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KvRecord>, StorageError> {
        self.check_online()?;
        Ok(self.kv.read().get(key).cloned())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, KvRecord)>, StorageError> {
        self.check_online()?;
        let kv = self.kv.read();
        Ok(kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn append(&self, stream: &str, record: &LogRecord) -> Result<(), StorageError> {
        self.check_online()?;
        let mut logs = self.logs.write();
        let entries = logs.entry(stream.to_string()).or_default();
        if entries.iter().any(|r| r.seq == record.seq) {
            return Err(StorageError::backend(
                &self.name,
                format!("duplicate seq {} in stream '{}'", record.seq, stream),
            ));
        }
        // Keep the stream sorted even if a lower seq arrives late.
        let pos = entries.partition_point(|r| r.seq < record.seq);
        entries.insert(pos, record.clone());
        Ok(())
    }

    async fn tail(&self, stream: &str, n: usize) -> Result<Vec<LogRecord>, StorageError> {
        self.check_online()?;
        let logs = self.logs.read();
        Ok(logs
            .get(stream)
            .map(|entries| {
                let start = entries.len().saturating_sub(n);
                entries[start..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn max_seq(&self, stream: &str) -> Result<Option<u64>, StorageError> {
        self.check_online()?;
        Ok(self
            .logs
            .read()
            .get(stream)
            .and_then(|entries| entries.last().map(|r| r.seq)))
    }
}
