//! Blackboard: the concurrent, write-through store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::entry::BlackboardEntry;
use crate::persistence::{FallbackStore, Resync, StorageError};
use crate::types::{AgentRole, KeyLocks};

/// Storage key prefix for blackboard entries.
const KEY_PREFIX: &str = "bb/";

#[derive(Debug, Error)]
pub enum BlackboardError {
    #[error("invalid blackboard key: {0:?}")]
    InvalidKey(String),

    /// The write was not confirmed; the in-memory view is unchanged.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The shared blackboard.
///
/// # Example
///
/// ```no_run
/// # async fn demo() -> Result<(), agentgate::blackboard::BlackboardError> {
/// use std::sync::Arc;
/// use agentgate::blackboard::Blackboard;
/// use agentgate::persistence::FallbackStore;
/// use agentgate::types::AgentRole;
///
/// let bb = Blackboard::new(Arc::new(FallbackStore::in_memory()));
/// bb.put("t-1/research", serde_json::json!({"text": "findings"}), AgentRole::Research).await?;
/// assert!(bb.get("t-1/research").is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Blackboard {
    store: Arc<FallbackStore>,
    entries: RwLock<HashMap<String, BlackboardEntry>>,
    /// Per-key commit locks; a put holds its key's lock across persist+publish.
    key_locks: KeyLocks<String>,
}

impl Blackboard {
    /// An empty blackboard writing through to `store`.
    pub fn new(store: Arc<FallbackStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
            key_locks: KeyLocks::new(),
        }
    }

    /// Rebuild the blackboard from everything previously persisted.
    pub async fn load(store: Arc<FallbackStore>) -> Result<Self, BlackboardError> {
        let entries = read_stored(&store).await?;
        debug!(entries = entries.len(), "Blackboard restored from storage");

        Ok(Self {
            store,
            entries: RwLock::new(entries),
            key_locks: KeyLocks::new(),
        })
    }

    // --- Write operations ---

    /// Store or overwrite `key`. Durable before this returns.
    pub async fn put(
        &self,
        key: &str,
        value: Value,
        writer: AgentRole,
    ) -> Result<BlackboardEntry, BlackboardError> {
        if key.trim().is_empty() {
            return Err(BlackboardError::InvalidKey(key.to_string()));
        }

        let _guard = self.key_locks.lock(&key.to_string()).await;

        let entry = BlackboardEntry::new(key, value, writer);
        self.store
            .put(
                &storage_key(key),
                serde_json::to_value(&entry).map_err(StorageError::from)?,
            )
            .await?;

        self.entries.write().insert(key.to_string(), entry.clone());
        debug!(key, writer = %writer, "Blackboard entry committed");
        Ok(entry)
    }

    /// Adopt persisted entries that are missing here or newer than the
    /// in-memory copy. Catches up with what `load` could not see while a
    /// storage backend was unreachable.
    pub async fn reconcile(&self) -> Result<usize, StorageError> {
        let stored = read_stored(&self.store).await?;
        let mut entries = self.entries.write();
        let mut adopted = 0;
        for (key, entry) in stored {
            let stale = entries
                .get(&key)
                .map_or(true, |current| current.timestamp < entry.timestamp);
            if stale {
                entries.insert(key, entry);
                adopted += 1;
            }
        }
        Ok(adopted)
    }

    // --- Read operations ---

    /// The latest committed entry for `key`.
    pub fn get(&self, key: &str) -> Option<BlackboardEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Convenience accessor for just the value.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// A point-in-time copy of every entry, ordered by key.
    pub fn list(&self) -> BTreeMap<String, BlackboardEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// A point-in-time copy of the entries whose key starts with `prefix`.
    pub fn list_prefix(&self, prefix: &str) -> BTreeMap<String, BlackboardEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl Resync for Blackboard {
    fn label(&self) -> &str {
        "blackboard"
    }

    async fn resync(&self) -> Result<usize, StorageError> {
        self.reconcile().await
    }
}

fn storage_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

async fn read_stored(store: &FallbackStore) -> Result<HashMap<String, BlackboardEntry>, StorageError> {
    let rows = store.scan(KEY_PREFIX).await?;
    let mut entries = HashMap::with_capacity(rows.len());
    for (storage_key, value) in rows {
        match serde_json::from_value::<BlackboardEntry>(value) {
            Ok(entry) => {
                entries.insert(entry.key.clone(), entry);
            }
            Err(e) => warn!(key = %storage_key, error = %e, "Skipping unreadable blackboard entry"),
        }
    }
    Ok(entries)
}
