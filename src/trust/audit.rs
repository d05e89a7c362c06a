//! Append-only, hash-chained audit log.
//!
//! Each entry stores the hash of its predecessor and a SHA-256 over that
//! hash plus its own digest line, so any edit or removal in the middle of
//! the stream breaks [`AuditLog::verify_chain`].
//!
//! The head is only trusted once both storage backends have been read. An
//! entry appended while one backend was unreadable is marked `detached`:
//! its predecessor may not be the true last entry, so verification accepts
//! it as a fork when it links to genesis or any earlier entry, and reports
//! where the fork starts.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::profiles::ProfileUpdate;
use crate::persistence::{FallbackStore, LogRecord, StorageError};
use crate::types::{AgentRole, ResourceType, TaskId};

/// Log stream holding every audit entry.
pub const AUDIT_STREAM: &str = "audit";

/// Predecessor hash of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One authorization decision. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub agent_id: AgentRole,
    pub resource_type: ResourceType,
    /// Clamped into `[0, 1]`.
    pub justification_score: f64,
    pub weighted_score: f64,
    pub granted: bool,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    /// Profile version the decision was evaluated against.
    pub profile_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// A trust or risk change applied by an administrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyUpdateRecord {
    pub from_version: u64,
    pub to_version: u64,
    pub update: ProfileUpdate,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Permission(PermissionRequest),
    PolicyUpdate(PolicyUpdateRecord),
}

impl AuditEvent {
    /// Stable textual form fed into the chain hash. Floats are fixed to six
    /// decimals so a storage round trip cannot change the digest.
    fn digest_line(&self) -> String {
        match self {
            AuditEvent::Permission(p) => format!(
                "permission|{}|{}|{:.6}|{:.6}|{}|{}|{}|{}|{}",
                p.agent_id,
                p.resource_type,
                p.justification_score,
                p.weighted_score,
                p.granted,
                p.timestamp.timestamp_micros(),
                p.profile_version,
                p.task_id.as_ref().map(TaskId::as_str).unwrap_or("-"),
                p.reason,
            ),
            AuditEvent::PolicyUpdate(u) => {
                let trust: Vec<String> = u
                    .update
                    .trust
                    .iter()
                    .map(|(k, v)| format!("{k}={v:.6}"))
                    .collect();
                let risk: Vec<String> = u
                    .update
                    .risk
                    .iter()
                    .map(|(k, v)| format!("{k}={v:.6}"))
                    .collect();
                format!(
                    "policy_update|{}|{}|{}|{}|{}|{}",
                    u.from_version,
                    u.to_version,
                    u.timestamp.timestamp_micros(),
                    u.update.actor.as_deref().unwrap_or("-"),
                    trust.join(","),
                    risk.join(","),
                )
            }
        }
    }

    pub fn as_permission(&self) -> Option<&PermissionRequest> {
        match self {
            AuditEvent::Permission(p) => Some(p),
            AuditEvent::PolicyUpdate(_) => None,
        }
    }
}

/// Shape of an audit entry inside the log stream.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    event: AuditEvent,
    prev_hash: String,
    hash: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    detached: bool,
}

/// An audit entry as read back, with its position in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: AuditEvent,
    pub prev_hash: String,
    pub hash: String,
    /// Appended without a confirmed view of the chain head.
    #[serde(default)]
    pub detached: bool,
}

impl AuditEntry {
    fn from_record(record: LogRecord) -> Result<Self, serde_json::Error> {
        let stored: StoredEntry = serde_json::from_value(record.payload)?;
        Ok(Self {
            seq: record.seq,
            recorded_at: record.recorded_at,
            event: stored.event,
            prev_hash: stored.prev_hash,
            hash: stored.hash,
            detached: stored.detached,
        })
    }
}

/// Result of [`AuditLog::verify_chain`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainReport {
    pub entries: usize,
    pub valid: bool,
    /// First entry whose link or hash does not match.
    pub first_broken_seq: Option<u64>,
    /// Detached entries that start a branch off an earlier entry.
    pub forks: Vec<u64>,
}

fn chain_hash(prev_hash: &str, event: &AuditEvent, detached: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(b"\n");
    hasher.update(event.digest_line().as_bytes());
    if detached {
        hasher.update(b"\ndetached");
    }
    hex::encode(hasher.finalize())
}

/// Last appended hash and whether it was read with both backends answering.
#[derive(Debug)]
struct Head {
    hash: String,
    confirmed: bool,
}

/// Audit trail over the `audit` stream of a [`FallbackStore`].
#[derive(Debug)]
pub struct AuditLog {
    store: Arc<FallbackStore>,
    /// `None` until seeded from storage. Holding this lock serializes
    /// appends.
    head: tokio::sync::Mutex<Option<Head>>,
}

impl AuditLog {
    pub fn new(store: Arc<FallbackStore>) -> Self {
        Self {
            store,
            head: tokio::sync::Mutex::new(None),
        }
    }

    /// Append `event`. Returns only after the entry is durable.
    pub async fn append(&self, event: AuditEvent) -> Result<AuditEntry, StorageError> {
        let mut head = self.head.lock().await;
        let (prev_hash, confirmed) = match head.as_ref() {
            Some(h) if h.confirmed => (h.hash.clone(), true),
            _ => self.seed_head().await?,
        };
        let detached = !confirmed;
        if detached {
            warn!("Audit head unconfirmed, appending detached entry");
        }
        let hash = chain_hash(&prev_hash, &event, detached);

        let stored = StoredEntry {
            event,
            prev_hash,
            hash,
            detached,
        };
        let record = self
            .store
            .append(AUDIT_STREAM, serde_json::to_value(&stored)?)
            .await?;
        *head = Some(Head {
            hash: stored.hash.clone(),
            confirmed,
        });

        Ok(AuditEntry {
            seq: record.seq,
            recorded_at: record.recorded_at,
            event: stored.event,
            prev_hash: stored.prev_hash,
            hash: stored.hash,
            detached: stored.detached,
        })
    }

    /// The last `n` entries, oldest first.
    pub async fn tail(&self, n: usize) -> Result<Vec<AuditEntry>, StorageError> {
        let records = self.store.tail(AUDIT_STREAM, n).await?;
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let seq = record.seq;
            match AuditEntry::from_record(record) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(seq, error = %e, "Skipping unreadable audit entry"),
            }
        }
        Ok(entries)
    }

    /// Recompute every link of the stored chain.
    pub async fn verify_chain(&self) -> Result<ChainReport, StorageError> {
        let records = self.store.tail(AUDIT_STREAM, usize::MAX).await?;
        let entries = records.len();
        let mut expected_prev = GENESIS_HASH.to_string();
        let mut seen: HashSet<String> = HashSet::from([GENESIS_HASH.to_string()]);
        let mut forks = Vec::new();

        for record in records {
            let seq = record.seq;
            let linked = match AuditEntry::from_record(record) {
                Ok(entry) if chain_hash(&entry.prev_hash, &entry.event, entry.detached) == entry.hash => {
                    let linked = if entry.prev_hash == expected_prev {
                        true
                    } else if entry.detached && seen.contains(&entry.prev_hash) {
                        warn!(seq, "Audit chain forks at detached entry");
                        forks.push(seq);
                        true
                    } else {
                        false
                    };
                    seen.insert(entry.hash.clone());
                    expected_prev = entry.hash;
                    linked
                }
                _ => false,
            };
            if !linked {
                warn!(seq, "Audit chain broken");
                return Ok(ChainReport {
                    entries,
                    valid: false,
                    first_broken_seq: Some(seq),
                    forks,
                });
            }
        }

        Ok(ChainReport {
            entries,
            valid: true,
            first_broken_seq: None,
            forks,
        })
    }

    async fn seed_head(&self) -> Result<(String, bool), StorageError> {
        let last = self.store.tail_with_coverage(AUDIT_STREAM, 1).await?;
        let hash = match last.records.into_iter().next() {
            Some(record) => AuditEntry::from_record(record)?.hash,
            None => GENESIS_HASH.to_string(),
        };
        Ok((hash, last.complete))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryBackend, StorageBackend, StoreOptions};
    use std::time::Duration;

    fn decision(agent: AgentRole, granted: bool) -> AuditEvent {
        AuditEvent::Permission(PermissionRequest {
            agent_id: agent,
            resource_type: ResourceType::Email,
            justification_score: 0.45,
            weighted_score: 0.61,
            granted,
            timestamp: Utc::now(),
            reason: "test".into(),
            profile_version: 1,
            task_id: None,
        })
    }

    fn store() -> (Arc<MemoryBackend>, Arc<FallbackStore>) {
        let primary = Arc::new(MemoryBackend::new("primary"));
        let store = Arc::new(FallbackStore::new(
            primary.clone(),
            Arc::new(MemoryBackend::new("fallback")),
            StoreOptions {
                op_timeout: Duration::from_millis(200),
                reprobe_interval: Duration::ZERO,
            },
        ));
        (primary, store)
    }

    #[tokio::test]
    async fn test_tail_returns_last_n_in_order() {
        let (_, store) = store();
        let log = AuditLog::new(store);
        for role in AgentRole::ALL {
            log.append(decision(role, true)).await.unwrap();
        }

        let tail = log.tail(3).await.unwrap();
        let agents: Vec<AgentRole> = tail
            .iter()
            .filter_map(|e| e.event.as_permission().map(|p| p.agent_id))
            .collect();
        assert_eq!(agents, AgentRole::ALL[6..].to_vec());
        assert!(tail.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn test_chain_links_and_verifies() {
        let (_, store) = store();
        let log = AuditLog::new(store);
        let first = log.append(decision(AgentRole::Code, true)).await.unwrap();
        let second = log.append(decision(AgentRole::Data, false)).await.unwrap();

        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.hash);
        let report = log.verify_chain().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.entries, 2);
    }

    #[tokio::test]
    async fn test_new_log_continues_existing_chain() {
        let (_, store) = store();
        let first = AuditLog::new(store.clone())
            .append(decision(AgentRole::Code, true))
            .await
            .unwrap();

        let reopened = AuditLog::new(store);
        let second = reopened.append(decision(AgentRole::Review, true)).await.unwrap();
        assert_eq!(second.prev_hash, first.hash);
        assert!(reopened.verify_chain().await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_tampering_is_detected() {
        let (primary, store) = store();
        let log = AuditLog::new(store.clone());
        log.append(decision(AgentRole::Code, false)).await.unwrap();

        // Flip the decision behind the log's back, re-using the old hashes.
        let mut record = primary.tail(AUDIT_STREAM, 1).await.unwrap().remove(0);
        record.payload["event"]["granted"] = serde_json::json!(true);
        let tampered = MemoryBackend::new("tampered");
        tampered.append(AUDIT_STREAM, &record).await.unwrap();
        let tampered_store = Arc::new(FallbackStore::new(
            Arc::new(tampered),
            Arc::new(MemoryBackend::new("empty")),
            StoreOptions::default(),
        ));

        let report = AuditLog::new(tampered_store).verify_chain().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.first_broken_seq, Some(record.seq));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_form_one_chain() {
        let (_, store) = store();
        let log = Arc::new(AuditLog::new(store));
        let mut handles = Vec::new();
        for i in 0..40 {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                log.append(decision(AgentRole::ALL[i % 9], i % 2 == 0))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let report = log.verify_chain().await.unwrap();
        assert_eq!(report.entries, 40);
        assert!(report.valid);
    }

    #[tokio::test]
    async fn test_degraded_restart_forks_instead_of_hiding_entries() {
        let primary = Arc::new(MemoryBackend::new("primary"));
        let fallback = Arc::new(MemoryBackend::new("fallback"));
        let options = StoreOptions {
            op_timeout: Duration::from_millis(200),
            reprobe_interval: Duration::ZERO,
        };
        let healthy = Arc::new(FallbackStore::new(primary.clone(), fallback.clone(), options.clone()));
        let log = AuditLog::new(healthy);
        for _ in 0..3 {
            log.append(decision(AgentRole::Code, true)).await.unwrap();
        }
        drop(log);

        primary.set_online(false);
        let restarted = Arc::new(FallbackStore::connect(primary.clone(), fallback, options).await);
        let log = AuditLog::new(restarted);
        let outage = log.append(decision(AgentRole::Billing, false)).await.unwrap();
        assert!(outage.detached);
        assert_eq!(outage.prev_hash, GENESIS_HASH);

        primary.set_online(true);
        let after = log.append(decision(AgentRole::Review, true)).await.unwrap();
        assert!(!after.detached);
        assert_eq!(after.prev_hash, outage.hash);

        let agents: Vec<AgentRole> = log
            .tail(10)
            .await
            .unwrap()
            .iter()
            .filter_map(|e| e.event.as_permission().map(|p| p.agent_id))
            .collect();
        assert_eq!(
            agents,
            vec![
                AgentRole::Code,
                AgentRole::Code,
                AgentRole::Code,
                AgentRole::Billing,
                AgentRole::Review
            ]
        );

        let report = log.verify_chain().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.entries, 5);
        assert_eq!(report.forks, vec![outage.seq]);
    }

    #[tokio::test]
    async fn test_clearing_detached_flag_breaks_chain() {
        let (primary, store) = store();
        primary.set_online(false);
        let log = AuditLog::new(store.clone());
        let entry = log.append(decision(AgentRole::Data, true)).await.unwrap();
        assert!(entry.detached);

        let mut record = store.tail(AUDIT_STREAM, 1).await.unwrap().remove(0);
        record.payload["detached"] = serde_json::json!(false);
        let rewritten = MemoryBackend::new("rewritten");
        rewritten.append(AUDIT_STREAM, &record).await.unwrap();
        let rewritten_store = Arc::new(FallbackStore::new(
            Arc::new(rewritten),
            Arc::new(MemoryBackend::new("empty")),
            StoreOptions::default(),
        ));

        let report = AuditLog::new(rewritten_store).verify_chain().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.first_broken_seq, Some(record.seq));
    }
}
