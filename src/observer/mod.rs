//! Periodic state push to observers.
//!
//! [`ObserverHub`] builds a [`Snapshot`] on a fixed interval and broadcasts
//! it. Delivery is best-effort: no subscriber is fine, and a receiver that
//! falls behind skips the snapshots it missed. Building a snapshot never
//! blocks writers for longer than a read lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::blackboard::{Blackboard, BlackboardEntry};
use crate::budget::{BudgetLedger, BudgetRecord, GlobalBudget};
use crate::trust::{AuditEntry, TrustEngine};

const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub blackboard: BTreeMap<String, BlackboardEntry>,
    pub budgets: Vec<BudgetRecord>,
    pub global: GlobalBudget,
    pub recent_audit: Vec<AuditEntry>,
}

/// Where snapshots are read from.
#[derive(Debug, Clone)]
pub struct SnapshotSources {
    pub blackboard: Arc<Blackboard>,
    pub ledger: Arc<BudgetLedger>,
    pub trust: Arc<TrustEngine>,
    pub audit_entries: usize,
}

impl SnapshotSources {
    pub async fn snapshot(&self) -> Snapshot {
        // Audit is read from storage; an outage degrades to an empty list.
        let recent_audit = match self.trust.tail(self.audit_entries).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Audit tail unavailable for snapshot");
                Vec::new()
            }
        };
        Snapshot {
            taken_at: Utc::now(),
            blackboard: self.blackboard.list(),
            budgets: self.ledger.all(),
            global: self.ledger.get_global(),
            recent_audit,
        }
    }
}

#[derive(Debug)]
pub struct ObserverHub {
    sender: broadcast::Sender<Arc<Snapshot>>,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ObserverHub {
    /// Start pushing a snapshot every `interval`.
    pub fn spawn(sources: SnapshotSources, interval: Duration) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let tx = sender.clone();
        let stop = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                if tx.receiver_count() == 0 {
                    continue;
                }
                let snapshot = Arc::new(sources.snapshot().await);
                // Err only means every receiver went away meanwhile.
                if let Ok(receivers) = tx.send(snapshot) {
                    debug!(receivers, "Snapshot pushed");
                }
            }
        });

        Self {
            sender,
            shutdown,
            handle,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Stop after the current tick.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for ObserverHub {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Pricing;
    use crate::persistence::FallbackStore;
    use crate::trust::ProfileSet;
    use crate::types::{AgentRole, ResourceType, TaskId};
    use serde_json::json;

    fn sources() -> SnapshotSources {
        let store = Arc::new(FallbackStore::in_memory());
        SnapshotSources {
            blackboard: Arc::new(Blackboard::new(store.clone())),
            ledger: Arc::new(BudgetLedger::new(store.clone(), Pricing::default())),
            trust: Arc::new(TrustEngine::new(ProfileSet::default(), store).unwrap()),
            audit_entries: 5,
        }
    }

    #[tokio::test]
    async fn test_snapshot_collects_all_state() {
        let src = sources();
        src.blackboard
            .put("t/research", json!("facts"), AgentRole::Research)
            .await
            .unwrap();
        src.ledger
            .record_usage(&TaskId::from("t"), 50, 100)
            .await
            .unwrap();
        src.trust
            .authorize(AgentRole::Code, ResourceType::Database, 0.5)
            .await
            .unwrap();

        let snap = src.snapshot().await;
        assert_eq!(snap.blackboard.len(), 1);
        assert_eq!(snap.budgets.len(), 1);
        assert_eq!(snap.global.tokens_used, 50);
        assert_eq!(snap.recent_audit.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_periodic_snapshots() {
        let src = sources();
        let hub = ObserverHub::spawn(src.clone(), Duration::from_millis(10));
        let mut rx = hub.subscribe();

        let first = rx.recv().await.unwrap();
        src.ledger
            .record_usage(&TaskId::from("t"), 7, 100)
            .await
            .unwrap();

        // Later snapshots pick up the new usage.
        let mut seen = first.global.tokens_used;
        for _ in 0..20 {
            seen = rx.recv().await.unwrap().global.tokens_used;
            if seen == 7 {
                break;
            }
        }
        assert_eq!(seen, 7);
    }

    #[tokio::test]
    async fn test_no_subscribers_is_not_an_error() {
        let hub = ObserverHub::spawn(sources(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hub.subscriber_count(), 0);
        hub.shutdown();
    }
}
