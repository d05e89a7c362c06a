//! Token budget accounting.
//!
//! The [`BudgetLedger`] keeps one [`BudgetRecord`] per task and derives the
//! [`GlobalBudget`] on demand. Increments for one task are serialized behind
//! that task's lock; increments for different tasks never contend.
//!
//! The ledger never refuses usage. Once a task is exhausted, further usage is
//! still added so over-runs stay visible; refusing new provider calls is the
//! coordinator's job.

pub mod status;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::persistence::{FallbackStore, Resync, StorageError};
use crate::types::{KeyLocks, TaskId};

pub use status::BudgetStatus;

/// Storage key prefix for per-task records.
const KEY_PREFIX: &str = "budget/";

/// Log stream receiving one event per increment.
pub const USAGE_STREAM: &str = "usage";

/// Cost model used for the estimate carried on every record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default = "default_cost_per_1k")]
    pub cost_per_1k_tokens: f64,
}

fn default_cost_per_1k() -> f64 {
    0.002
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            cost_per_1k_tokens: default_cost_per_1k(),
        }
    }
}

impl Pricing {
    pub fn estimate(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.cost_per_1k_tokens
    }
}

/// Token accounting for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetRecord {
    pub task_id: TaskId,
    /// Running total; never decreases.
    pub tokens_used: u64,
    pub token_limit: u64,
    /// `tokens_used / token_limit`, not clamped.
    pub percentage: f64,
    pub status: BudgetStatus,
    pub estimated_cost_usd: f64,
    pub updated_at: DateTime<Utc>,
}

impl BudgetRecord {
    fn new(task_id: TaskId, token_limit: u64) -> Self {
        Self {
            task_id,
            tokens_used: 0,
            token_limit,
            percentage: status::percentage(0, token_limit),
            status: BudgetStatus::classify(0, token_limit),
            estimated_cost_usd: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// The record after adding `tokens` under `token_limit`.
    fn advanced(&self, tokens: u64, token_limit: u64, pricing: &Pricing) -> Self {
        let tokens_used = self.tokens_used.saturating_add(tokens);
        Self {
            task_id: self.task_id.clone(),
            tokens_used,
            token_limit,
            percentage: status::percentage(tokens_used, token_limit),
            status: BudgetStatus::classify(tokens_used, token_limit),
            estimated_cost_usd: pricing.estimate(tokens_used),
            updated_at: Utc::now(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.status == BudgetStatus::Exhausted
    }

    pub fn remaining(&self) -> u64 {
        self.token_limit.saturating_sub(self.tokens_used)
    }
}

/// Aggregate over every task the ledger knows about. Read-only projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalBudget {
    pub tokens_used: u64,
    pub token_limit: u64,
    pub percentage: f64,
    pub status: BudgetStatus,
    pub task_count: usize,
    pub estimated_cost_usd: f64,
}

/// One increment, as written to the usage log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub task_id: TaskId,
    pub tokens: u64,
    pub total_after: u64,
    pub provider: Option<String>,
    pub status_after: BudgetStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Per-task and global token ledger.
#[derive(Debug)]
pub struct BudgetLedger {
    store: Arc<FallbackStore>,
    pricing: Pricing,
    /// Last committed record per task.
    records: DashMap<TaskId, BudgetRecord>,
    /// Per-task update locks.
    locks: KeyLocks<TaskId>,
}

impl BudgetLedger {
    pub fn new(store: Arc<FallbackStore>, pricing: Pricing) -> Self {
        Self {
            store,
            pricing,
            records: DashMap::new(),
            locks: KeyLocks::new(),
        }
    }

    /// Restore every persisted record.
    pub async fn load(store: Arc<FallbackStore>, pricing: Pricing) -> Result<Self, StorageError> {
        let ledger = Self::new(Arc::clone(&store), pricing);
        for record in read_stored(&store).await? {
            ledger.records.insert(record.task_id.clone(), record);
        }
        debug!(tasks = ledger.records.len(), "Budget ledger restored from storage");
        Ok(ledger)
    }

    /// Register a task with zero usage so it shows up in the global view
    /// before its first provider call. Existing records are left alone.
    pub async fn open_task(&self, task_id: &TaskId, token_limit: u64) -> Result<BudgetRecord, StorageError> {
        let _guard = self.locks.lock(task_id).await;

        if let Some(existing) = self.get(task_id) {
            return Ok(existing);
        }
        let record = BudgetRecord::new(task_id.clone(), token_limit);
        self.store
            .put(&storage_key(task_id), serde_json::to_value(&record)?)
            .await?;
        self.records.insert(task_id.clone(), record.clone());
        Ok(record)
    }

    /// Add `tokens` to the task's total, creating the record if needed.
    ///
    /// `token_limit` is the limit declared by the caller; the most recently
    /// declared limit wins. The record only advances once the update has
    /// been persisted.
    pub async fn record_usage(
        &self,
        task_id: &TaskId,
        tokens: u64,
        token_limit: u64,
    ) -> Result<BudgetRecord, StorageError> {
        self.record_usage_from(task_id, tokens, token_limit, None).await
    }

    /// [`record_usage`](Self::record_usage) tagged with the provider that
    /// consumed the tokens.
    pub async fn record_usage_from(
        &self,
        task_id: &TaskId,
        tokens: u64,
        token_limit: u64,
        provider: Option<&str>,
    ) -> Result<BudgetRecord, StorageError> {
        let _guard = self.locks.lock(task_id).await;

        let current = self
            .get(task_id)
            .unwrap_or_else(|| BudgetRecord::new(task_id.clone(), token_limit));
        let next = current.advanced(tokens, token_limit, &self.pricing);

        self.store
            .put(&storage_key(task_id), serde_json::to_value(&next)?)
            .await?;
        self.records.insert(task_id.clone(), next.clone());

        if next.status != current.status {
            match next.status {
                BudgetStatus::Exhausted => warn!(
                    task_id = %task_id,
                    tokens_used = next.tokens_used,
                    token_limit = next.token_limit,
                    "Task budget exhausted"
                ),
                status => info!(
                    task_id = %task_id,
                    status = %status,
                    percentage = next.percentage,
                    "Task budget status changed"
                ),
            }
        }

        // The record above is authoritative; the event log is a trail.
        let event = UsageEvent {
            task_id: task_id.clone(),
            tokens,
            total_after: next.tokens_used,
            provider: provider.map(str::to_string),
            status_after: next.status,
            recorded_at: next.updated_at,
        };
        if let Err(e) = self
            .store
            .append(USAGE_STREAM, serde_json::to_value(&event)?)
            .await
        {
            warn!(task_id = %task_id, error = %e, "Usage event not logged");
        }

        Ok(next)
    }

    /// The last committed record for `task_id`.
    pub fn get(&self, task_id: &TaskId) -> Option<BudgetRecord> {
        self.records.get(task_id).map(|r| r.value().clone())
    }

    pub fn is_exhausted(&self, task_id: &TaskId) -> bool {
        self.get(task_id).map_or(false, |r| r.is_exhausted())
    }

    /// Every committed record, ordered by task id.
    pub fn all(&self) -> Vec<BudgetRecord> {
        let mut records: Vec<BudgetRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        records
    }

    /// Aggregate over all known tasks, computed now.
    pub fn get_global(&self) -> GlobalBudget {
        let mut tokens_used: u64 = 0;
        let mut token_limit: u64 = 0;
        let mut task_count = 0;
        for record in self.records.iter() {
            tokens_used = tokens_used.saturating_add(record.tokens_used);
            token_limit = token_limit.saturating_add(record.token_limit);
            task_count += 1;
        }

        // An empty ledger has nothing to exhaust.
        let (percentage, status) = if task_count == 0 {
            (0.0, BudgetStatus::Active)
        } else {
            (
                status::percentage(tokens_used, token_limit),
                BudgetStatus::classify(tokens_used, token_limit),
            )
        };

        GlobalBudget {
            tokens_used,
            token_limit,
            percentage,
            status,
            task_count,
            estimated_cost_usd: self.pricing.estimate(tokens_used),
        }
    }

    /// Adopt persisted records that are missing here or were updated more
    /// recently than the in-memory copy.
    pub async fn reconcile(&self) -> Result<usize, StorageError> {
        let mut adopted = 0;
        for record in read_stored(&self.store).await? {
            let _guard = self.locks.lock(&record.task_id).await;
            let stale = self
                .get(&record.task_id)
                .map_or(true, |current| current.updated_at < record.updated_at);
            if stale {
                self.records.insert(record.task_id.clone(), record);
                adopted += 1;
            }
        }
        Ok(adopted)
    }
}

#[async_trait]
impl Resync for BudgetLedger {
    fn label(&self) -> &str {
        "budget"
    }

    async fn resync(&self) -> Result<usize, StorageError> {
        self.reconcile().await
    }
}

fn storage_key(task_id: &TaskId) -> String {
    format!("{KEY_PREFIX}{task_id}")
}

async fn read_stored(store: &FallbackStore) -> Result<Vec<BudgetRecord>, StorageError> {
    let mut records = Vec::new();
    for (key, value) in store.scan(KEY_PREFIX).await? {
        match serde_json::from_value::<BudgetRecord>(value) {
            Ok(record) => records.push(record),
            Err(e) => warn!(key = %key, error = %e, "Skipping unreadable budget record"),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryBackend, StoreOptions};
    use std::time::Duration;

    fn ledger() -> (Arc<MemoryBackend>, Arc<MemoryBackend>, Arc<FallbackStore>, BudgetLedger) {
        let primary = Arc::new(MemoryBackend::new("primary"));
        let fallback = Arc::new(MemoryBackend::new("fallback"));
        let store = Arc::new(FallbackStore::new(
            primary.clone(),
            fallback.clone(),
            StoreOptions {
                op_timeout: Duration::from_millis(200),
                reprobe_interval: Duration::ZERO,
            },
        ));
        let ledger = BudgetLedger::new(store.clone(), Pricing::default());
        (primary, fallback, store, ledger)
    }

    #[tokio::test]
    async fn test_status_follows_thresholds() {
        let (_, _, _, ledger) = ledger();
        let task = TaskId::from("t1");

        let r = ledger.record_usage(&task, 79, 100).await.unwrap();
        assert_eq!(r.status, BudgetStatus::Active);
        let r = ledger.record_usage(&task, 1, 100).await.unwrap();
        assert_eq!(r.status, BudgetStatus::Warning);
        let r = ledger.record_usage(&task, 10, 100).await.unwrap();
        assert_eq!(r.status, BudgetStatus::Critical);
        let r = ledger.record_usage(&task, 10, 100).await.unwrap();
        assert_eq!(r.status, BudgetStatus::Exhausted);
        assert!(ledger.is_exhausted(&task));
    }

    #[tokio::test]
    async fn test_overrun_is_tracked_not_clamped() {
        let (_, _, _, ledger) = ledger();
        let task = TaskId::from("t1");
        ledger.record_usage(&task, 100, 100).await.unwrap();
        let r = ledger.record_usage(&task, 5, 100).await.unwrap();

        assert_eq!(r.tokens_used, 105);
        assert!((r.percentage - 1.05).abs() < 1e-9);
        assert_eq!(r.status, BudgetStatus::Exhausted);
        assert_eq!(r.remaining(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_increments_are_not_lost() {
        let (_, _, _, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let task = TaskId::from("hot");
        let n = 200u64;
        let t = 7u64;

        let mut handles = Vec::new();
        for _ in 0..n {
            let ledger = Arc::clone(&ledger);
            let task = task.clone();
            handles.push(tokio::spawn(async move {
                ledger.record_usage(&task, t, 1_000_000).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(ledger.get(&task).unwrap().tokens_used, n * t);
        assert!(ledger.locks.is_empty());
    }

    #[tokio::test]
    async fn test_global_aggregates_all_tasks() {
        let (_, _, _, ledger) = ledger();
        ledger.record_usage(&TaskId::from("a"), 300, 1000).await.unwrap();
        ledger.record_usage(&TaskId::from("b"), 500, 1000).await.unwrap();
        ledger.open_task(&TaskId::from("c"), 2000).await.unwrap();

        let global = ledger.get_global();
        assert_eq!(global.tokens_used, 800);
        assert_eq!(global.token_limit, 4000);
        assert_eq!(global.task_count, 3);
        assert_eq!(global.status, BudgetStatus::Active);
        assert!((global.percentage - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_empty_global_is_active() {
        let (_, _, _, ledger) = ledger();
        let global = ledger.get_global();
        assert_eq!(global.task_count, 0);
        assert_eq!(global.status, BudgetStatus::Active);
        assert_eq!(global.percentage, 0.0);
    }

    #[tokio::test]
    async fn test_latest_declared_limit_wins() {
        let (_, _, _, ledger) = ledger();
        let task = TaskId::from("t");
        ledger.record_usage(&task, 50, 100).await.unwrap();
        let r = ledger.record_usage(&task, 0, 1000).await.unwrap();
        assert_eq!(r.token_limit, 1000);
        assert_eq!(r.status, BudgetStatus::Active);
    }

    #[tokio::test]
    async fn test_unconfirmed_write_does_not_advance() {
        let (primary, fallback, _, ledger) = ledger();
        let task = TaskId::from("t");
        ledger.record_usage(&task, 10, 100).await.unwrap();

        primary.set_online(false);
        fallback.set_online(false);
        let err = ledger.record_usage(&task, 10, 100).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable { .. }));
        assert_eq!(ledger.get(&task).unwrap().tokens_used, 10);
    }

    #[tokio::test]
    async fn test_load_restores_records_and_logs_events() {
        let (_, _, store, ledger) = ledger();
        let task = TaskId::from("persisted");
        ledger
            .record_usage_from(&task, 42, 100, Some("scripted"))
            .await
            .unwrap();

        let restored = BudgetLedger::load(store.clone(), Pricing::default())
            .await
            .unwrap();
        assert_eq!(restored.get(&task).unwrap().tokens_used, 42);

        let events = store.tail(USAGE_STREAM, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["provider"], "scripted");
        assert_eq!(events[0].payload["total_after"], 42);
    }

    #[tokio::test]
    async fn test_usage_survives_primary_outage() {
        let (primary, _, store, ledger) = ledger();
        let task = TaskId::from("t");
        ledger.record_usage(&task, 10, 100).await.unwrap();
        primary.set_online(false);
        ledger.record_usage(&task, 15, 100).await.unwrap();
        primary.set_online(true);

        let restored = BudgetLedger::load(store, Pricing::default()).await.unwrap();
        assert_eq!(restored.get(&task).unwrap().tokens_used, 25);
    }

    #[test]
    fn test_cost_estimate() {
        let pricing = Pricing {
            cost_per_1k_tokens: 0.01,
        };
        assert!((pricing.estimate(2500) - 0.025).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_reconcile_adopts_records_missed_at_startup() {
        let (primary, fallback, store, ledger) = ledger();
        ledger.record_usage(&TaskId::from("old"), 300, 1000).await.unwrap();

        primary.set_online(false);
        let restarted = Arc::new(
            FallbackStore::connect(
                primary.clone(),
                fallback,
                StoreOptions {
                    op_timeout: Duration::from_millis(200),
                    reprobe_interval: Duration::ZERO,
                },
            )
            .await,
        );
        let reloaded = BudgetLedger::load(restarted.clone(), Pricing::default())
            .await
            .unwrap();
        assert!(reloaded.get(&TaskId::from("old")).is_none());
        reloaded.record_usage(&TaskId::from("new"), 50, 1000).await.unwrap();

        primary.set_online(true);
        assert_eq!(reloaded.reconcile().await.unwrap(), 1);
        assert_eq!(reloaded.get(&TaskId::from("old")).unwrap().tokens_used, 300);
        assert_eq!(reloaded.get(&TaskId::from("new")).unwrap().tokens_used, 50);
        assert_eq!(reloaded.get_global().tokens_used, 350);
        assert_eq!(reloaded.reconcile().await.unwrap(), 0);
        drop(store);
    }
}
