//! # Agent Coordinator
//!
//! Runs a task through the specialist roster:
//!
//! 1. Infer required permissions from the message and merge them with the
//!    declared ones.
//! 2. Open the task's budget record.
//! 3. Run the plan in dependency waves. Steps inside a wave run
//!    concurrently; a step whose dependency did not succeed is skipped.
//! 4. For each step: authorize if sensitive, refuse if the budget is
//!    exhausted, call the provider, record usage, publish the output.
//!
//! A failed or denied step never aborts the task. The final status follows
//! `PENDING -> RUNNING -> (PARTIAL | COMPLETED | FAILED)`.
//!
//! Cancellation is observed between waves and before each step starts.
//! Provider calls already in flight finish and their usage is recorded.
//! Every run executes on its own tokio task, so a caller that stops waiting
//! (an HTTP client hanging up) never cuts a run short.
//!
//! The registry keeps at most `max_retained_tasks` finished tasks; the
//! oldest finished ones are evicted first. Running tasks are never evicted.

pub mod permissions;
pub mod roster;
pub mod task;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::blackboard::{Blackboard, BlackboardEntry};
use crate::budget::BudgetLedger;
use crate::persistence::StorageError;
use crate::provider::ProviderGateway;
use crate::trust::{justification_score, TrustEngine, TrustError};
use crate::types::{AgentRole, ResourceType, TaskId};

pub use permissions::{infer_permissions, PermissionRule};
pub use roster::{roster, AgentSpec, PlannedStep};
pub use task::{
    StepFailure, StepOutcome, StepResult, StepStatus, TaskRequest, TaskResult, TaskSnapshot, TaskStatus,
};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid task request: {0}")]
    InvalidRequest(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The run's tokio task panicked or was aborted.
    #[error("task execution aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Token limit for tasks that do not declare one.
    #[serde(default = "default_budget_limit")]
    pub default_budget_limit: u64,
    /// Finished tasks kept for status queries.
    #[serde(default = "default_max_retained_tasks")]
    pub max_retained_tasks: usize,
}

fn default_budget_limit() -> u64 {
    50_000
}

fn default_max_retained_tasks() -> usize {
    1_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_budget_limit: default_budget_limit(),
            max_retained_tasks: default_max_retained_tasks(),
        }
    }
}

#[derive(Debug)]
struct TaskEntry {
    cancel: Arc<AtomicBool>,
    status: watch::Sender<TaskStatus>,
    submitted_at: chrono::DateTime<Utc>,
    result: Option<TaskResult>,
    error: Option<String>,
}

impl TaskEntry {
    fn snapshot(&self, task_id: &TaskId) -> TaskSnapshot {
        TaskSnapshot {
            task_id: task_id.clone(),
            status: *self.status.borrow(),
            cancel_requested: self.cancel.load(Ordering::SeqCst),
            submitted_at: self.submitted_at,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Per-run inputs shared by every step of one task.
#[derive(Debug)]
struct TaskContext {
    task_id: TaskId,
    message: String,
    provider_hint: Option<String>,
    limit: u64,
    required: BTreeSet<ResourceType>,
    justification: f64,
    cancel: Arc<AtomicBool>,
}

impl TaskContext {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct Coordinator {
    blackboard: Arc<Blackboard>,
    ledger: Arc<BudgetLedger>,
    trust: Arc<TrustEngine>,
    gateway: Arc<ProviderGateway>,
    config: CoordinatorConfig,
    tasks: DashMap<TaskId, TaskEntry>,
}

impl Coordinator {
    pub fn new(
        blackboard: Arc<Blackboard>,
        ledger: Arc<BudgetLedger>,
        trust: Arc<TrustEngine>,
        gateway: Arc<ProviderGateway>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            blackboard,
            ledger,
            trust,
            gateway,
            config,
            tasks: DashMap::new(),
        }
    }

    pub fn blackboard(&self) -> &Arc<Blackboard> {
        &self.blackboard
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn trust(&self) -> &Arc<TrustEngine> {
        &self.trust
    }

    pub fn gateway(&self) -> &Arc<ProviderGateway> {
        &self.gateway
    }

    // --- Task lifecycle ---

    /// Run a task to completion.
    ///
    /// The run itself is detached: dropping this future stops the wait, not
    /// the task, which finishes and records its usage regardless.
    #[instrument(skip_all, fields(message_len = request.message.len()))]
    pub async fn submit(self: &Arc<Self>, request: TaskRequest) -> Result<TaskResult, CoordinatorError> {
        let (task_id, cancel) = self.register(&request)?;
        self.launch(task_id, request, cancel)
            .await
            .map_err(|e| CoordinatorError::Aborted(e.to_string()))?
    }

    /// Start a task in the background and return its id immediately.
    pub fn spawn(self: &Arc<Self>, request: TaskRequest) -> Result<TaskId, CoordinatorError> {
        let (task_id, cancel) = self.register(&request)?;
        drop(self.launch(task_id.clone(), request, cancel));
        Ok(task_id)
    }

    /// Run `execute` on its own task. A panicking run is marked FAILED so
    /// waiters are released.
    fn launch(
        self: &Arc<Self>,
        task_id: TaskId,
        request: TaskRequest,
        cancel: Arc<AtomicBool>,
    ) -> JoinHandle<Result<TaskResult, CoordinatorError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let run = tokio::spawn({
                let this = Arc::clone(&this);
                let task_id = task_id.clone();
                async move { this.execute(task_id, request, cancel).await }
            });
            match run.await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => {
                    error!(task_id = %task_id, error = %e, "Task failed");
                    Err(e)
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Task execution aborted");
                    this.finish(&task_id, None, Some(e.to_string()), TaskStatus::Failed);
                    Err(CoordinatorError::Aborted(e.to_string()))
                }
            }
        })
    }

    /// Ask a task to stop scheduling new steps. Returns its current status.
    pub fn cancel(&self, task_id: &TaskId) -> Result<TaskStatus, CoordinatorError> {
        let entry = self
            .tasks
            .get(task_id)
            .ok_or_else(|| CoordinatorError::NotFound(task_id.clone()))?;
        let status = *entry.status.borrow();
        if !status.is_terminal() {
            entry.cancel.store(true, Ordering::SeqCst);
            info!(task_id = %task_id, "Task cancellation requested");
        }
        Ok(status)
    }

    pub fn task(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        self.tasks.get(task_id).map(|e| e.snapshot(task_id))
    }

    /// Every known task, newest first.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self
            .tasks
            .iter()
            .map(|e| e.value().snapshot(e.key()))
            .collect();
        all.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        all
    }

    /// Resolve once the task reaches a terminal status.
    pub async fn wait(&self, task_id: &TaskId) -> Result<TaskSnapshot, CoordinatorError> {
        let mut rx = self
            .tasks
            .get(task_id)
            .map(|e| e.status.subscribe())
            .ok_or_else(|| CoordinatorError::NotFound(task_id.clone()))?;
        rx.wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| CoordinatorError::NotFound(task_id.clone()))?;
        self.task(task_id)
            .ok_or_else(|| CoordinatorError::NotFound(task_id.clone()))
    }

    fn register(&self, request: &TaskRequest) -> Result<(TaskId, Arc<AtomicBool>), CoordinatorError> {
        if request.message.trim().is_empty() {
            return Err(CoordinatorError::InvalidRequest("message must not be empty".into()));
        }
        if roster::plan(request.agents.as_deref()).is_empty() {
            return Err(CoordinatorError::InvalidRequest(
                "plan contains no specialist agents".into(),
            ));
        }

        let task_id = TaskId::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let (status, _) = watch::channel(TaskStatus::Pending);
        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                cancel: Arc::clone(&cancel),
                status,
                submitted_at: Utc::now(),
                result: None,
                error: None,
            },
        );
        debug!(task_id = %task_id, "Task registered");
        Ok((task_id, cancel))
    }

    fn set_status(&self, task_id: &TaskId, status: TaskStatus) {
        if let Some(entry) = self.tasks.get(task_id) {
            entry.status.send_replace(status);
        }
    }

    fn finish(&self, task_id: &TaskId, result: Option<TaskResult>, error: Option<String>, status: TaskStatus) {
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            entry.result = result;
            entry.error = error;
            entry.status.send_replace(status);
        }
        self.evict_finished();
    }

    /// Drop the oldest finished tasks beyond `max_retained_tasks`.
    fn evict_finished(&self) {
        let mut finished: Vec<(chrono::DateTime<Utc>, TaskId)> = self
            .tasks
            .iter()
            .filter(|e| e.status.borrow().is_terminal())
            .map(|e| (e.submitted_at, e.key().clone()))
            .collect();
        let excess = finished.len().saturating_sub(self.config.max_retained_tasks);
        if excess == 0 {
            return;
        }
        finished.sort();
        for (_, task_id) in finished.into_iter().take(excess) {
            self.tasks.remove(&task_id);
            debug!(task_id = %task_id, "Finished task evicted from registry");
        }
    }

    // --- Execution ---

    #[instrument(skip_all, fields(task_id = %task_id))]
    async fn execute(
        &self,
        task_id: TaskId,
        request: TaskRequest,
        cancel: Arc<AtomicBool>,
    ) -> Result<TaskResult, CoordinatorError> {
        let started_at = Utc::now();
        self.set_status(&task_id, TaskStatus::Running);

        let limit = request
            .budget_limit
            .unwrap_or(self.config.default_budget_limit);
        let inferred = infer_permissions(&request.message);
        let mut required: BTreeSet<ResourceType> =
            request.declared_permissions.iter().copied().collect();
        required.extend(inferred.iter().copied());

        if let Err(e) = self.ledger.open_task(&task_id, limit).await {
            warn!(error = %e, "Budget record could not be opened");
            self.finish(&task_id, None, Some(e.to_string()), TaskStatus::Failed);
            return Err(e.into());
        }

        let ctx = TaskContext {
            task_id: task_id.clone(),
            justification: justification_score(&request.message),
            message: request.message,
            provider_hint: request.provider_hint,
            limit,
            required,
            cancel,
        };
        info!(
            required = ?ctx.required,
            justification = ctx.justification,
            limit,
            "Task running"
        );

        let steps = roster::plan(request.agents.as_deref());
        let mut results: Vec<StepResult> = Vec::with_capacity(steps.len());

        for wave in roster::waves(&steps) {
            if ctx.cancelled() {
                results.extend(
                    wave.iter()
                        .map(|s| StepResult::skipped(s.spec.role, "task cancelled")),
                );
                continue;
            }

            let runs = wave.iter().map(|step| {
                let blocked = step.depends_on.iter().copied().find(|dep| {
                    results
                        .iter()
                        .find(|r| r.agent == *dep)
                        .map(StepResult::status)
                        != Some(StepStatus::Succeeded)
                });
                let ctx = &ctx;
                async move {
                    match blocked {
                        Some(dep) => StepResult::skipped(
                            step.spec.role,
                            format!("dependency '{dep}' did not succeed"),
                        ),
                        None => self.run_step(ctx, step).await,
                    }
                }
            });
            let finished = join_all(runs).await;
            results.extend(finished);
        }

        // Report steps in plan order.
        results.sort_by_key(|r| steps.iter().position(|s| s.spec.role == r.agent));

        let status = TaskStatus::from_steps(&results);
        let denials = results
            .iter()
            .filter_map(|r| match &r.outcome {
                StepOutcome::Denied { decision } => Some(decision.clone()),
                _ => None,
            })
            .collect();
        let result = TaskResult {
            task_id: task_id.clone(),
            status,
            tokens_used: results.iter().map(|r| r.tokens_used).sum(),
            steps: results,
            budget: self.ledger.get(&task_id),
            declared_permissions: request.declared_permissions,
            inferred_permissions: inferred.into_iter().collect(),
            denials,
            cancelled: ctx.cancelled(),
            started_at,
            finished_at: Utc::now(),
        };

        self.publish_summary(&result).await;
        info!(status = ?result.status, tokens_used = result.tokens_used, "Task finished");
        self.finish(&task_id, Some(result.clone()), None, status);
        Ok(result)
    }

    async fn run_step(&self, ctx: &TaskContext, step: &PlannedStep) -> StepResult {
        let role = step.spec.role;
        if ctx.cancelled() {
            return StepResult::skipped(role, "task cancelled");
        }

        if let Some(resource) = step.spec.sensitive.filter(|r| ctx.required.contains(r)) {
            match self
                .trust
                .authorize_for_task(&ctx.task_id, role, resource, ctx.justification)
                .await
            {
                Ok(decision) if !decision.granted => {
                    info!(agent = %role, resource = %resource, score = decision.weighted_score, "Step denied");
                    return StepResult::new(role, StepOutcome::Denied { decision });
                }
                Ok(_) => {}
                Err(TrustError::InvalidProfile(message)) => {
                    return StepResult::failed(role, StepFailure::InvalidProfile { message });
                }
                Err(TrustError::Storage(e)) => {
                    return StepResult::failed(role, StepFailure::Storage { message: e.to_string() });
                }
            }
        }

        if let Some(record) = self.ledger.get(&ctx.task_id) {
            if record.is_exhausted() {
                debug!(agent = %role, "Budget exhausted, provider call refused");
                return StepResult::failed(
                    role,
                    StepFailure::BudgetExceeded {
                        tokens_used: record.tokens_used,
                        token_limit: record.token_limit,
                    },
                );
            }
        }

        let prompt = self.build_prompt(ctx, step);
        let response = self
            .gateway
            .call(ctx.provider_hint.as_deref(), &prompt)
            .await;

        let mut warnings = Vec::new();
        if response.tokens_used > 0 {
            if let Err(e) = self
                .ledger
                .record_usage_from(&ctx.task_id, response.tokens_used, ctx.limit, Some(response.provider.as_str()))
                .await
            {
                warn!(agent = %role, tokens = response.tokens_used, error = %e, "Usage not recorded");
                warnings.push(format!("usage of {} tokens not recorded: {e}", response.tokens_used));
            }
        }

        let outcome = match response.result {
            Ok(completion) => {
                let key = BlackboardEntry::output_key(ctx.task_id.as_str(), role);
                let value = json!({
                    "text": completion.text,
                    "model": completion.model,
                    "provider": completion.provider,
                    "tokens_used": completion.tokens_used,
                });
                match self.blackboard.put(&key, value, role).await {
                    Ok(_) => StepOutcome::Succeeded { output_key: key },
                    Err(e) => StepOutcome::Failed {
                        failure: StepFailure::Storage { message: e.to_string() },
                    },
                }
            }
            Err(e) => {
                warn!(agent = %role, error = %e, attempts = response.attempts, "Provider call failed");
                StepOutcome::Failed {
                    failure: StepFailure::Provider {
                        error: e.kind(),
                        message: e.to_string(),
                    },
                }
            }
        };

        StepResult {
            agent: role,
            outcome,
            tokens_used: response.tokens_used,
            attempts: response.attempts,
            warnings,
        }
    }

    fn build_prompt(&self, ctx: &TaskContext, step: &PlannedStep) -> String {
        let mut prompt = format!(
            "You are the {} agent. {}\n\nTask: {}\n",
            step.spec.role, step.spec.instruction, ctx.message
        );
        for dep in &step.depends_on {
            let key = BlackboardEntry::output_key(ctx.task_id.as_str(), *dep);
            if let Some(text) = self
                .blackboard
                .get_value(&key)
                .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(str::to_string))
            {
                prompt.push_str(&format!("\nInput from the {dep} agent:\n{text}\n"));
            }
        }
        prompt
    }

    /// The orchestrator's record of the task on the blackboard.
    async fn publish_summary(&self, result: &TaskResult) {
        let key = BlackboardEntry::output_key(result.task_id.as_str(), AgentRole::Orchestrator);
        let steps: serde_json::Map<String, serde_json::Value> = result
            .steps
            .iter()
            .map(|s| (s.agent.to_string(), json!(s.status())))
            .collect();
        let summary = json!({
            "status": result.status,
            "steps": steps,
            "tokens_used": result.tokens_used,
            "cancelled": result.cancelled,
        });
        if let Err(e) = self
            .blackboard
            .put(&key, summary, AgentRole::Orchestrator)
            .await
        {
            warn!(error = %e, "Task summary not published");
        }
    }
}
