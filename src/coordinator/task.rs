//! Task and step result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::BudgetRecord;
use crate::provider::ProviderErrorKind;
use crate::trust::PermissionRequest;
use crate::types::{AgentRole, ResourceType, TaskId};

/// An incoming task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub message: String,
    #[serde(default)]
    pub declared_permissions: Vec<ResourceType>,
    /// Token limit for the whole task; the configured default when absent.
    #[serde(default)]
    pub budget_limit: Option<u64>,
    /// `provider`, `provider/model`, or a bare model name.
    #[serde(default)]
    pub provider_hint: Option<String>,
    /// Narrow the plan to these agents.
    #[serde(default)]
    pub agents: Option<Vec<AgentRole>>,
}

impl TaskRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            declared_permissions: Vec::new(),
            budget_limit: None,
            provider_hint: None,
            agents: None,
        }
    }

    pub fn with_agents(mut self, agents: &[AgentRole]) -> Self {
        self.agents = Some(agents.to_vec());
        self
    }

    pub fn with_budget(mut self, limit: u64) -> Self {
        self.budget_limit = Some(limit);
        self
    }

    pub fn with_permissions(mut self, permissions: &[ResourceType]) -> Self {
        self.declared_permissions = permissions.to_vec();
        self
    }
}

/// `PENDING -> RUNNING -> (PARTIAL | COMPLETED | FAILED)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Partial,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Partial | TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Final status from step statuses.
    pub fn from_steps(steps: &[StepResult]) -> Self {
        let succeeded = steps
            .iter()
            .filter(|s| s.status() == StepStatus::Succeeded)
            .count();
        if succeeded == 0 {
            TaskStatus::Failed
        } else if succeeded == steps.len() {
            TaskStatus::Completed
        } else {
            TaskStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Succeeded,
    Denied,
    Failed,
    Skipped,
}

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepFailure {
    /// Refused before calling the provider.
    BudgetExceeded { tokens_used: u64, token_limit: u64 },
    Provider { error: ProviderErrorKind, message: String },
    Storage { message: String },
    InvalidProfile { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    Succeeded { output_key: String },
    Denied { decision: PermissionRequest },
    Failed { failure: StepFailure },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub agent: AgentRole,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub tokens_used: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StepResult {
    pub(crate) fn new(agent: AgentRole, outcome: StepOutcome) -> Self {
        Self {
            agent,
            outcome,
            tokens_used: 0,
            attempts: 0,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn skipped(agent: AgentRole, reason: impl Into<String>) -> Self {
        Self::new(agent, StepOutcome::Skipped { reason: reason.into() })
    }

    pub(crate) fn failed(agent: AgentRole, failure: StepFailure) -> Self {
        Self::new(agent, StepOutcome::Failed { failure })
    }

    pub fn status(&self) -> StepStatus {
        match self.outcome {
            StepOutcome::Succeeded { .. } => StepStatus::Succeeded,
            StepOutcome::Denied { .. } => StepStatus::Denied,
            StepOutcome::Failed { .. } => StepStatus::Failed,
            StepOutcome::Skipped { .. } => StepStatus::Skipped,
        }
    }

    pub fn failure(&self) -> Option<&StepFailure> {
        match &self.outcome {
            StepOutcome::Failed { failure } => Some(failure),
            _ => None,
        }
    }
}

/// The full outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub steps: Vec<StepResult>,
    pub tokens_used: u64,
    pub budget: Option<BudgetRecord>,
    pub declared_permissions: Vec<ResourceType>,
    pub inferred_permissions: Vec<ResourceType>,
    pub denials: Vec<PermissionRequest>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn step(&self, agent: AgentRole) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.agent == agent)
    }
}

/// Registry view of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub cancel_requested: bool,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
