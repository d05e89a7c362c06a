//! The fixed agent roster and plan construction.

use serde::Serialize;

use crate::types::{AgentRole, ResourceType};

/// Static description of one specialist.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSpec {
    pub role: AgentRole,
    pub instruction: &'static str,
    /// Resource this agent touches when the task calls for it.
    pub sensitive: Option<ResourceType>,
    /// Agents whose output this one reads.
    pub depends_on: &'static [AgentRole],
}

const ROSTER: &[AgentSpec] = &[
    AgentSpec {
        role: AgentRole::Research,
        instruction: "Gather the background facts needed for the task, citing external sources where used.",
        sensitive: Some(ResourceType::ExternalApi),
        depends_on: &[],
    },
    AgentSpec {
        role: AgentRole::Analysis,
        instruction: "Break the task down, identify risks and trade-offs, and state a recommendation.",
        sensitive: None,
        depends_on: &[],
    },
    AgentSpec {
        role: AgentRole::Writing,
        instruction: "Draft the user-facing text for the task, including any outgoing messages.",
        sensitive: Some(ResourceType::Email),
        depends_on: &[],
    },
    AgentSpec {
        role: AgentRole::Code,
        instruction: "Produce the code or schema changes the task requires.",
        sensitive: Some(ResourceType::Database),
        depends_on: &[],
    },
    AgentSpec {
        role: AgentRole::Data,
        instruction: "Query and shape the data the task needs, preparing any exports.",
        sensitive: Some(ResourceType::FileExport),
        depends_on: &[],
    },
    AgentSpec {
        role: AgentRole::Operations,
        instruction: "Plan the operational steps, including credentials and rollout.",
        sensitive: Some(ResourceType::Secrets),
        depends_on: &[],
    },
    AgentSpec {
        role: AgentRole::Billing,
        instruction: "Handle charges, refunds and invoices the task involves.",
        sensitive: Some(ResourceType::Payments),
        depends_on: &[],
    },
    AgentSpec {
        role: AgentRole::Review,
        instruction: "Review the drafted text and code for correctness and consistency.",
        sensitive: None,
        depends_on: &[AgentRole::Writing, AgentRole::Code],
    },
];

/// Every specialist, in default plan order.
pub fn roster() -> &'static [AgentSpec] {
    ROSTER
}

pub fn spec_for(role: AgentRole) -> Option<&'static AgentSpec> {
    ROSTER.iter().find(|s| s.role == role)
}

/// A planned step: the agent plus the dependencies that are actually in
/// the plan.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub spec: &'static AgentSpec,
    pub depends_on: Vec<AgentRole>,
}

/// Build the plan for `agents` (the whole roster when `None`), in roster
/// order. The orchestrator and duplicates are ignored.
pub fn plan(agents: Option<&[AgentRole]>) -> Vec<PlannedStep> {
    let selected: Vec<&'static AgentSpec> = match agents {
        None => ROSTER.iter().collect(),
        Some(wanted) => ROSTER.iter().filter(|s| wanted.contains(&s.role)).collect(),
    };
    let roles: Vec<AgentRole> = selected.iter().map(|s| s.role).collect();

    selected
        .into_iter()
        .map(|spec| PlannedStep {
            spec,
            depends_on: spec
                .depends_on
                .iter()
                .copied()
                .filter(|d| roles.contains(d))
                .collect(),
        })
        .collect()
}

/// Group steps into waves. Every step's dependencies sit in an earlier
/// wave; steps within a wave are independent.
pub fn waves(steps: &[PlannedStep]) -> Vec<Vec<PlannedStep>> {
    let mut done: Vec<AgentRole> = Vec::new();
    let mut pending: Vec<PlannedStep> = steps.to_vec();
    let mut waves = Vec::new();

    while !pending.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|s| s.depends_on.iter().all(|d| done.contains(d)));
        if ready.is_empty() {
            // Unreachable with the static roster; run the rest together
            // rather than loop forever.
            waves.push(blocked);
            break;
        }
        done.extend(ready.iter().map(|s| s.spec.role));
        waves.push(ready);
        pending = blocked;
    }
    waves
}
