//! Closed vocabularies shared by every subsystem.
//!
//! Agents and resources are fixed enumerations so an unknown name is caught
//! when it is parsed, not when a profile lookup happens deep inside an
//! authorization check.

pub mod locks;
pub mod usage_metrics;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use locks::KeyLocks;
pub use usage_metrics::UsageMetrics;

/// Returned when a string does not name a known agent or resource.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

// ---------------------------------------------------------------------------
// AgentRole
// ---------------------------------------------------------------------------

/// The fixed roster of agent roles.
///
/// `Orchestrator` is the coordinating role; the remaining eight are
/// specialists that each run one step per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Research,
    Analysis,
    Writing,
    Code,
    Review,
    Data,
    Operations,
    Billing,
}

impl AgentRole {
    /// Every role, orchestrator first.
    pub const ALL: [AgentRole; 9] = [
        AgentRole::Orchestrator,
        AgentRole::Research,
        AgentRole::Analysis,
        AgentRole::Writing,
        AgentRole::Code,
        AgentRole::Review,
        AgentRole::Data,
        AgentRole::Operations,
        AgentRole::Billing,
    ];

    /// The eight specialist roles.
    pub const SPECIALISTS: [AgentRole; 8] = [
        AgentRole::Research,
        AgentRole::Analysis,
        AgentRole::Writing,
        AgentRole::Code,
        AgentRole::Review,
        AgentRole::Data,
        AgentRole::Operations,
        AgentRole::Billing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::Research => "research",
            AgentRole::Analysis => "analysis",
            AgentRole::Writing => "writing",
            AgentRole::Code => "code",
            AgentRole::Review => "review",
            AgentRole::Data => "data",
            AgentRole::Operations => "operations",
            AgentRole::Billing => "billing",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        AgentRole::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == needle)
            .ok_or(UnknownVariant {
                kind: "agent",
                value: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// ResourceType
// ---------------------------------------------------------------------------

/// Sensitive resources an agent may need permission to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Database,
    Payments,
    Email,
    FileExport,
    ExternalApi,
    Secrets,
}

impl ResourceType {
    pub const ALL: [ResourceType; 6] = [
        ResourceType::Database,
        ResourceType::Payments,
        ResourceType::Email,
        ResourceType::FileExport,
        ResourceType::ExternalApi,
        ResourceType::Secrets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Database => "DATABASE",
            ResourceType::Payments => "PAYMENTS",
            ResourceType::Email => "EMAIL",
            ResourceType::FileExport => "FILE_EXPORT",
            ResourceType::ExternalApi => "EXTERNAL_API",
            ResourceType::Secrets => "SECRETS",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_uppercase().replace('-', "_");
        ResourceType::ALL
            .iter()
            .copied()
            .find(|resource| resource.as_str() == needle)
            .ok_or(UnknownVariant {
                kind: "resource",
                value: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// Identifier of a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
