//! Blackboard entry: a single committed fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::AgentRole;

/// A single committed entry on the blackboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardEntry {
    /// Unique key; agent outputs use `"{task_id}/{agent}"`.
    pub key: String,
    /// Arbitrary structured payload.
    pub value: Value,
    /// Agent that committed this value.
    pub written_by: AgentRole,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
}

impl BlackboardEntry {
    pub fn new(key: impl Into<String>, value: Value, written_by: AgentRole) -> Self {
        Self {
            key: key.into(),
            value,
            written_by,
            timestamp: Utc::now(),
        }
    }

    /// The key an agent's step output is stored under.
    pub fn output_key(task_id: &str, agent: AgentRole) -> String {
        format!("{task_id}/{agent}")
    }
}
