//! Trust and risk profiles.
//!
//! Profiles are immutable once built. An administrative update produces a
//! new [`ProfileSet`] with a higher `version`; authorization always evaluates
//! against exactly one version.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::TrustError;
use crate::types::{AgentRole, ResourceType};

/// One consistent version of every trust level and risk score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSet {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub trust: HashMap<AgentRole, f64>,
    #[serde(default)]
    pub risk: HashMap<ResourceType, f64>,
}

impl Default for ProfileSet {
    fn default() -> Self {
        let trust = [
            (AgentRole::Orchestrator, 0.95),
            (AgentRole::Research, 0.8),
            (AgentRole::Analysis, 0.8),
            (AgentRole::Writing, 0.75),
            (AgentRole::Code, 0.7),
            (AgentRole::Review, 0.85),
            (AgentRole::Data, 0.7),
            (AgentRole::Operations, 0.65),
            (AgentRole::Billing, 0.6),
        ];
        let risk = [
            (ResourceType::Database, 0.7),
            (ResourceType::Payments, 0.9),
            (ResourceType::Email, 0.5),
            (ResourceType::FileExport, 0.6),
            (ResourceType::ExternalApi, 0.6),
            (ResourceType::Secrets, 0.95),
        ];
        Self {
            version: 1,
            trust: trust.into_iter().collect(),
            risk: risk.into_iter().collect(),
        }
    }
}

impl ProfileSet {
    pub fn trust_level(&self, agent: AgentRole) -> Result<f64, TrustError> {
        self.trust
            .get(&agent)
            .copied()
            .ok_or_else(|| TrustError::InvalidProfile(format!("no trust level configured for agent '{agent}'")))
    }

    pub fn risk_score(&self, resource: ResourceType) -> Result<f64, TrustError> {
        self.risk
            .get(&resource)
            .copied()
            .ok_or_else(|| TrustError::InvalidProfile(format!("no risk score configured for resource '{resource}'")))
    }

    /// Reject values outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), TrustError> {
        for (agent, value) in &self.trust {
            check_unit("trust level", agent.as_str(), *value)?;
        }
        for (resource, value) in &self.risk {
            check_unit("risk score", resource.as_str(), *value)?;
        }
        Ok(())
    }

    /// The next version with `update` merged over this one.
    pub fn apply(&self, update: &ProfileUpdate) -> Result<ProfileSet, TrustError> {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.trust.extend(update.trust.iter().map(|(k, v)| (*k, *v)));
        next.risk.extend(update.risk.iter().map(|(k, v)| (*k, *v)));
        next.validate()?;
        Ok(next)
    }
}

fn check_unit(what: &str, name: &str, value: f64) -> Result<(), TrustError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(TrustError::InvalidProfile(format!(
            "{what} for '{name}' must be within [0, 1], got {value}"
        )))
    }
}

/// Partial administrative change; unnamed entries keep their current value.
///
/// Ordered maps keep the audit digest of an update stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub trust: BTreeMap<AgentRole, f64>,
    #[serde(default)]
    pub risk: BTreeMap<ResourceType, f64>,
    /// Who asked for the change, for the audit trail.
    #[serde(default)]
    pub actor: Option<String>,
}

impl ProfileUpdate {
    /// Build an update from loosely typed names, as received over HTTP.
    pub fn from_named(
        trust: &HashMap<String, f64>,
        risk: &HashMap<String, f64>,
        actor: Option<String>,
    ) -> Result<Self, TrustError> {
        let trust = trust
            .iter()
            .map(|(name, v)| name.parse::<AgentRole>().map(|r| (r, *v)).map_err(TrustError::from))
            .collect::<Result<BTreeMap<_, _>, TrustError>>()?;
        let risk = risk
            .iter()
            .map(|(name, v)| name.parse::<ResourceType>().map(|r| (r, *v)).map_err(TrustError::from))
            .collect::<Result<BTreeMap<_, _>, TrustError>>()?;
        Ok(Self { trust, risk, actor })
    }

    pub fn is_empty(&self) -> bool {
        self.trust.is_empty() && self.risk.is_empty()
    }
}
