//! # Trust & Permission Engine
//!
//! Decides whether an agent may act on a sensitive resource:
//!
//! ```text
//! weighted_score = trust_level(agent) * 0.4
//!                + justification     * 0.4
//!                + (1 - risk(resource)) * 0.2
//! granted        = weighted_score >= 0.5
//! ```
//!
//! Every decision is written to the [`AuditLog`] before it is returned. If
//! the audit write is not confirmed, no decision is produced.
//!
//! Trust levels and risk scores live in a versioned [`ProfileSet`]. Each
//! authorization evaluates against one snapshot; administrative updates swap
//! in a new snapshot atomically and never affect a check already in flight.

pub mod audit;
pub mod justification;
pub mod profiles;

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::persistence::{FallbackStore, StorageError};
use crate::types::{AgentRole, ResourceType, TaskId, UnknownVariant};

pub use audit::{AuditEntry, AuditEvent, AuditLog, ChainReport, PermissionRequest, PolicyUpdateRecord};
pub use justification::justification_score;
pub use profiles::{ProfileSet, ProfileUpdate};

const TRUST_WEIGHT: f64 = 0.4;
const JUSTIFICATION_WEIGHT: f64 = 0.4;
const SAFETY_WEIGHT: f64 = 0.2;
const GRANT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Error)]
pub enum TrustError {
    /// Unknown or misconfigured agent/resource profile.
    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    /// The audit entry was not confirmed, so no decision was made.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<UnknownVariant> for TrustError {
    fn from(e: UnknownVariant) -> Self {
        TrustError::InvalidProfile(e.to_string())
    }
}

/// The pure part of a decision, before it is recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub justification: f64,
    pub weighted: f64,
    pub granted: bool,
}

/// Weighted score for fixed inputs. `justification` is clamped into `[0, 1]`
/// and the result is rounded to nine decimals so boundary cases compare
/// exactly.
pub fn weighted_score(trust_level: f64, justification: f64, risk_score: f64) -> Score {
    let justification = if justification.is_nan() {
        0.0
    } else {
        justification.clamp(0.0, 1.0)
    };
    let raw = trust_level * TRUST_WEIGHT
        + justification * JUSTIFICATION_WEIGHT
        + (1.0 - risk_score) * SAFETY_WEIGHT;
    let weighted = (raw * 1e9).round() / 1e9;
    Score {
        justification,
        weighted,
        granted: weighted >= GRANT_THRESHOLD,
    }
}

/// Authorization engine with an audit trail.
#[derive(Debug)]
pub struct TrustEngine {
    profiles: RwLock<Arc<ProfileSet>>,
    audit: AuditLog,
    /// Serializes administrative updates so versions stay linear.
    update_lock: tokio::sync::Mutex<()>,
}

impl TrustEngine {
    pub fn new(profiles: ProfileSet, store: Arc<FallbackStore>) -> Result<Self, TrustError> {
        profiles.validate()?;
        Ok(Self {
            profiles: RwLock::new(Arc::new(profiles)),
            audit: AuditLog::new(store),
            update_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The current profile snapshot.
    pub fn profiles(&self) -> Arc<ProfileSet> {
        self.profiles.read().clone()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Score a request without recording it.
    pub fn evaluate(
        &self,
        agent: AgentRole,
        resource: ResourceType,
        justification: f64,
    ) -> Result<(Score, u64), TrustError> {
        let profiles = self.profiles();
        let score = weighted_score(
            profiles.trust_level(agent)?,
            justification,
            profiles.risk_score(resource)?,
        );
        Ok((score, profiles.version))
    }

    /// Decide and record. The returned request is exactly what was logged.
    pub async fn authorize(
        &self,
        agent: AgentRole,
        resource: ResourceType,
        justification: f64,
    ) -> Result<PermissionRequest, TrustError> {
        self.authorize_inner(None, agent, resource, justification).await
    }

    /// [`authorize`](Self::authorize) on behalf of a task.
    pub async fn authorize_for_task(
        &self,
        task_id: &TaskId,
        agent: AgentRole,
        resource: ResourceType,
        justification: f64,
    ) -> Result<PermissionRequest, TrustError> {
        self.authorize_inner(Some(task_id.clone()), agent, resource, justification)
            .await
    }

    async fn authorize_inner(
        &self,
        task_id: Option<TaskId>,
        agent: AgentRole,
        resource: ResourceType,
        justification: f64,
    ) -> Result<PermissionRequest, TrustError> {
        let profiles = self.profiles();
        let trust = profiles.trust_level(agent)?;
        let risk = profiles.risk_score(resource)?;
        let score = weighted_score(trust, justification, risk);

        let verdict = if score.granted { "granted" } else { "denied" };
        let cmp = if score.granted { ">=" } else { "<" };
        let reason = format!(
            "{verdict}: score {:.3} {cmp} {GRANT_THRESHOLD} (trust {trust:.2}, justification {:.2}, risk {risk:.2})",
            score.weighted, score.justification,
        );

        let request = PermissionRequest {
            agent_id: agent,
            resource_type: resource,
            justification_score: score.justification,
            weighted_score: score.weighted,
            granted: score.granted,
            timestamp: Utc::now(),
            reason,
            profile_version: profiles.version,
            task_id,
        };
        self.audit
            .append(AuditEvent::Permission(request.clone()))
            .await?;

        debug!(
            agent = %agent,
            resource = %resource,
            score = request.weighted_score,
            granted = request.granted,
            "Permission decided"
        );
        Ok(request)
    }

    /// Apply an administrative change and return the new snapshot.
    ///
    /// The change is audited first; if that fails the old snapshot stays.
    pub async fn update_profiles(&self, update: ProfileUpdate) -> Result<Arc<ProfileSet>, TrustError> {
        let _guard = self.update_lock.lock().await;
        let current = self.profiles();
        let next = Arc::new(current.apply(&update)?);

        self.audit
            .append(AuditEvent::PolicyUpdate(PolicyUpdateRecord {
                from_version: current.version,
                to_version: next.version,
                update,
                timestamp: Utc::now(),
            }))
            .await?;

        *self.profiles.write() = Arc::clone(&next);
        info!(version = next.version, "Trust profiles updated");
        Ok(next)
    }

    /// The last `n` audit entries, oldest first.
    pub async fn tail(&self, n: usize) -> Result<Vec<AuditEntry>, TrustError> {
        Ok(self.audit.tail(n).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryBackend, StoreOptions};
    use std::collections::HashMap;
    use std::time::Duration;

    fn engine_with(
        trust: &[(AgentRole, f64)],
        risk: &[(ResourceType, f64)],
    ) -> (Arc<MemoryBackend>, Arc<MemoryBackend>, TrustEngine) {
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
        let profiles = ProfileSet {
            version: 1,
            trust: trust.iter().copied().collect(),
            risk: risk.iter().copied().collect(),
        };
        (primary, fallback, TrustEngine::new(profiles, store).unwrap())
    }

    #[test]
    fn test_weighted_score_boundaries() {
        let s = weighted_score(0.95, 0.6, 0.7);
        assert!((s.weighted - 0.68).abs() < 1e-9);
        assert!(s.granted);

        let s = weighted_score(0.5, 0.5, 0.9);
        assert!((s.weighted - 0.42).abs() < 1e-9);
        assert!(!s.granted);
    }

    #[test]
    fn test_exact_tie_is_granted() {
        let s = weighted_score(0.5, 0.5, 0.5);
        assert_eq!(s.weighted, 0.5);
        assert!(s.granted);

        // 0.7*0.4 + 0.3*0.4 + 0.5*0.2 also lands on 0.5 after rounding.
        let s = weighted_score(0.7, 0.3, 0.5);
        assert_eq!(s.weighted, 0.5);
        assert!(s.granted);
    }

    #[test]
    fn test_justification_is_clamped() {
        assert_eq!(weighted_score(0.5, 7.0, 0.5), weighted_score(0.5, 1.0, 0.5));
        assert_eq!(weighted_score(0.5, -3.0, 0.5), weighted_score(0.5, 0.0, 0.5));
        assert_eq!(weighted_score(0.5, f64::NAN, 0.5).justification, 0.0);
    }

    #[tokio::test]
    async fn test_authorize_logs_before_returning() {
        let (_, _, engine) = engine_with(
            &[(AgentRole::Code, 0.95)],
            &[(ResourceType::Database, 0.7)],
        );
        let decision = engine
            .authorize(AgentRole::Code, ResourceType::Database, 0.6)
            .await
            .unwrap();
        assert!(decision.granted);
        assert!(decision.reason.starts_with("granted"));

        let tail = engine.tail(1).await.unwrap();
        assert_eq!(tail[0].event, AuditEvent::Permission(decision));
    }

    #[tokio::test]
    async fn test_denial_is_logged_too() {
        let (_, _, engine) = engine_with(
            &[(AgentRole::Billing, 0.5)],
            &[(ResourceType::Payments, 0.9)],
        );
        let decision = engine
            .authorize(AgentRole::Billing, ResourceType::Payments, 0.5)
            .await
            .unwrap();
        assert!(!decision.granted);
        assert_eq!(engine.tail(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_profile_is_rejected_and_not_logged() {
        let (_, _, engine) = engine_with(&[(AgentRole::Code, 0.9)], &[]);
        let err = engine
            .authorize(AgentRole::Code, ResourceType::Secrets, 0.9)
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::InvalidProfile(_)));
        assert!(engine.tail(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_decision_without_audit() {
        let (primary, fallback, engine) = engine_with(
            &[(AgentRole::Code, 0.9)],
            &[(ResourceType::Email, 0.1)],
        );
        primary.set_online(false);
        fallback.set_online(false);
        let err = engine
            .authorize(AgentRole::Code, ResourceType::Email, 0.9)
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::Storage(_)));
    }

    #[tokio::test]
    async fn test_authorize_is_deterministic() {
        let (_, _, engine) = engine_with(
            &[(AgentRole::Research, 0.8)],
            &[(ResourceType::FileExport, 0.6)],
        );
        let a = engine
            .authorize(AgentRole::Research, ResourceType::FileExport, 0.45)
            .await
            .unwrap();
        let b = engine
            .authorize(AgentRole::Research, ResourceType::FileExport, 0.45)
            .await
            .unwrap();
        assert_eq!(a.weighted_score, b.weighted_score);
        assert_eq!(a.granted, b.granted);
    }

    #[tokio::test]
    async fn test_update_profiles_swaps_snapshot() {
        let (_, _, engine) = engine_with(
            &[(AgentRole::Billing, 0.5)],
            &[(ResourceType::Payments, 0.9)],
        );
        let before = engine
            .authorize(AgentRole::Billing, ResourceType::Payments, 0.5)
            .await
            .unwrap();
        assert!(!before.granted);

        let update = ProfileUpdate::from_named(
            &HashMap::from([("billing".to_string(), 0.9)]),
            &HashMap::new(),
            Some("ops-admin".into()),
        )
        .unwrap();
        let next = engine.update_profiles(update).await.unwrap();
        assert_eq!(next.version, 2);

        let after = engine
            .authorize(AgentRole::Billing, ResourceType::Payments, 0.5)
            .await
            .unwrap();
        assert!(after.granted);
        assert_eq!(after.profile_version, 2);

        let tail = engine.tail(3).await.unwrap();
        assert!(matches!(tail[1].event, AuditEvent::PolicyUpdate(_)));
        assert!(engine.audit().verify_chain().await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_invalid_update_keeps_old_snapshot() {
        let (_, _, engine) = engine_with(&[(AgentRole::Code, 0.7)], &[]);
        let mut update = ProfileUpdate::default();
        update.trust.insert(AgentRole::Code, 1.2);

        assert!(engine.update_profiles(update).await.is_err());
        assert_eq!(engine.profiles().version, 1);
        assert!(engine.tail(5).await.unwrap().is_empty());
    }
}
