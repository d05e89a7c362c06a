//! # agentgate
//!
//! Multi-provider agent orchestration. A task is split across a fixed roster
//! of specialist agents that share a durable blackboard, draw from a per-task
//! token budget, and must pass a trust-weighted permission check before
//! touching a sensitive resource.
//!
//! Layering, bottom up:
//!
//! - [`persistence`]: key-value and append-log storage with transparent
//!   fallback to an embedded backend.
//! - [`blackboard`], [`budget`], [`trust`]: shared state, token accounting,
//!   and audited authorization on top of storage.
//! - [`provider`]: gateway to AI providers with routing, timeouts, retries and
//!   circuit breaking.
//! - [`coordinator`]: plans and runs tasks across the roster.
//! - [`observer`], [`server`]: snapshot push and the HTTP surface.

pub mod blackboard;
pub mod budget;
pub mod config;
pub mod coordinator;
pub mod observer;
pub mod persistence;
pub mod provider;
pub mod server;
pub mod trust;
pub mod types;

pub use blackboard::{Blackboard, BlackboardEntry};
pub use budget::{BudgetLedger, BudgetRecord, BudgetStatus};
pub use config::AppConfig;
pub use coordinator::{Coordinator, TaskRequest, TaskResult, TaskStatus};
pub use persistence::FallbackStore;
pub use provider::{Provider, ProviderGateway};
pub use trust::{PermissionRequest, TrustEngine};
pub use types::{AgentRole, ResourceType, TaskId};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
