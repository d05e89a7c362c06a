//! Provider gateway.
//!
//! A [`Provider`] turns a prompt into a [`Completion`]. The
//! [`ProviderGateway`] sits in front of every registered provider and adds
//! per-attempt timeouts, bounded retries for transient failures, and a
//! per-provider [`CircuitBreaker`].

pub mod circuit;
pub mod gateway;
pub mod openai;
pub mod scripted;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use circuit::{CallPermit, CircuitBreaker, CircuitConfig, CircuitState};
pub use gateway::{GatewayResponse, ProviderGateway, ProviderHealth, RetryConfig};
pub use openai::{OpenAiCompatibleProvider, OpenAiConfig};
pub use scripted::{Behavior, ScriptedProvider};

/// A successful provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u64,
    pub model: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,

    #[error("rate limited by provider")]
    RateLimited,

    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// Anything else. A failed call may still have consumed tokens.
    #[error("provider error: {message}")]
    Unknown { message: String, tokens_used: u64 },

    #[error("circuit open for provider '{0}'")]
    CircuitOpen(String),

    #[error("no provider named '{0}'")]
    UnknownProvider(String),
}

/// Serializable discriminant of [`ProviderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    InvalidModel,
    Unknown,
    CircuitOpen,
    UnknownProvider,
}

impl ProviderError {
    /// Worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout | ProviderError::RateLimited)
    }

    /// Tokens billed for the failed call.
    pub fn tokens_used(&self) -> u64 {
        match self {
            ProviderError::Unknown { tokens_used, .. } => *tokens_used,
            _ => 0,
        }
    }

    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::Timeout => ProviderErrorKind::Timeout,
            ProviderError::RateLimited => ProviderErrorKind::RateLimited,
            ProviderError::InvalidModel(_) => ProviderErrorKind::InvalidModel,
            ProviderError::Unknown { .. } => ProviderErrorKind::Unknown,
            ProviderError::CircuitOpen(_) => ProviderErrorKind::CircuitOpen,
            ProviderError::UnknownProvider(_) => ProviderErrorKind::UnknownProvider,
        }
    }

    /// Whether this outcome says something about provider health.
    fn counts_against_circuit(&self) -> bool {
        !matches!(
            self,
            ProviderError::InvalidModel(_)
                | ProviderError::CircuitOpen(_)
                | ProviderError::UnknownProvider(_)
        )
    }
}

/// A text-completion backend.
#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    /// Registry name, e.g. `"openai"`.
    fn name(&self) -> &str;

    /// One attempt. Retries and timeouts are the gateway's business.
    async fn call(&self, prompt: &str, model_hint: Option<&str>) -> Result<Completion, ProviderError>;
}
