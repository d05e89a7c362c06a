//! Retrying, timeout-bounded front door to every provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CircuitBreaker, CircuitConfig, CircuitState, Completion, Provider, ProviderError};
use crate::types::UsageMetrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis((base as u64).min(self.max_delay_ms))
    }
}

/// Outcome of one gateway call, covering every attempt it made.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub provider: String,
    pub result: Result<Completion, ProviderError>,
    pub attempts: u32,
    /// Tokens billed across all attempts, failed ones included.
    pub tokens_used: u64,
}

/// Per-provider status for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub circuit: CircuitState,
    pub usage: UsageMetrics,
}

#[derive(Debug)]
struct Registered {
    provider: Arc<dyn Provider>,
    breaker: CircuitBreaker,
}

#[derive(Debug)]
pub struct ProviderGateway {
    providers: HashMap<String, Registered>,
    default_provider: String,
    retry: RetryConfig,
    call_timeout: Duration,
    circuit: CircuitConfig,
    usage: Mutex<HashMap<String, UsageMetrics>>,
}

impl ProviderGateway {
    pub fn new(
        default_provider: impl Into<String>,
        retry: RetryConfig,
        call_timeout: Duration,
        circuit: CircuitConfig,
    ) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
            retry,
            call_timeout,
            circuit,
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(mut self, provider: Arc<dyn Provider>) -> Self {
        let name = provider.name().to_string();
        let breaker = CircuitBreaker::new(name.clone(), &self.circuit);
        self.providers.insert(name, Registered { provider, breaker });
        self
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Split a caller hint into provider name and model.
    ///
    /// `"openai/gpt-4o"` names both, `"openai"` names a provider, and any
    /// other non-empty hint is a model for the default provider.
    pub fn route<'a>(&'a self, hint: Option<&'a str>) -> (&'a str, Option<&'a str>) {
        let hint = hint.map(str::trim).filter(|h| !h.is_empty());
        match hint {
            None => (self.default_provider.as_str(), None),
            Some(h) => match h.split_once('/') {
                Some((provider, model)) if self.providers.contains_key(provider) => {
                    (provider, Some(model).filter(|m| !m.is_empty()))
                }
                _ if self.providers.contains_key(h) => (h, None),
                _ => (self.default_provider.as_str(), Some(h)),
            },
        }
    }

    /// Call the provider chosen by `hint`, retrying transient failures.
    pub async fn call(&self, hint: Option<&str>, prompt: &str) -> GatewayResponse {
        let (name, model) = self.route(hint);
        let Some(registered) = self.providers.get(name) else {
            return GatewayResponse {
                provider: name.to_string(),
                result: Err(ProviderError::UnknownProvider(name.to_string())),
                attempts: 0,
                tokens_used: 0,
            };
        };

        let mut attempts = 0u32;
        let mut tokens_used = 0u64;
        let mut attempt = 0u32;
        let result = loop {
            let Some(permit) = registered.breaker.allow() else {
                break Err(ProviderError::CircuitOpen(name.to_string()));
            };
            attempts += 1;

            let outcome =
                match tokio::time::timeout(self.call_timeout, registered.provider.call(prompt, model)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProviderError::Timeout),
                };

            match outcome {
                Ok(completion) => {
                    permit.success();
                    tokens_used += completion.tokens_used;
                    break Ok(completion);
                }
                Err(e) => {
                    tokens_used += e.tokens_used();
                    if e.counts_against_circuit() {
                        permit.failure();
                    } else {
                        permit.neutral();
                    }

                    if !e.is_transient() || attempt >= self.retry.max_retries {
                        break Err(e);
                    }
                    let delay = self.retry.delay(attempt);
                    warn!(
                        provider = name,
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying provider call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        let succeeded = result.is_ok();
        self.usage
            .lock()
            .entry(name.to_string())
            .or_default()
            .record_call(tokens_used, attempts, succeeded);
        debug!(provider = name, attempts, tokens_used, succeeded, "Provider call finished");

        GatewayResponse {
            provider: name.to_string(),
            result,
            attempts,
            tokens_used,
        }
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        let usage = self.usage.lock();
        let mut out: Vec<ProviderHealth> = self
            .providers
            .iter()
            .map(|(name, registered)| ProviderHealth {
                name: name.clone(),
                circuit: registered.breaker.state(),
                usage: usage.get(name).cloned().unwrap_or_default(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
