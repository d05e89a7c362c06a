//! Application configuration.
//!
//! Loaded from the YAML file named by `AGENTGATE_CONFIG` (all fields
//! optional), then overridden from the environment:
//!
//! | Variable                  | Field                      |
//! |---------------------------|----------------------------|
//! | `PORT`                    | `server.port`              |
//! | `AGENTGATE_SQLITE_PATH`   | `storage.sqlite_path`      |
//! | `AGENTGATE_FALLBACK_PATH` | `storage.fallback_path`    |
//! | `DATABASE_URL`            | `storage.database_url`     |
//! | `OPENAI_API_KEY`          | `provider.openai.api_key`  |
//! | `OPENAI_BASE_URL`         | `provider.openai.base_url` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::Pricing;
use crate::coordinator::CoordinatorConfig;
use crate::persistence::StoreOptions;
use crate::provider::{CircuitConfig, OpenAiConfig, RetryConfig};
use crate::trust::ProfileSet;

pub const CONFIG_ENV: &str = "AGENTGATE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Replaces the built-in profiles as a whole when present.
    #[serde(default)]
    pub profiles: ProfileSet,
    #[serde(default)]
    pub observer: ObserverConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Primary SQLite file, used when no `database_url` is set.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    /// Embedded fallback file; in-memory when unset.
    #[serde(default)]
    pub fallback_path: Option<PathBuf>,
    /// PostgreSQL primary (requires the `postgres` feature).
    #[serde(default, skip_serializing)]
    pub database_url: Option<String>,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default = "default_reprobe_interval_ms")]
    pub reprobe_interval_ms: u64,
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/agentgate.db")
}

fn default_op_timeout_ms() -> u64 {
    2_000
}

fn default_reprobe_interval_ms() -> u64 {
    5_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            fallback_path: None,
            database_url: None,
            op_timeout_ms: default_op_timeout_ms(),
            reprobe_interval_ms: default_reprobe_interval_ms(),
        }
    }
}

impl StorageConfig {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            op_timeout: Duration::from_millis(self.op_timeout_ms),
            reprobe_interval: Duration::from_millis(self.reprobe_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider used when a task gives no hint. Defaults to `openai` when an
    /// API key is configured and `scripted` otherwise.
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            call_timeout_ms: default_call_timeout_ms(),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            openai: OpenAiConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn openai_enabled(&self) -> bool {
        self.openai.api_key.as_deref().map_or(false, |k| !k.is_empty())
    }

    pub fn effective_default(&self) -> String {
        match &self.default_provider {
            Some(name) => name.clone(),
            None if self.openai_enabled() => self.openai.name.clone(),
            None => "scripted".to_string(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub pricing: Pricing,
    /// Token limit for tasks that do not declare one.
    #[serde(default = "default_budget_limit")]
    pub default_budget_limit: u64,
}

fn default_budget_limit() -> u64 {
    CoordinatorConfig::default().default_budget_limit
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            pricing: Pricing::default(),
            default_budget_limit: default_budget_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Finished tasks kept in the registry for status queries.
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
}

fn default_max_retained() -> usize {
    CoordinatorConfig::default().max_retained_tasks
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_retained: default_max_retained(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_audit_entries")]
    pub audit_entries: usize,
}

fn default_interval_ms() -> u64 {
    2_000
}

fn default_audit_entries() -> usize {
    20
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            audit_entries: default_audit_entries(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// File (if `AGENTGATE_CONFIG` is set), then environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT is not a valid port: {port:?}")))?;
        }
        if let Some(path) = get("AGENTGATE_SQLITE_PATH") {
            self.storage.sqlite_path = PathBuf::from(path);
        }
        if let Some(path) = get("AGENTGATE_FALLBACK_PATH") {
            self.storage.fallback_path = Some(PathBuf::from(path));
        }
        if let Some(url) = get("DATABASE_URL") {
            self.storage.database_url = Some(url);
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.provider.openai.api_key = Some(key);
        }
        if let Some(url) = get("OPENAI_BASE_URL") {
            self.provider.openai.base_url = url;
        }
        Ok(())
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            default_budget_limit: self.budget.default_budget_limit,
            max_retained_tasks: self.tasks.max_retained,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        if self.storage.op_timeout_ms == 0 {
            return Err(ConfigError::Invalid("storage.op_timeout_ms must be positive".into()));
        }
        if self.provider.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid("provider.call_timeout_ms must be positive".into()));
        }
        if self.provider.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "provider.retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.provider.circuit.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "provider.circuit.failure_threshold must be at least 1".into(),
            ));
        }
        if self.observer.interval_ms == 0 {
            return Err(ConfigError::Invalid("observer.interval_ms must be positive".into()));
        }
        if self.budget.pricing.cost_per_1k_tokens < 0.0 {
            return Err(ConfigError::Invalid("budget.pricing.cost_per_1k_tokens must not be negative".into()));
        }
        self.profiles
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use crate::types::AgentRole;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.provider.effective_default(), "scripted");
        assert_eq!(config.budget.default_budget_limit, 50_000);
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let config = AppConfig::from_yaml_str(
            "server:\n  port: 9000\nbudget:\n  default_budget_limit: 1000\n  pricing:\n    cost_per_1k_tokens: 0.01\n",
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.budget.default_budget_limit, 1000);
        assert_eq!(config.budget.pricing.cost_per_1k_tokens, 0.01);
        assert_eq!(config.storage.op_timeout_ms, 2_000);
        assert_eq!(config.profiles, ProfileSet::default());

        let coordinator = config.coordinator();
        assert_eq!(coordinator.default_budget_limit, 1000);
        assert_eq!(coordinator.max_retained_tasks, 1_000);
    }

    #[test]
    fn test_task_retention_section() {
        let config = AppConfig::from_yaml_str("tasks:\n  max_retained: 25\n").unwrap();
        assert_eq!(config.coordinator().max_retained_tasks, 25);
    }

    #[test]
    fn test_partial_retry_section() {
        let config = AppConfig::from_yaml_str("provider:\n  retry:\n    max_retries: 4\n").unwrap();
        assert_eq!(config.provider.retry.max_retries, 4);
        assert_eq!(config.provider.retry.initial_delay_ms, 250);
        assert_eq!(config.provider.circuit.failure_threshold, 5);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_env(env(&[
                ("PORT", "3100"),
                ("AGENTGATE_FALLBACK_PATH", "/tmp/fallback.db"),
                ("OPENAI_API_KEY", "sk-test"),
                ("OPENAI_BASE_URL", "http://localhost:11434/v1"),
                ("DATABASE_URL", ""),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 3100);
        assert_eq!(config.storage.fallback_path, Some(PathBuf::from("/tmp/fallback.db")));
        assert!(config.storage.database_url.is_none());
        assert_eq!(config.provider.effective_default(), "openai");
        assert_eq!(config.provider.openai.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn test_bad_port_is_rejected() {
        let mut config = AppConfig::default();
        assert!(matches!(
            config.apply_env(env(&[("PORT", "eighty")])),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_out_of_range_profile_is_rejected() {
        let config = AppConfig::from_yaml_str("profiles:\n  trust:\n    code: 1.4\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_role_fails_to_parse() {
        let err = AppConfig::from_yaml_str("profiles:\n  trust:\n    janitor: 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "profiles:\n  trust:\n    billing: 0.9\n  risk:\n    PAYMENTS: 0.5").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.profiles.trust_level(AgentRole::Billing).unwrap(), 0.9);
        assert!(config.validate().is_ok());

        assert!(matches!(
            AppConfig::from_file("/definitely/not/here.yaml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
