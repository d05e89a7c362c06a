//! OpenAI-compatible chat-completions provider over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{Completion, Provider, ProviderError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Usually supplied through `OPENAI_API_KEY`, never logged.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Transport-level timeout; the gateway applies its own per attempt.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_name() -> String {
    "openai".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            base_url: default_base_url(),
            api_key: None,
            default_model: default_model(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &OpenAiConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ProviderError::Unknown {
                message: format!("failed to build HTTP client: {e}"),
                tokens_used: 0,
            })?;
        Ok(Self {
            name: config.name.clone(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            default_model: config.default_model.clone(),
            client,
        })
    }
}

/// Text and total token usage from a chat-completions body.
pub(crate) fn parse_chat_response(body: &Value) -> Result<(String, u64), ProviderError> {
    let tokens_used = body
        .pointer("/usage/total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Unknown {
            message: "response has no choices[0].message.content".to_string(),
            tokens_used,
        })?;
    Ok((text.to_string(), tokens_used))
}

/// Map a non-success status to the error taxonomy.
fn classify_status(status: StatusCode, body: &str, model: &str) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::RateLimited;
    }
    if status == StatusCode::NOT_FOUND
        || (status == StatusCode::BAD_REQUEST && body.to_lowercase().contains("model"))
    {
        return ProviderError::InvalidModel(model.to_string());
    }
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        return ProviderError::Timeout;
    }
    ProviderError::Unknown {
        message: format!("HTTP {status}: {}", body.chars().take(500).collect::<String>()),
        tokens_used: 0,
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, prompt: &str, model_hint: Option<&str>) -> Result<Completion, ProviderError> {
        let model = model_hint.unwrap_or(&self.default_model);
        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Unknown {
                    message: e.to_string(),
                    tokens_used: 0,
                }
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| ProviderError::Unknown {
            message: format!("failed to read response body: {e}"),
            tokens_used: 0,
        })?;
        if !status.is_success() {
            return Err(classify_status(status, &text, model));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| ProviderError::Unknown {
            message: format!("malformed response body: {e}"),
            tokens_used: 0,
        })?;
        let (content, tokens_used) = parse_chat_response(&json)?;
        debug!(provider = %self.name, model, tokens_used, "Chat completion received");

        Ok(Completion {
            text: content,
            tokens_used,
            model: json
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(model)
                .to_string(),
            provider: self.name.clone(),
        })
    }
}
