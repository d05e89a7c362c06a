//! Deterministic provider for local runs and tests.
//!
//! Without rules it echoes a short summary of the prompt. Rules match on a
//! prompt substring: [`ScriptedProvider::on`] answers every match the same
//! way, [`ScriptedProvider::script`] plays a queue of behaviors once and then
//! falls through.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Completion, Provider, ProviderError};

const DEFAULT_MODEL: &str = "scripted-1";

#[derive(Debug, Clone)]
pub enum Behavior {
    Reply { text: String, tokens: u64 },
    /// Reply after a delay.
    SlowReply {
        text: String,
        tokens: u64,
        delay: Duration,
    },
    Fail(ProviderError),
    /// Sleep, then time out. Longer than the gateway timeout means the
    /// gateway gives up first.
    Hang(Duration),
}

impl Behavior {
    pub fn reply(text: impl Into<String>, tokens: u64) -> Self {
        Behavior::Reply {
            text: text.into(),
            tokens,
        }
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    queue: Mutex<VecDeque<Behavior>>,
    always: Option<Behavior>,
}

#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    rules: Vec<Rule>,
    calls: AtomicU64,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
            calls: AtomicU64::new(0),
        }
    }

    /// Every prompt containing `pattern` gets `behavior`.
    pub fn on(mut self, pattern: impl Into<String>, behavior: Behavior) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            queue: Mutex::new(VecDeque::new()),
            always: Some(behavior),
        });
        self
    }

    /// Prompts containing `pattern` get `behaviors` in order, once each.
    pub fn script(mut self, pattern: impl Into<String>, behaviors: Vec<Behavior>) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            queue: Mutex::new(behaviors.into()),
            always: None,
        });
        self
    }

    /// Calls received so far, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_behavior(&self, prompt: &str) -> Option<Behavior> {
        for rule in &self.rules {
            if !prompt.contains(&rule.pattern) {
                continue;
            }
            if let Some(next) = rule.queue.lock().pop_front() {
                return Some(next);
            }
            if let Some(always) = &rule.always {
                return Some(always.clone());
            }
        }
        None
    }

    fn echo(&self, prompt: &str) -> Behavior {
        let words: Vec<&str> = prompt.split_whitespace().collect();
        let preview = words.iter().take(12).copied().collect::<Vec<_>>().join(" ");
        let text = format!("[{}] {}", self.name, preview);
        let tokens = (words.len() + text.split_whitespace().count()).max(1) as u64;
        Behavior::Reply { text, tokens }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, prompt: &str, model_hint: Option<&str>) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .next_behavior(prompt)
            .unwrap_or_else(|| self.echo(prompt));

        match behavior {
            Behavior::Reply { text, tokens } => Ok(Completion {
                text,
                tokens_used: tokens,
                model: model_hint.unwrap_or(DEFAULT_MODEL).to_string(),
                provider: self.name.clone(),
            }),
            Behavior::SlowReply { text, tokens, delay } => {
                tokio::time::sleep(delay).await;
                Ok(Completion {
                    text,
                    tokens_used: tokens,
                    model: model_hint.unwrap_or(DEFAULT_MODEL).to_string(),
                    provider: self.name.clone(),
                })
            }
            Behavior::Fail(e) => Err(e),
            Behavior::Hang(d) => {
                tokio::time::sleep(d).await;
                Err(ProviderError::Timeout)
            }
        }
    }
}
