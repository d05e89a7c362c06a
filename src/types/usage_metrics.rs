//! Provider usage counters for a single task run.

use serde::{Deserialize, Serialize};

/// Track provider usage across the steps of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    /// Total number of tokens consumed, including failed calls that billed.
    pub total_tokens: u64,
    /// Number of provider calls that returned a completion.
    pub successful_requests: u64,
    /// Number of provider calls that ended in an error.
    pub failed_requests: u64,
    /// Attempts beyond the first, summed over all calls.
    pub retried_attempts: u64,
}

impl UsageMetrics {
    /// Create a new empty UsageMetrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add usage metrics from another UsageMetrics object.
    pub fn add_usage_metrics(&mut self, other: &UsageMetrics) {
        self.total_tokens += other.total_tokens;
        self.successful_requests += other.successful_requests;
        self.failed_requests += other.failed_requests;
        self.retried_attempts += other.retried_attempts;
    }

    /// Record the outcome of one gateway call.
    pub fn record_call(&mut self, tokens: u64, attempts: u32, succeeded: bool) {
        self.total_tokens += tokens;
        self.retried_attempts += u64::from(attempts.saturating_sub(1));
        if succeeded {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
    }
}
