//! Budget status thresholds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Health of a budget, derived purely from its consumption ratio.
///
/// | ratio        | status      |
/// |--------------|-------------|
/// | `< 0.80`     | `ACTIVE`    |
/// | `0.80..0.90` | `WARNING`   |
/// | `0.90..1.00` | `CRITICAL`  |
/// | `>= 1.00`    | `EXHAUSTED` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetStatus {
    Active,
    Warning,
    Critical,
    Exhausted,
}

impl BudgetStatus {
    /// Classify a ratio of used to allowed tokens.
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 1.0 {
            BudgetStatus::Exhausted
        } else if percentage >= 0.9 {
            BudgetStatus::Critical
        } else if percentage >= 0.8 {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Active
        }
    }

    /// Classify exact token counts. Integer comparison keeps the boundaries
    /// exact; a zero limit is already exhausted.
    pub fn classify(tokens_used: u64, token_limit: u64) -> Self {
        if token_limit == 0 {
            return BudgetStatus::Exhausted;
        }
        let used = tokens_used as u128 * 100;
        let limit = token_limit as u128;
        if used >= limit * 100 {
            BudgetStatus::Exhausted
        } else if used >= limit * 90 {
            BudgetStatus::Critical
        } else if used >= limit * 80 {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetStatus::Active => "ACTIVE",
            BudgetStatus::Warning => "WARNING",
            BudgetStatus::Critical => "CRITICAL",
            BudgetStatus::Exhausted => "EXHAUSTED",
        }
    }
}

impl fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `tokens_used / token_limit`; a zero limit reads as fully consumed.
pub(crate) fn percentage(tokens_used: u64, token_limit: u64) -> f64 {
    if token_limit == 0 {
        1.0
    } else {
        tokens_used as f64 / token_limit as f64
    }
}
