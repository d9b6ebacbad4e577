//! Admission control for incoming questions
//!
//! The governor owns both limiters for the life of the process and is
//! consulted once per question, before any backend call.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::budget::TokenBudget;
use super::rate_limit::{RateLimitError, SlidingWindowLimiter};
use crate::metrics::{GOVERNOR_DENIALS, TOKENS_BUDGET_USED};

/// Governor limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Requests admitted per user in any trailing window
    pub requests_per_window: usize,
    /// Window length in seconds
    pub window_secs: u64,
    /// Tokens per UTC day across all users
    pub daily_token_budget: u64,
    /// Deny new questions once the daily budget is spent (otherwise warn only)
    pub enforce_daily_budget: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 10,
            window_secs: 60,
            daily_token_budget: 2_000_000,
            enforce_daily_budget: false,
        }
    }
}

/// Why a question was turned away
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error("Daily token budget exhausted ({used}/{limit} tokens used today)")]
    DailyBudget { used: u64, limit: u64 },
}

impl Denial {
    pub fn kind(&self) -> &'static str {
        match self {
            Denial::RateLimited(_) => "rate_limited",
            Denial::DailyBudget { .. } => "daily_budget",
        }
    }
}

/// Per-user rate limit plus daily token budget
pub struct Governor {
    limiter: SlidingWindowLimiter,
    budget: TokenBudget,
    enforce_budget: bool,
}

impl Governor {
    pub fn new(config: &GovernorConfig) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(
                config.requests_per_window,
                Duration::from_secs(config.window_secs),
            ),
            budget: TokenBudget::new(config.daily_token_budget),
            enforce_budget: config.enforce_daily_budget,
        }
    }

    /// Admit one question from `user_id`, recording it on success
    pub fn admit(&self, user_id: &str) -> Result<(), Denial> {
        if self.budget.is_exhausted() {
            let used = self.budget.used_today();
            let limit = self.budget.limit();
            if self.enforce_budget {
                GOVERNOR_DENIALS.with_label_values(&["daily_budget"]).inc();
                warn!(user = user_id, used, limit, "Daily token budget exhausted, denying");
                return Err(Denial::DailyBudget { used, limit });
            }
            warn!(user = user_id, used, limit, "Daily token budget exhausted (advisory)");
        }

        if !self.limiter.check_and_record(user_id) {
            GOVERNOR_DENIALS.with_label_values(&["rate_limited"]).inc();
            let retry_after = self.limiter.retry_after(user_id);
            info!(user = user_id, ?retry_after, "Rate limited");
            return Err(Denial::RateLimited(RateLimitError {
                limit: self.limiter.limit(),
                window: self.limiter.window(),
                retry_after,
            }));
        }
        Ok(())
    }

    /// Add a finished turn's tokens to today's total
    pub fn record_usage(&self, tokens: u64) -> u64 {
        let total = self.budget.record(tokens);
        TOKENS_BUDGET_USED.set(total as i64);
        total
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    /// Clear all per-user windows and today's usage
    pub fn reset(&self) {
        self.limiter.reset();
        self.budget.reset();
    }
}
