//! Policy types: cost ceilings and rate limits attached to a run.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Cost limit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CostLimit {
    /// Maximum wall-clock time for the entire run (seconds).
    #[serde(default)]
    pub max_execution_time_secs: Option<u64>,

    /// Maximum monetary cost in USD across all LLM calls.
    #[serde(default)]
    pub max_cost_usd: Option<f64>,

    /// Maximum total tokens consumed.
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

// ---------------------------------------------------------------------------
// Rate limit
// ---------------------------------------------------------------------------

/// At most `count` admissions per `per_ms` window, and at most `count`
/// in flight at once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitSpec {
    pub count: u32,
    #[serde(default = "default_period_ms")]
    pub per_ms: u64,
}

fn default_period_ms() -> u64 {
    60_000
}

impl RateLimitSpec {
    pub fn new(count: u32, period: Duration) -> Self {
        Self {
            count,
            per_ms: period.as_millis() as u64,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.per_ms)
    }
}

/// Resource class names understood by the limiter.
pub mod resource {
    pub const LLM_CALL: &str = "llm_call";
    pub const LLM_TOKENS: &str = "llm_tokens";
}
