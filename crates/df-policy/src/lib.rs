//! df-policy: run policies. A cost ledger with budget limits and per-resource rate limiting.

pub mod budget;
pub mod ratelimit;

pub use budget::{CostLedger, NodeCost};
pub use ratelimit::{RateLimiter, RatePermit};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("rate limiter closed for resource '{0}'")]
    LimiterClosed(String),
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}
