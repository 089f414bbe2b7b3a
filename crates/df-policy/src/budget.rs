//! Cost ledger: run-scoped token/cost accounting checked against a budget.

use crate::PolicyError;
use df_core::policy::CostLimit;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Money is tracked in nano-dollars so per-node sums equal the run total exactly.
const NANOS_PER_USD: f64 = 1_000_000_000.0;

fn to_nanos(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * NANOS_PER_USD).round() as u64
    } else {
        0
    }
}

fn to_usd(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_USD
}

/// Accumulated spend for one node.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct NodeCost {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Default)]
struct NodeTally {
    calls: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    nanos: u64,
}

/// Concurrency-safe accumulator shared by every node of a run.
#[derive(Debug)]
pub struct CostLedger {
    limit: CostLimit,
    started: Instant,
    spent_nanos: AtomicU64,
    spent_tokens: AtomicU64,
    calls: AtomicU64,
    per_node: Mutex<HashMap<String, NodeTally>>,
}

impl Default for CostLedger {
    fn default() -> Self {
        Self::new(CostLimit::default())
    }
}

impl CostLedger {
    pub fn new(limit: CostLimit) -> Self {
        Self {
            limit,
            started: Instant::now(),
            spent_nanos: AtomicU64::new(0),
            spent_tokens: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            per_node: Mutex::new(HashMap::new()),
        }
    }

    /// Refuse new work once any ceiling has been reached.
    pub fn check(&self) -> Result<(), PolicyError> {
        if let Some(max) = self.limit.max_cost_usd {
            let spent = self.total_cost_usd();
            if spent >= max {
                return Err(PolicyError::BudgetExceeded(format!(
                    "cost ${spent:.6} reached limit ${max:.6}"
                )));
            }
        }
        if let Some(max) = self.limit.max_tokens {
            let spent = self.total_tokens();
            if spent >= max {
                return Err(PolicyError::BudgetExceeded(format!(
                    "token usage {spent} reached limit {max}"
                )));
            }
        }
        if let Some(max) = self.limit.max_execution_time_secs {
            let elapsed = self.started.elapsed().as_secs();
            if elapsed >= max {
                return Err(PolicyError::BudgetExceeded(format!(
                    "execution time {elapsed}s reached limit {max}s"
                )));
            }
        }
        Ok(())
    }

    /// Record one completed call. The spend is always booked; the result
    /// reports whether the run went over budget with it.
    pub fn record(
        &self,
        node: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost_usd: f64,
    ) -> Result<(), PolicyError> {
        let nanos = to_nanos(cost_usd);
        let tokens = prompt_tokens + completion_tokens;
        let total_nanos = self.spent_nanos.fetch_add(nanos, Ordering::Relaxed) + nanos;
        let total_tokens = self.spent_tokens.fetch_add(tokens, Ordering::Relaxed) + tokens;
        self.calls.fetch_add(1, Ordering::Relaxed);

        {
            let mut map = self
                .per_node
                .lock()
                .map_err(|_| PolicyError::LockPoisoned("cost ledger".into()))?;
            let tally = map.entry(node.to_string()).or_default();
            tally.calls += 1;
            tally.prompt_tokens += prompt_tokens;
            tally.completion_tokens += completion_tokens;
            tally.nanos += nanos;
        }

        if let Some(max) = self.limit.max_cost_usd {
            let total = to_usd(total_nanos);
            if total > max {
                return Err(PolicyError::BudgetExceeded(format!(
                    "cost ${total:.6} exceeds limit ${max:.6}"
                )));
            }
        }
        if let Some(max) = self.limit.max_tokens {
            if total_tokens > max {
                return Err(PolicyError::BudgetExceeded(format!(
                    "token usage {total_tokens} exceeds limit {max}"
                )));
            }
        }
        Ok(())
    }

    pub fn total_cost_usd(&self) -> f64 {
        to_usd(self.spent_nanos.load(Ordering::Relaxed))
    }

    pub fn total_tokens(&self) -> u64 {
        self.spent_tokens.load(Ordering::Relaxed)
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Spend attributed to one node (zero if it made no calls).
    pub fn node_cost(&self, node: &str) -> NodeCost {
        self.per_node
            .lock()
            .ok()
            .and_then(|map| map.get(node).map(tally_to_cost))
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<String, NodeCost> {
        self.per_node
            .lock()
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), tally_to_cost(v)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn tally_to_cost(t: &NodeTally) -> NodeCost {
    NodeCost {
        calls: t.calls,
        prompt_tokens: t.prompt_tokens,
        completion_tokens: t.completion_tokens,
        cost_usd: to_usd(t.nanos),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn per_node_costs_sum_to_total() {
        let ledger = CostLedger::default();
        ledger.record("a/map", 100, 20, 0.0012).unwrap();
        ledger.record("a/map", 50, 10, 0.0006).unwrap();
        ledger.record("b/filter", 10, 1, 0.0001).unwrap();

        let snap = ledger.snapshot();
        let sum_nanos: u64 = snap.values().map(|c| to_nanos(c.cost_usd)).sum();
        assert_eq!(sum_nanos, to_nanos(ledger.total_cost_usd()));
        assert_eq!(ledger.node_cost("a/map").calls, 2);
        assert_eq!(ledger.total_tokens(), 191);
        assert_eq!(ledger.node_cost("missing"), NodeCost::default());
    }

    #[test]
    fn cost_limit_trips_on_record_and_check() {
        let ledger = CostLedger::new(CostLimit {
            max_cost_usd: Some(0.01),
            ..Default::default()
        });
        assert!(ledger.check().is_ok());
        assert!(ledger.record("n", 1, 1, 0.004).is_ok());
        let err = ledger.record("n", 1, 1, 0.008).unwrap_err();
        assert!(matches!(err, PolicyError::BudgetExceeded(_)));
        assert!(ledger.check().is_err());
    }

    #[test]
    fn token_limit() {
        let ledger = CostLedger::new(CostLimit {
            max_tokens: Some(100),
            ..Default::default()
        });
        assert!(ledger.record("n", 60, 30, 0.0).is_ok());
        assert!(ledger.record("n", 10, 5, 0.0).is_err());
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let ledger = Arc::new(CostLedger::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        ledger.record(&format!("node{}", i % 2), 1, 1, 0.001).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.total_calls(), 800);
        assert!((ledger.total_cost_usd() - 0.8).abs() < 1e-9);
    }
}
