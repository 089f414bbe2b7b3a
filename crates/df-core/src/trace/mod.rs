//! Trace types: per-node reports, run records and progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    CacheHit,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::CacheHit => "cache_hit",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ExecutionStatus::Pending,
            "running" => ExecutionStatus::Running,
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            "cache_hit" => ExecutionStatus::CacheHit,
            "cancelled" => ExecutionStatus::Cancelled,
            _ => return None,
        })
    }

    /// Whether the node produced a usable output.
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::CacheHit)
    }
}

// ---------------------------------------------------------------------------
// NodeReport: one row per node touched by a run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    /// Node name (`step/operation`).
    pub node: String,

    /// Operation type tag.
    pub op_type: String,

    pub status: ExecutionStatus,

    /// Content address of the node's output, when computed.
    #[serde(default)]
    pub fingerprint: Option<String>,

    pub records_out: usize,

    /// LLM spend attributed to this node (zero on cache hits).
    pub cost_usd: f64,

    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub duration_ms: Option<i64>,

    #[serde(default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Run-level record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub namespace: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub total_nodes: u32,
    pub completed_nodes: u32,
    pub failed_nodes: u32,
    pub cache_hits: u32,
    pub total_cost_usd: f64,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn started(run_id: Uuid, pipeline_name: &str, namespace: &str) -> Self {
        Self {
            run_id,
            pipeline_name: pipeline_name.to_string(),
            namespace: namespace.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            total_nodes: 0,
            completed_nodes: 0,
            failed_nodes: 0,
            cache_hits: 0,
            total_cost_usd: 0.0,
            error: None,
        }
    }

    /// Fold node reports into the counters and close the record.
    pub fn finish(&mut self, status: ExecutionStatus, nodes: &[NodeReport], total_cost_usd: f64) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.total_nodes = nodes.len() as u32;
        self.completed_nodes = nodes.iter().filter(|n| n.status.is_success()).count() as u32;
        self.failed_nodes = nodes
            .iter()
            .filter(|n| n.status == ExecutionStatus::Failed)
            .count() as u32;
        self.cache_hits = nodes
            .iter()
            .filter(|n| n.status == ExecutionStatus::CacheHit)
            .count() as u32;
        self.total_cost_usd = total_cost_usd;
    }
}

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// Event pushed to a progress sink while a run or optimization is in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: Uuid,
    },
    NodeStarted {
        node: String,
    },
    /// Batch progress for operations executed in chunks.
    NodeProgress {
        node: String,
        done: usize,
        total: usize,
    },
    NodeFinished {
        node: String,
        status: ExecutionStatus,
        records: usize,
        cache_hit: bool,
    },
    CostUpdated {
        total_usd: f64,
    },
    OptimizerProgress {
        node: String,
        status: String,
        progress: f64,
        #[serde(default)]
        rationale: Option<String>,
        #[serde(default)]
        should_optimize: Option<bool>,
        #[serde(default)]
        validator_prompt: Option<String>,
    },
    Warning {
        message: String,
    },
    RunFinished {
        run_id: Uuid,
        status: ExecutionStatus,
        total_cost_usd: f64,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn report(node: &str, status: ExecutionStatus) -> NodeReport {
        NodeReport {
            node: node.into(),
            op_type: "map".into(),
            status,
            fingerprint: None,
            records_out: 3,
            cost_usd: 0.0,
            started_at: Utc::now(),
            duration_ms: Some(5),
            error: None,
        }
    }

    #[test]
    fn finish_counts_node_outcomes() {
        let mut run = RunRecord::started(Uuid::new_v4(), "p", "default");
        let nodes = vec![
            report("a/x", ExecutionStatus::Completed),
            report("a/y", ExecutionStatus::CacheHit),
            report("b/z", ExecutionStatus::Failed),
        ];
        run.finish(ExecutionStatus::Failed, &nodes, 0.25);
        assert_eq!(run.total_nodes, 3);
        assert_eq!(run.completed_nodes, 2);
        assert_eq!(run.failed_nodes, 1);
        assert_eq!(run.cache_hits, 1);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn progress_event_is_tagged() {
        let ev = ProgressEvent::NodeStarted { node: "s/op".into() };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "node_started");
        assert_eq!(json["node"], "s/op");
    }

    #[test]
    fn status_string_round_trip() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::CacheHit,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(ExecutionStatus::parse(s.as_str()), Some(s));
        }
    }
}
