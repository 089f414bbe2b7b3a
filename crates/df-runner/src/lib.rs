//! df-runner: Pull-based DAG execution engine with content-addressed caching
//! and partial re-execution.
//!
//! A pipeline config is built into a [`dag::Dag`]; an [`executor::Executor`]
//! then resolves a target node by pulling its dependencies, executing only
//! nodes whose fingerprint is absent from the [`cache::CacheStore`].

pub mod cache;
pub mod context;
pub mod dag;
pub mod dispatch;
pub mod executor;
pub mod fingerprint;
pub mod loader;
pub mod partial;
pub mod progress;
pub mod retry;

pub use cache::{CacheEntry, CacheStats, CacheStore};
pub use context::RunContext;
pub use dag::{Dag, DagNode, NodeId};
pub use executor::{Executor, NodeOutput, NodeStatus};
pub use loader::DatasetLoader;
pub use partial::{PlanEntry, RunPlan};
pub use progress::{ChannelSink, CollectingSink, NullSink, ProgressSink};

use df_ops::{OperationError, RegistryError};
use thiserror::Error;

/// Everything a build or run can fail with.
///
/// `Clone` so a failed node can hand the same error to every puller.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("failed to load dataset '{dataset}': {message}")]
    Load { dataset: String, message: String },

    #[error("parsing transform '{transform}' failed on record {index} of dataset '{dataset}': {message}")]
    ParseTransform {
        dataset: String,
        transform: String,
        index: usize,
        message: String,
    },

    #[error("unknown operation type '{op_type}' (operation '{operation}')")]
    UnknownOperationType { operation: String, op_type: String },

    #[error("invalid config for operation '{operation}' (fields: {}): {message}", .fields.join(", "))]
    InvalidOperationConfig {
        operation: String,
        fields: Vec<String>,
        message: String,
    },

    #[error("cyclic step references: {}", .cycle.join(" -> "))]
    CyclicGraph { cycle: Vec<String> },

    #[error("step '{step}' references unknown step or dataset '{reference}'")]
    UnknownStepReference { step: String, reference: String },

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("node '{node}' failed: {cause}")]
    NodeExecution { node: String, cause: OperationError },

    #[error("cache entry {fingerprint} is unreadable: {message}")]
    CacheCorruption { fingerprint: String, message: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("optimizer left node '{node}' unchanged: {message}")]
    OptimizerDegraded { node: String, message: String },

    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Errors raised while building the DAG, before anything executes.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownOperationType { .. }
                | EngineError::InvalidOperationConfig { .. }
                | EngineError::CyclicGraph { .. }
                | EngineError::UnknownStepReference { .. }
                | EngineError::InvalidPipeline(_)
        )
    }

    /// The node a failure is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            EngineError::NodeExecution { node, .. } | EngineError::OptimizerDegraded { node, .. } => {
                Some(node)
            }
            _ => None,
        }
    }
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownOperationType(op_type) => EngineError::UnknownOperationType {
                operation: String::new(),
                op_type,
            },
            RegistryError::InvalidOperationConfig {
                operation,
                fields,
                message,
            } => EngineError::InvalidOperationConfig {
                operation,
                fields,
                message,
            },
        }
    }
}

impl From<df_core::pipeline::ConfigError> for EngineError {
    fn from(err: df_core::pipeline::ConfigError) -> Self {
        EngineError::InvalidPipeline(err.to_string())
    }
}
