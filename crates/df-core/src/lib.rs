//! df-core: Shared types for docflow
//!
//! This crate has zero internal crate dependencies and defines the
//! canonical types used across all other df-* crates.

pub mod pipeline;
pub mod policy;
pub mod record;
pub mod trace;

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::pipeline::{
        DatasetKind, DatasetSpec, OperationSpec, OutputSpec, ParsingStep, PipelineConfig,
        PipelineSection, OptimizerSettings, RetryPolicy, RunSettings, StepOperation, StepSpec,
    };
    pub use crate::policy::{CostLimit, RateLimitSpec};
    pub use crate::record::{Record, Value};
    pub use crate::trace::{ExecutionStatus, NodeReport, ProgressEvent, RunRecord};
}
