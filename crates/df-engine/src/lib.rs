//! df-engine: the surface a server or CLI drives.
//!
//! [`Engine`] loads pipelines, runs them against the namespaced cache,
//! optimizes flagged operations, plans partial re-runs and cancels in-flight
//! runs by id. Run history is kept in SQLite under the engine root.

pub mod engine;
pub mod registry;
pub mod telemetry;

pub use engine::{docflow_home, Engine, Optimized, Pipeline, RunOutput};
pub use registry::{RunGuard, RunRegistry};

pub use df_core::pipeline::PipelineConfig;
pub use df_optimizer::{OptimizerError, Rewrite, ShouldOptimize};
pub use df_runner::{ChannelSink, CollectingSink, EngineError, NullSink, ProgressSink, RunPlan};
pub use df_trace::{NamespaceSummary, RunQuery, TraceError};
