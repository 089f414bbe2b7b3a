//! Pipeline DSL v0.1: declarative description of datasets, operations and steps.
//!
//! The document is a nested mapping (steps → operations → parameters) and is
//! independent of the on-disk format: YAML, JSON or an in-memory
//! `serde_json::Value` all deserialize into the same [`PipelineConfig`].

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{CostLimit, RateLimitSpec};
use crate::record::{Record, Value};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid YAML pipeline config: {0}")]
    Yaml(String),
    #[error("invalid JSON pipeline config: {0}")]
    Json(String),
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// PipelineConfig: top-level document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Human-readable pipeline name.
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// Model used by LLM-backed operations that do not name one.
    #[serde(default)]
    pub default_model: Option<String>,

    /// Named input datasets.
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetSpec>,

    /// Operation definitions, referenced by name from steps.
    #[serde(default)]
    pub operations: Vec<OperationSpec>,

    /// Step wiring and output target.
    pub pipeline: PipelineSection,

    /// Per-run settings.
    #[serde(default)]
    pub settings: RunSettings,
}

fn default_pipeline_name() -> String {
    "pipeline".into()
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        serde_yaml_ng::from_str(text).map_err(|e| ConfigError::Yaml(e.to_string()))
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Json(e.to_string()))
    }

    /// Build from an already-parsed nested mapping.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml_ng::to_string(self).map_err(|e| ConfigError::Yaml(e.to_string()))
    }

    pub fn operation(&self, name: &str) -> Option<&OperationSpec> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.pipeline.steps.iter().find(|s| s.name == name)
    }

    /// Replace `op_name` inside `step_name` with a chain of operations.
    ///
    /// The replacement specs are added to `operations` right where the old
    /// definition was. The old definition is dropped once no step refers to it.
    /// A replacement identical to an existing definition reuses it; one whose
    /// name is taken by a different definition is renamed `<name>_<n>`.
    pub fn replace_operation(
        &mut self,
        step_name: &str,
        op_name: &str,
        replacement: Vec<OperationSpec>,
    ) -> Result<(), ConfigError> {
        if replacement.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "empty replacement for operation '{op_name}'"
            )));
        }
        let step_pos = self
            .pipeline
            .steps
            .iter()
            .position(|s| s.name == step_name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown step '{step_name}'")))?;
        let pos = self.pipeline.steps[step_pos]
            .operations
            .iter()
            .position(|o| o.name() == op_name)
            .ok_or_else(|| {
                ConfigError::Invalid(format!("step '{step_name}' has no operation '{op_name}'"))
            })?;
        if !matches!(self.pipeline.steps[step_pos].operations[pos], StepOperation::Name(_)) {
            return Err(ConfigError::Invalid(format!(
                "operation '{op_name}' has named inputs and cannot be rewritten into a chain"
            )));
        }

        let mut taken: HashSet<String> = self.operations.iter().map(|o| o.name.clone()).collect();
        let mut names = Vec::with_capacity(replacement.len());
        let mut fresh = Vec::new();
        for mut op in replacement {
            if self.operation(&op.name) == Some(&op) {
                names.push(StepOperation::Name(op.name));
                continue;
            }
            if taken.contains(&op.name) {
                let base = op.name.clone();
                let renamed = (2..).map(|n| format!("{base}_{n}")).find(|n| !taken.contains(n));
                op.name = renamed.unwrap_or(base);
            }
            taken.insert(op.name.clone());
            names.push(StepOperation::Name(op.name.clone()));
            fresh.push(op);
        }
        self.pipeline.steps[step_pos].operations.splice(pos..=pos, names);

        let def_pos = self.operations.iter().position(|op| op.name == op_name);
        let still_used = self
            .pipeline
            .steps
            .iter()
            .any(|s| s.operations.iter().any(|o| o.name() == op_name));
        match def_pos {
            Some(p) if !still_used => {
                self.operations.splice(p..=p, fresh);
            }
            Some(p) => {
                self.operations.splice(p + 1..p + 1, fresh);
            }
            None => self.operations.extend(fresh),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSpec {
    #[serde(rename = "type")]
    pub kind: DatasetKind,

    /// File path for `file` datasets (JSON array or JSON lines).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Inline records for `memory` datasets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<Record>>,

    /// Parsing transforms applied in order to every loaded record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parsing: Vec<ParsingStep>,

    /// Explicit version tag; mixed into the dataset fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl DatasetSpec {
    pub fn memory(records: Vec<Record>) -> Self {
        Self {
            kind: DatasetKind::Memory,
            path: None,
            records: Some(records),
            parsing: Vec::new(),
            version: None,
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: DatasetKind::File,
            path: Some(path.into()),
            records: None,
            parsing: Vec::new(),
            version: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsingStep {
    /// Registered transform name (e.g. "split_lines").
    pub function: String,

    /// Transform-specific arguments (`input_key`, `output_key`, ...).
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Immutable configuration for one pipeline operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationSpec {
    /// Stable name used for addressing and caching.
    pub name: String,

    /// Type tag selecting the registered implementation.
    #[serde(rename = "type")]
    pub op_type: String,

    /// Whether the optimizer may rewrite this operation.
    #[serde(default, skip_serializing_if = "is_false")]
    pub optimize: bool,

    /// Operation-specific parameters (prompt, output schema, model, hints...).
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl OperationSpec {
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            optimize: false,
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    pub steps: Vec<StepSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,

    /// Dataset name or earlier step name feeding the first operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    pub operations: Vec<StepOperation>,
}

/// An operation reference inside a step.
///
/// Either a bare operation name, or `{op_name: {role: step_name, ...}}` for
/// operations that read several named upstreams (e.g. equijoin).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged, try_from = "RawStepOperation")]
pub enum StepOperation {
    Name(String),
    WithInputs(BTreeMap<String, BTreeMap<String, String>>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStepOperation {
    Name(String),
    WithInputs(BTreeMap<String, BTreeMap<String, String>>),
}

impl TryFrom<RawStepOperation> for StepOperation {
    type Error = String;

    fn try_from(raw: RawStepOperation) -> Result<Self, Self::Error> {
        match raw {
            RawStepOperation::Name(name) => Ok(StepOperation::Name(name)),
            RawStepOperation::WithInputs(m) if m.len() == 1 => Ok(StepOperation::WithInputs(m)),
            RawStepOperation::WithInputs(m) => Err(format!(
                "operation reference must name exactly one operation, found {}",
                m.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
            )),
        }
    }
}

impl StepOperation {
    pub fn name(&self) -> &str {
        match self {
            StepOperation::Name(n) => n,
            StepOperation::WithInputs(m) => m.keys().next().map(String::as_str).unwrap_or(""),
        }
    }

    /// Named upstream references as (role, step name) pairs.
    pub fn inputs(&self) -> Vec<(&str, &str)> {
        match self {
            StepOperation::Name(_) => Vec::new(),
            StepOperation::WithInputs(m) => m
                .values()
                .next()
                .map(|roles| {
                    roles
                        .iter()
                        .map(|(role, step)| (role.as_str(), step.as_str()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(rename = "type", default = "default_output_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_dir: Option<String>,
}

fn default_output_kind() -> String {
    "file".into()
}

// ---------------------------------------------------------------------------
// Run settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Logical workspace; selects the cache namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Truncate every dataset to this many records.
    #[serde(default)]
    pub sample_size: Option<usize>,

    /// Operation name → model override.
    #[serde(default)]
    pub model_overrides: BTreeMap<String, String>,

    /// Resource class (`llm_call`, `llm_tokens`) → limit.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitSpec>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Upper bound on concurrent per-record calls inside one node.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Deadline for a single LLM call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default)]
    pub cost_limit: Option<CostLimit>,

    #[serde(default)]
    pub optimizer: OptimizerSettings,
}

fn default_namespace() -> String {
    "default".into()
}

fn default_max_concurrency() -> usize {
    8
}

fn default_call_timeout_ms() -> u64 {
    120_000
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            sample_size: None,
            model_overrides: BTreeMap::new(),
            rate_limits: BTreeMap::new(),
            retry: RetryPolicy::default(),
            max_concurrency: default_max_concurrency(),
            call_timeout_ms: default_call_timeout_ms(),
            cost_limit: None,
            optimizer: OptimizerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Records sampled from a node's input when evaluating candidates.
    #[serde(default = "default_optimizer_sample")]
    pub sample_size: usize,

    /// A candidate must beat the original score by at least this much.
    #[serde(default = "default_margin")]
    pub acceptance_margin: f64,

    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Model proposing rewrites.
    #[serde(default)]
    pub rewrite_model: Option<String>,

    /// Model grading candidate outputs.
    #[serde(default)]
    pub judge_model: Option<String>,
}

fn default_optimizer_sample() -> usize {
    5
}

fn default_margin() -> f64 {
    0.05
}

fn default_max_candidates() -> usize {
    3
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            sample_size: default_optimizer_sample(),
            acceptance_margin: default_margin(),
            max_candidates: default_max_candidates(),
            rewrite_model: None,
            judge_model: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_backoff() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
