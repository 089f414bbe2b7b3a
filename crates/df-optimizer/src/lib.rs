//! df-optimizer: rewrites operations flagged `optimize: true`.
//!
//! Per flagged node, bottom-up: sample its input → score the original on the
//! sample → propose candidate chains → score each → splice in the winner if it
//! beats the original by the acceptance margin. A node that fails anywhere in
//! this loop is left unchanged and reported as a warning.

pub mod acceptance;
pub mod rewrite;
pub mod sampler;
pub mod validator;

pub use rewrite::Candidate;
pub use validator::{Assessment, HeuristicValidator, LlmJudge, Score, Validator};

use df_core::pipeline::{OperationSpec, OptimizerSettings, PipelineConfig};
use df_core::record::Record;
use df_core::trace::ProgressEvent;
use df_ops::{OpContext, OperationError, OperationInput, OperationRegistry};
use df_runner::{CacheStore, Dag, DatasetLoader, EngineError, Executor, RunContext};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error(transparent)]
    Pipeline(#[from] EngineError),
    #[error("step '{step}' has no operation '{operation}'")]
    UnknownTarget { step: String, operation: String },
    #[error("node '{node}' cannot be optimized: {reason}")]
    Unsupported { node: String, reason: String },
    #[error("sampled input of '{0}' is empty")]
    EmptySample(String),
    #[error("operation failed on sample: {0}")]
    Operation(#[from] OperationError),
    #[error("rewrite rejected: {0}")]
    Rewrite(String),
    #[error("optimization cancelled")]
    Cancelled,
}

impl OptimizerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            OptimizerError::Cancelled
                | OptimizerError::Pipeline(EngineError::Cancelled)
                | OptimizerError::Operation(OperationError::Cancelled)
        )
    }
}

/// One accepted rewrite.
#[derive(Debug, Clone, Serialize)]
pub struct Rewrite {
    pub node: String,
    pub candidate: String,
    pub replaced_with: Vec<String>,
    pub original_score: f64,
    pub winning_score: f64,
    pub rationale: String,
}

/// Result of [`Optimizer::optimize`].
#[derive(Debug, Clone)]
pub struct OptimizeOutcome {
    pub config: PipelineConfig,
    pub rewrites: Vec<Rewrite>,
    /// `OptimizerDegraded` for every node left unchanged after a failure.
    pub warnings: Vec<EngineError>,
    pub cost_usd: f64,
}

/// Result of [`Optimizer::should_optimize`].
#[derive(Debug, Clone, Serialize)]
pub struct ShouldOptimize {
    pub node: String,
    pub should_optimize: bool,
    pub rationale: String,
    pub input_sample: Vec<Record>,
    pub output_sample: Vec<Record>,
    pub cost_usd: f64,
}

#[derive(Debug)]
pub struct Optimizer {
    registry: Arc<OperationRegistry>,
    loader: DatasetLoader,
    cache: Arc<CacheStore>,
    run: RunContext,
    settings: OptimizerSettings,
    validator: Arc<dyn Validator>,
}

impl Optimizer {
    /// Uses the model judge when a judge model and a client are configured,
    /// the completeness heuristic otherwise.
    pub fn new(
        registry: Arc<OperationRegistry>,
        cache: Arc<CacheStore>,
        run: RunContext,
        settings: OptimizerSettings,
    ) -> Self {
        let validator: Arc<dyn Validator> = match (&settings.judge_model, &run.llm) {
            (Some(model), Some(_)) => Arc::new(LlmJudge::new(model.clone())),
            _ => Arc::new(HeuristicValidator),
        };
        Self {
            registry,
            loader: DatasetLoader::new(),
            cache,
            run,
            settings,
            validator,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_loader(mut self, loader: DatasetLoader) -> Self {
        self.loader = loader;
        self
    }

    /// Optimize every flagged node of `config`, upstream nodes first.
    ///
    /// Only an invalid pipeline or cancellation fails the call; per-node
    /// failures become warnings.
    pub async fn optimize(&self, config: &PipelineConfig) -> Result<OptimizeOutcome, OptimizerError> {
        let cost_before = self.run.ledger.total_cost_usd();
        let dag = Dag::build(config, &self.registry)?;
        let targets: Vec<(String, String)> = dag
            .nodes()
            .iter()
            .filter(|n| n.spec.optimize)
            .filter_map(|n| Some((n.step.clone()?, n.spec.name.clone())))
            .collect();
        tracing::info!(pipeline = %config.name, targets = targets.len(), "optimizing pipeline");

        let mut current = config.clone();
        let mut rewrites = Vec::new();
        let mut warnings = Vec::new();
        let total = targets.len();
        for (i, (step, op)) in targets.iter().enumerate() {
            if self.run.is_cancelled() {
                return Err(OptimizerError::Cancelled);
            }
            let node = format!("{step}/{op}");
            let progress = Progress { node: &node, index: i, total };
            match self.optimize_node(&current, step, op, &progress).await {
                Ok(Some((rewrite, ops))) => {
                    match current.replace_operation(step, op, ops) {
                        Ok(()) => rewrites.push(rewrite),
                        Err(err) => warnings.push(self.degrade(&progress, err.to_string())),
                    }
                }
                Ok(None) => {}
                Err(err) if err.is_cancelled() => return Err(OptimizerError::Cancelled),
                Err(err) => warnings.push(self.degrade(&progress, err.to_string())),
            }
        }

        Ok(OptimizeOutcome {
            config: current,
            rewrites,
            warnings,
            cost_usd: self.run.ledger.total_cost_usd() - cost_before,
        })
    }

    /// Run `(step, operation)` on a sample and ask the validator whether it
    /// is worth optimizing.
    pub async fn should_optimize(
        &self,
        config: &PipelineConfig,
        step: &str,
        operation: &str,
    ) -> Result<ShouldOptimize, OptimizerError> {
        let cost_before = self.run.ledger.total_cost_usd();
        let node = format!("{step}/{operation}");
        let progress = Progress { node: &node, index: 0, total: 1 };
        let (spec, input) = self.prepare(config, step, operation, &progress).await?;
        let ctx = self.op_context(&node);

        let output = run_chain(&self.registry, std::slice::from_ref(&spec), input.clone(), &ctx).await?;
        progress.emit(&self.run, "assessing", 0.75, None);
        let verdict = self.validator.assess(&spec, &input, &output, &ctx).await?;

        self.run.emit(ProgressEvent::OptimizerProgress {
            node: node.clone(),
            status: "assessed".into(),
            progress: 1.0,
            rationale: Some(verdict.rationale.clone()),
            should_optimize: Some(verdict.should_optimize),
            validator_prompt: verdict.validator_prompt.clone(),
        });
        Ok(ShouldOptimize {
            node,
            should_optimize: verdict.should_optimize,
            rationale: verdict.rationale,
            input_sample: input,
            output_sample: output,
            cost_usd: self.run.ledger.total_cost_usd() - cost_before,
        })
    }

    /// Resolve the node, sample its input and return its effective spec.
    async fn prepare(
        &self,
        config: &PipelineConfig,
        step: &str,
        operation: &str,
        progress: &Progress<'_>,
    ) -> Result<(OperationSpec, Vec<Record>), OptimizerError> {
        let dag = Arc::new(Dag::build(config, &self.registry)?);
        let id = dag
            .find(progress.node)
            .ok_or_else(|| OptimizerError::UnknownTarget {
                step: step.to_string(),
                operation: operation.to_string(),
            })?;
        let node = dag.node(id);
        if !node.op.input_roles().is_empty() {
            return Err(OptimizerError::Unsupported {
                node: node.name.clone(),
                reason: "operations with named inputs are not rewritten".into(),
            });
        }
        let spec = node.spec.clone();

        progress.emit(&self.run, "sampling", 0.0, None);
        let sampled = sampler::sampled_config(config, self.settings.sample_size);
        let executor = Executor::new(
            Arc::clone(&dag),
            &sampled,
            self.loader.clone(),
            Arc::clone(&self.cache),
            self.run.clone(),
        );
        let input = sampler::sample_input(&executor, id, self.settings.sample_size).await?;
        Ok((spec, input))
    }

    async fn optimize_node(
        &self,
        config: &PipelineConfig,
        step: &str,
        operation: &str,
        progress: &Progress<'_>,
    ) -> Result<Option<(Rewrite, Vec<OperationSpec>)>, OptimizerError> {
        let (spec, input) = self.prepare(config, step, operation, progress).await?;
        let ctx = self.op_context(progress.node);

        progress.emit(&self.run, "scoring original", 0.25, None);
        let original = match run_chain(&self.registry, std::slice::from_ref(&spec), input.clone(), &ctx).await {
            Ok(output) => self.validator.score(&spec, &input, &output, &ctx).await?,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => Score {
                value: 0.0,
                rationale: format!("original failed on sample: {err}"),
            },
        };

        progress.emit(&self.run, "generating candidates", 0.5, Some(original.rationale.clone()));
        let rewrite_model = self
            .settings
            .rewrite_model
            .as_deref()
            .filter(|_| self.run.llm.is_some());
        let candidates = rewrite::candidates(
            &spec,
            &input,
            rewrite_model,
            &ctx,
            &self.registry,
            self.settings.max_candidates,
        )
        .await?;

        let mut scores = Vec::with_capacity(candidates.len());
        for (j, candidate) in candidates.iter().enumerate() {
            let fraction = 0.5 + 0.5 * (j as f64 / candidates.len().max(1) as f64);
            progress.emit(&self.run, &format!("evaluating {}", candidate.label), fraction, None);
            match run_chain(&self.registry, &candidate.ops, input.clone(), &ctx).await {
                Ok(output) => {
                    let score = self.validator.score(&spec, &input, &output, &ctx).await?;
                    tracing::debug!(node = progress.node, candidate = %candidate.label, score = score.value, "candidate scored");
                    scores.push(Some(score.value));
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    tracing::warn!(node = progress.node, candidate = %candidate.label, error = %err, "candidate failed on sample");
                    scores.push(None);
                }
            }
        }

        let Some(winner) = acceptance::pick_winner(original.value, &scores, self.settings.acceptance_margin) else {
            let rationale = format!(
                "kept original (score {:.2}); no candidate beat it by {:.2}",
                original.value, self.settings.acceptance_margin
            );
            progress.emit(&self.run, "unchanged", 1.0, Some(rationale));
            return Ok(None);
        };

        let candidate = &candidates[winner];
        let winning_score = scores[winner].unwrap_or_default();
        let rationale = format!(
            "{} scored {:.2} against {:.2}: {}",
            candidate.label, winning_score, original.value, candidate.rationale
        );
        tracing::info!(node = progress.node, candidate = %candidate.label, winning_score, original = original.value, "rewrite accepted");
        progress.emit(&self.run, "accepted", 1.0, Some(rationale.clone()));

        Ok(Some((
            Rewrite {
                node: progress.node.to_string(),
                candidate: candidate.label.clone(),
                replaced_with: candidate.ops.iter().map(|o| o.name.clone()).collect(),
                original_score: original.value,
                winning_score,
                rationale,
            },
            candidate.ops.clone(),
        )))
    }

    fn op_context(&self, node: &str) -> OpContext {
        self.run.op_context(&format!("optimizer:{node}"))
    }

    fn degrade(&self, progress: &Progress<'_>, message: String) -> EngineError {
        tracing::warn!(node = progress.node, error = %message, "optimizer left node unchanged");
        let warning = EngineError::OptimizerDegraded {
            node: progress.node.to_string(),
            message,
        };
        progress.emit(&self.run, "failed", 1.0, Some(warning.to_string()));
        self.run.emit(ProgressEvent::Warning {
            message: warning.to_string(),
        });
        warning
    }
}

/// Position of the current node within an optimization pass.
struct Progress<'a> {
    node: &'a str,
    index: usize,
    total: usize,
}

impl Progress<'_> {
    fn emit(&self, run: &RunContext, status: &str, fraction: f64, rationale: Option<String>) {
        let overall = (self.index as f64 + fraction.clamp(0.0, 1.0)) / self.total.max(1) as f64;
        run.emit(ProgressEvent::OptimizerProgress {
            node: self.node.to_string(),
            status: status.to_string(),
            progress: overall,
            rationale,
            should_optimize: None,
            validator_prompt: None,
        });
    }
}

/// Execute `ops` in sequence over `input`.
async fn run_chain(
    registry: &OperationRegistry,
    ops: &[OperationSpec],
    input: Vec<Record>,
    ctx: &OpContext,
) -> Result<Vec<Record>, OptimizerError> {
    let mut records = input;
    for spec in ops {
        let op = registry
            .resolve_spec(spec)
            .map_err(|e| OptimizerError::Rewrite(e.to_string()))?;
        records = op.execute(OperationInput::single(records), ctx).await?;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use df_ops::mock::ScriptedLlm;
    use df_runner::CollectingSink;
    use serde_json::json;

    fn pipeline(optimize: bool) -> PipelineConfig {
        PipelineConfig::from_value(json!({
            "name": "invoices",
            "default_model": "mock",
            "datasets": {"docs": {"type": "memory", "records": [
                {"text": "invoice one"}, {"text": "invoice two"}, {"text": "invoice three"}
            ]}},
            "operations": [
                {"name": "clean", "type": "uppercase", "field": "text"},
                {"name": "extract", "type": "map", "optimize": optimize,
                 "prompt": "Extract title and total from {{ input.text }}",
                 "output": {"schema": {"title": "string", "total": "number"}}}
            ],
            "pipeline": {"steps": [{"name": "s", "input": "docs", "operations": ["clean", "extract"]}]},
            "settings": {"optimizer": {"sample_size": 2}}
        }))
        .unwrap()
    }

    fn optimizer(llm: Arc<ScriptedLlm>, sink: Arc<CollectingSink>) -> Optimizer {
        let run = RunContext::default().with_llm(llm).with_sink(sink);
        Optimizer::new(
            Arc::new(OperationRegistry::with_builtins()),
            Arc::new(CacheStore::in_memory().unwrap()),
            run,
            OptimizerSettings {
                sample_size: 2,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn weak_operation_is_decomposed() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .when("Focus only on producing `title`", r#"{"title": "Invoice"}"#)
                .when("Focus only on producing `total`", r#"{"total": 12.5}"#)
                .when("Extract title and total", r#"{"title": "", "total": 12.5}"#),
        );
        let sink = Arc::new(CollectingSink::new());
        let outcome = optimizer(llm.clone(), sink.clone()).optimize(&pipeline(true)).await.unwrap();

        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.rewrites.len(), 1);
        let rewrite = &outcome.rewrites[0];
        assert_eq!(rewrite.node, "s/extract");
        assert_eq!(rewrite.original_score, 0.5);
        assert_eq!(rewrite.winning_score, 1.0);

        let step = outcome.config.step("s").unwrap();
        let names: Vec<_> = step.operations.iter().map(|o| o.name().to_string()).collect();
        assert_eq!(names, vec!["clean", "extract_title", "extract_total"]);
        assert!(outcome.config.operation("extract").is_none());
        assert!(outcome.cost_usd > 0.0);
        // sample of 2: one original call and two chained calls per record
        assert_eq!(llm.calls(), 6);

        assert!(sink.events().iter().any(|e| matches!(
            e,
            ProgressEvent::OptimizerProgress { status, progress, .. } if status == "accepted" && *progress == 1.0
        )));
        // the rewritten pipeline still builds
        Dag::build(&outcome.config, &OperationRegistry::with_builtins()).unwrap();
    }

    #[tokio::test]
    async fn strong_operation_is_kept() {
        let llm = Arc::new(ScriptedLlm::new().otherwise(r#"{"title": "Invoice", "total": 3}"#));
        let sink = Arc::new(CollectingSink::new());
        let outcome = optimizer(llm, sink.clone()).optimize(&pipeline(true)).await.unwrap();
        assert!(outcome.rewrites.is_empty());
        assert!(outcome.config.operation("extract").is_some());
        assert!(sink.events().iter().any(|e| matches!(
            e,
            ProgressEvent::OptimizerProgress { status, .. } if status == "unchanged"
        )));
    }

    #[tokio::test]
    async fn unflagged_pipeline_makes_no_calls() {
        let llm = Arc::new(ScriptedLlm::new().otherwise("{}"));
        let sink = Arc::new(CollectingSink::new());
        let outcome = optimizer(llm.clone(), sink).optimize(&pipeline(false)).await.unwrap();
        assert!(outcome.rewrites.is_empty());
        assert_eq!(llm.calls(), 0);
        assert_eq!(outcome.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn sampling_failure_degrades_to_warning() {
        let mut config = pipeline(true);
        config.datasets.insert(
            "docs".into(),
            df_core::pipeline::DatasetSpec::file("/definitely/not/here.json"),
        );
        let llm = Arc::new(ScriptedLlm::new().otherwise("{}"));
        let sink = Arc::new(CollectingSink::new());
        let outcome = optimizer(llm, sink.clone()).optimize(&config).await.unwrap();

        assert!(outcome.rewrites.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
        assert!(matches!(
            &outcome.warnings[0],
            EngineError::OptimizerDegraded { node, .. } if node == "s/extract"
        ));
        assert_eq!(sink.warnings().len(), 1);
        assert!(outcome.config.operation("extract").is_some());
    }

    #[tokio::test]
    async fn invalid_pipeline_is_fatal() {
        let mut config = pipeline(true);
        config.pipeline.steps[0].input = Some("ghost".into());
        let llm = Arc::new(ScriptedLlm::new());
        let err = optimizer(llm, Arc::new(CollectingSink::new()))
            .optimize(&config)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OptimizerError::Pipeline(EngineError::UnknownStepReference { .. })
        ));
    }

    #[tokio::test]
    async fn should_optimize_reports_samples_and_cost() {
        let llm = Arc::new(ScriptedLlm::new().otherwise(r#"{"title": "", "total": 1}"#));
        let sink = Arc::new(CollectingSink::new());
        let verdict = optimizer(llm, sink.clone())
            .should_optimize(&pipeline(false), "s", "extract")
            .await
            .unwrap();
        assert!(verdict.should_optimize);
        assert_eq!(verdict.input_sample.len(), 2);
        assert_eq!(verdict.input_sample[0]["text"], "INVOICE ONE");
        assert_eq!(verdict.output_sample[0]["total"], 1);
        assert!(verdict.cost_usd > 0.0);
        assert!(sink.events().iter().any(|e| matches!(
            e,
            ProgressEvent::OptimizerProgress { should_optimize: Some(true), .. }
        )));
    }

    #[tokio::test]
    async fn should_optimize_rejects_unknown_target() {
        let llm = Arc::new(ScriptedLlm::new());
        let err = optimizer(llm, Arc::new(CollectingSink::new()))
            .should_optimize(&pipeline(false), "s", "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizerError::UnknownTarget { .. }));
    }
}
