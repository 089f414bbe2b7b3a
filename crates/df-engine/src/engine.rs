//! Engine facade: LoadPipeline / Run / Optimize / Cancel plus cache and
//! history maintenance.
//!
//! Layout under the engine root:
//! - `cache/<namespace>/cache.db`: node outputs by fingerprint
//! - `history.db`: run history

use crate::registry::RunRegistry;
use dashmap::DashMap;
use df_core::pipeline::{PipelineConfig, RunSettings};
use df_core::record::{Record, Value};
use df_core::trace::{ExecutionStatus, NodeReport, ProgressEvent, RunRecord};
use df_ops::llm::OpenAiClient;
use df_ops::{LlmClient, OperationRegistry};
use df_optimizer::{OptimizeOutcome, Optimizer, OptimizerError, Rewrite, ShouldOptimize};
use df_runner::partial::{self, RunPlan};
use df_runner::{
    CacheStats, CacheStore, Dag, DatasetLoader, EngineError, Executor, ProgressSink, RunContext,
};
use df_trace::{NamespaceSummary, RunQuery, RunStore, TraceError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// `DOCFLOW_HOME`, else `~/.docflow`.
pub fn docflow_home() -> Option<PathBuf> {
    match std::env::var_os("DOCFLOW_HOME") {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::home_dir().map(|home| home.join(".docflow")),
    }
}

/// A validated pipeline: parsed config plus its built DAG.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    dag: Arc<Dag>,
    /// Relative dataset paths resolve against this directory.
    base_dir: Option<PathBuf>,
}

impl Pipeline {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn namespace(&self) -> &str {
        &self.config.settings.namespace
    }
}

/// Final records of a run plus per-node accounting.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub run_id: Uuid,
    pub records: Vec<Record>,
    pub total_cost_usd: f64,
    pub nodes: Vec<NodeReport>,
    /// The terminal node came straight from the cache.
    pub cache_hit: bool,
}

/// A rewritten pipeline and what the optimizer did to it.
#[derive(Debug, Clone)]
pub struct Optimized {
    pub pipeline: Pipeline,
    pub rewrites: Vec<Rewrite>,
    pub warnings: Vec<EngineError>,
    pub cost_usd: f64,
}

pub struct Engine {
    root: PathBuf,
    registry: Arc<OperationRegistry>,
    loader: DatasetLoader,
    llm: Option<Arc<dyn LlmClient>>,
    runs: RunRegistry,
    history: RunStore,
    caches: DashMap<String, Arc<CacheStore>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.root)
            .field("llm", &self.llm.is_some())
            .field("active_runs", &self.runs.active().len())
            .finish()
    }
}

impl Engine {
    /// Open the engine rooted at `root`, creating it if needed. Runs left
    /// `running` by an earlier process are marked failed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| EngineError::Cache(format!("failed to create {}: {e}", root.display())))?;
        let history = RunStore::open(&root.join("history.db")).map_err(history_error)?;
        if let Err(err) = history.fail_abandoned() {
            tracing::warn!(error = %err, "could not close abandoned runs");
        }
        tracing::info!(root = %root.display(), "engine opened");
        Ok(Self {
            root,
            registry: Arc::new(OperationRegistry::with_builtins()),
            loader: DatasetLoader::new(),
            llm: None,
            runs: RunRegistry::new(),
            history,
            caches: DashMap::new(),
        })
    }

    /// Open at [`docflow_home`].
    pub fn open_default() -> Result<Self, EngineError> {
        let root = docflow_home()
            .ok_or_else(|| EngineError::Cache("no home directory found; set DOCFLOW_HOME".into()))?;
        Self::open(root)
    }

    pub fn with_llm(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(client);
        self
    }

    /// Use an OpenAI-compatible client when `OPENAI_API_KEY` is set.
    pub fn with_openai_from_env(mut self) -> Self {
        match OpenAiClient::from_env(Duration::from_secs(300)) {
            Some(client) => self.llm = Some(Arc::new(client)),
            None => tracing::warn!("OPENAI_API_KEY not set; LLM-backed operations will fail"),
        }
        self
    }

    /// Replace the operation registry, e.g. to add host-provided operators.
    pub fn with_registry(mut self, registry: OperationRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_loader(mut self, loader: DatasetLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // LoadPipeline
    // -----------------------------------------------------------------------

    /// Validate a parsed config and build its DAG. Build errors surface here,
    /// before anything runs.
    pub fn load_pipeline(&self, config: PipelineConfig) -> Result<Pipeline, EngineError> {
        let namespace = &config.settings.namespace;
        if !df_runner::cache::is_valid_namespace(namespace) {
            return Err(EngineError::InvalidPipeline(format!("invalid namespace '{namespace}'")));
        }
        let dag = Dag::build(&config, &self.registry)?;
        tracing::debug!(pipeline = %config.name, nodes = dag.len(), "pipeline loaded");
        Ok(Pipeline {
            config,
            dag: Arc::new(dag),
            base_dir: None,
        })
    }

    /// Load from a nested mapping, whatever format it was read from.
    pub fn load_pipeline_value(&self, value: Value) -> Result<Pipeline, EngineError> {
        self.load_pipeline(PipelineConfig::from_value(value)?)
    }

    pub fn load_pipeline_yaml(&self, text: &str) -> Result<Pipeline, EngineError> {
        self.load_pipeline(PipelineConfig::from_yaml_str(text)?)
    }

    pub fn load_pipeline_json(&self, text: &str) -> Result<Pipeline, EngineError> {
        self.load_pipeline(PipelineConfig::from_json_str(text)?)
    }

    /// Load a `.json`, `.yaml` or `.yml` file. Relative dataset paths resolve
    /// against the file's directory.
    pub async fn load_pipeline_file(&self, path: &Path) -> Result<Pipeline, EngineError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EngineError::InvalidPipeline(format!("cannot read {}: {e}", path.display())))?;
        let mut pipeline = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => self.load_pipeline_json(&text)?,
            _ => self.load_pipeline_yaml(&text)?,
        };
        pipeline.base_dir = path.parent().map(Path::to_path_buf);
        Ok(pipeline)
    }

    // -----------------------------------------------------------------------
    // Run / Cancel
    // -----------------------------------------------------------------------

    pub async fn run(&self, pipeline: &Pipeline, sink: Arc<dyn ProgressSink>) -> Result<RunOutput, EngineError> {
        self.run_with_id(pipeline, sink, Uuid::new_v4()).await
    }

    /// Run under a caller-chosen id, so the caller can [`Engine::cancel`] it
    /// while it is in flight.
    pub async fn run_with_id(
        &self,
        pipeline: &Pipeline,
        sink: Arc<dyn ProgressSink>,
        run_id: Uuid,
    ) -> Result<RunOutput, EngineError> {
        let config = &pipeline.config;
        let namespace = &config.settings.namespace;
        let cache = self.cache(namespace)?;
        let (cancel, _guard) = self.runs.guard(run_id);
        let run = self.run_context(&config.settings, run_id, cancel, sink);

        let mut record = RunRecord::started(run_id, &config.name, namespace);
        self.record_history(&record, &[]);
        run.emit(ProgressEvent::RunStarted { run_id });
        tracing::info!(%run_id, pipeline = %config.name, namespace = %namespace, nodes = pipeline.dag.len(), "run started");

        let executor = Executor::new(
            Arc::clone(&pipeline.dag),
            config,
            self.loader_for(pipeline),
            cache,
            run.clone(),
        );
        let result = match executor.load_datasets().await {
            Ok(()) => executor.resolve_terminal().await,
            Err(err) => Err(err),
        };

        let nodes = executor.reports();
        let total_cost_usd = run.ledger.total_cost_usd();
        let status = match &result {
            Ok(_) => ExecutionStatus::Completed,
            Err(EngineError::Cancelled) => ExecutionStatus::Cancelled,
            Err(_) => ExecutionStatus::Failed,
        };
        record.finish(status, &nodes, total_cost_usd);
        record.error = result.as_ref().err().map(ToString::to_string);
        self.record_history(&record, &nodes);
        run.emit(ProgressEvent::RunFinished {
            run_id,
            status,
            total_cost_usd,
        });

        match result {
            Ok(out) => {
                tracing::info!(%run_id, records = out.records.len(), total_cost_usd, cache_hit = out.cache_hit, "run completed");
                Ok(RunOutput {
                    run_id,
                    records: Arc::try_unwrap(out.records).unwrap_or_else(|shared| (*shared).clone()),
                    total_cost_usd,
                    nodes,
                    cache_hit: out.cache_hit,
                })
            }
            Err(err) => {
                tracing::error!(%run_id, error = %err, status = status.as_str(), "run did not complete");
                Err(err)
            }
        }
    }

    /// Cancel an in-flight run or optimization. False for unknown or
    /// finished ids.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        self.runs.cancel(run_id)
    }

    pub fn active_runs(&self) -> Vec<Uuid> {
        self.runs.active()
    }

    // -----------------------------------------------------------------------
    // Optimize
    // -----------------------------------------------------------------------

    pub async fn optimize(&self, pipeline: &Pipeline, sink: Arc<dyn ProgressSink>) -> Result<Optimized, EngineError> {
        self.optimize_with_id(pipeline, sink, Uuid::new_v4()).await
    }

    /// Rewrite the operations flagged `optimize: true`. Per-node failures come
    /// back as warnings; the returned pipeline is rebuilt and validated.
    pub async fn optimize_with_id(
        &self,
        pipeline: &Pipeline,
        sink: Arc<dyn ProgressSink>,
        run_id: Uuid,
    ) -> Result<Optimized, EngineError> {
        let config = &pipeline.config;
        let (cancel, _guard) = self.runs.guard(run_id);
        let optimizer = self.optimizer(pipeline, run_id, cancel, sink)?;

        let OptimizeOutcome {
            config: rewritten,
            rewrites,
            warnings,
            cost_usd,
        } = optimizer.optimize(config).await.map_err(optimizer_error)?;
        tracing::info!(%run_id, pipeline = %config.name, rewrites = rewrites.len(), warnings = warnings.len(), cost_usd, "optimization finished");

        let mut optimized = self.load_pipeline(rewritten)?;
        optimized.base_dir = pipeline.base_dir.clone();
        Ok(Optimized {
            pipeline: optimized,
            rewrites,
            warnings,
            cost_usd,
        })
    }

    /// Run one operation on a sample and report whether it should be
    /// optimized.
    pub async fn should_optimize(
        &self,
        pipeline: &Pipeline,
        step: &str,
        operation: &str,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<ShouldOptimize, OptimizerError> {
        let run_id = Uuid::new_v4();
        let (cancel, _guard) = self.runs.guard(run_id);
        let optimizer = self.optimizer(pipeline, run_id, cancel, sink)?;
        optimizer.should_optimize(&pipeline.config, step, operation).await
    }

    fn optimizer(
        &self,
        pipeline: &Pipeline,
        run_id: Uuid,
        cancel: CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Optimizer, EngineError> {
        let settings = &pipeline.config.settings;
        let cache = self.cache(&settings.namespace)?;
        let run = self.run_context(settings, run_id, cancel, sink);
        Ok(
            Optimizer::new(Arc::clone(&self.registry), cache, run, settings.optimizer.clone())
                .with_loader(self.loader_for(pipeline)),
        )
    }

    // -----------------------------------------------------------------------
    // Planning and cache maintenance
    // -----------------------------------------------------------------------

    /// Which nodes a run would execute and which come from the cache.
    /// Loads datasets; executes nothing.
    pub async fn plan(&self, pipeline: &Pipeline) -> Result<RunPlan, EngineError> {
        let settings = &pipeline.config.settings;
        let cache = self.cache(&settings.namespace)?;
        let executor = Executor::new(
            Arc::clone(&pipeline.dag),
            &pipeline.config,
            self.loader_for(pipeline),
            cache,
            RunContext::from_settings(settings),
        );
        let plan = partial::plan(&executor).await?;
        tracing::debug!(
            pipeline = %pipeline.config.name,
            executes = plan.dirty.len(),
            llm_nodes = plan.llm_nodes().count(),
            "run planned"
        );
        Ok(plan)
    }

    /// Drop every cached node output in `namespace`.
    pub fn clear_cache(&self, namespace: &str) -> Result<usize, EngineError> {
        let removed = self.cache(namespace)?.clear()?;
        tracing::info!(namespace, removed, "cache cleared");
        Ok(removed)
    }

    pub fn cache_stats(&self, namespace: &str) -> Result<CacheStats, EngineError> {
        self.cache(namespace)?.stats()
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    pub fn history(&self, query: &RunQuery) -> Result<Vec<RunRecord>, TraceError> {
        self.history.list_runs(query)
    }

    pub fn history_summary(&self, namespace: &str) -> Result<NamespaceSummary, TraceError> {
        self.history.summary(namespace)
    }

    pub fn run_record(&self, run_id: Uuid) -> Result<RunRecord, TraceError> {
        self.history.get_run(run_id)
    }

    pub fn node_reports(&self, run_id: Uuid) -> Result<Vec<NodeReport>, TraceError> {
        self.history.node_reports(run_id)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn cache(&self, namespace: &str) -> Result<Arc<CacheStore>, EngineError> {
        if let Some(store) = self.caches.get(namespace) {
            return Ok(Arc::clone(store.value()));
        }
        let store = Arc::new(CacheStore::open_namespace(&self.root.join("cache"), namespace)?);
        Ok(Arc::clone(
            self.caches
                .entry(namespace.to_string())
                .or_insert(store)
                .value(),
        ))
    }

    fn run_context(
        &self,
        settings: &RunSettings,
        run_id: Uuid,
        cancel: CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> RunContext {
        let run = RunContext::from_settings(settings)
            .with_run_id(run_id)
            .with_cancel(cancel)
            .with_sink(sink);
        match &self.llm {
            Some(llm) => run.with_llm(Arc::clone(llm)),
            None => run,
        }
    }

    fn loader_for(&self, pipeline: &Pipeline) -> DatasetLoader {
        match &pipeline.base_dir {
            Some(dir) => self.loader.clone().with_base_dir(dir.clone()),
            None => self.loader.clone(),
        }
    }

    fn record_history(&self, record: &RunRecord, nodes: &[NodeReport]) {
        if let Err(err) = self.history.record_run(record, nodes) {
            tracing::warn!(run_id = %record.run_id, error = %err, "failed to record run history");
        }
    }
}

fn history_error(err: TraceError) -> EngineError {
    EngineError::Cache(format!("run history: {err}"))
}

fn optimizer_error(err: OptimizerError) -> EngineError {
    if err.is_cancelled() {
        return EngineError::Cancelled;
    }
    match err {
        OptimizerError::Pipeline(err) => err,
        other => EngineError::OptimizerDegraded {
            node: String::new(),
            message: other.to_string(),
        },
    }
}
