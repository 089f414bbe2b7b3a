//! Pull executor: resolves a target node by demanding its dependencies'
//! outputs, executing only on cache miss.
//!
//! Per node: UNRESOLVED → RESOLVING → RESOLVED | FAILED. A per-node gate makes
//! resolution single-flight, so a node shared by several downstream callers
//! runs at most once per run. A failure settles the node as FAILED and reaches
//! only the nodes that pulled it; independent branches keep resolving.

use crate::cache::{CacheEntry, CacheStore};
use crate::context::RunContext;
use crate::dag::{Dag, DagNode, NodeId};
use crate::fingerprint::{dataset_fingerprint, node_fingerprint, short};
use crate::loader::DatasetLoader;
use crate::EngineError;
use async_recursion::async_recursion;
use chrono::Utc;
use df_core::pipeline::{DatasetSpec, PipelineConfig};
use df_core::record::Record;
use df_core::trace::{ExecutionStatus, NodeReport, ProgressEvent};
use df_ops::{OperationError, OperationInput, Upstream};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tokio::sync::OnceCell;

/// Materialized output of a resolved node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub node: String,
    pub fingerprint: String,
    pub records: Arc<Vec<Record>>,
    pub cache_hit: bool,
}

/// Observable state of a node within the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unresolved,
    Resolving,
    Resolved,
    Failed,
}

#[derive(Debug, Clone)]
enum NodeState {
    Unresolved,
    Resolving,
    Resolved(NodeOutput),
    Failed(EngineError),
}

#[derive(Debug)]
struct NodeSlot {
    state: Mutex<NodeState>,
    gate: tokio::sync::Mutex<()>,
    fingerprint: OnceLock<String>,
}

#[derive(Debug, Clone)]
struct LoadedDataset {
    records: Arc<Vec<Record>>,
    fingerprint: String,
}

#[derive(Debug)]
pub struct Executor {
    dag: Arc<Dag>,
    datasets: BTreeMap<String, DatasetSpec>,
    sample_size: Option<usize>,
    loader: DatasetLoader,
    cache: Arc<CacheStore>,
    run: RunContext,
    slots: Vec<NodeSlot>,
    loaded: HashMap<String, OnceCell<LoadedDataset>>,
    executions: AtomicUsize,
    reports: Mutex<Vec<NodeReport>>,
}

impl Executor {
    pub fn new(
        dag: Arc<Dag>,
        config: &PipelineConfig,
        loader: DatasetLoader,
        cache: Arc<CacheStore>,
        run: RunContext,
    ) -> Self {
        let slots = dag
            .nodes()
            .iter()
            .map(|_| NodeSlot {
                state: Mutex::new(NodeState::Unresolved),
                gate: tokio::sync::Mutex::new(()),
                fingerprint: OnceLock::new(),
            })
            .collect();
        let loaded = config
            .datasets
            .keys()
            .map(|name| (name.clone(), OnceCell::new()))
            .collect();
        Self {
            dag,
            datasets: config.datasets.clone(),
            sample_size: config.settings.sample_size,
            loader,
            cache,
            run,
            slots,
            loaded,
            executions: AtomicUsize::new(0),
            reports: Mutex::new(Vec::new()),
        }
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Load every dataset a source node reads. Failures surface before any
    /// node executes.
    pub async fn load_datasets(&self) -> Result<(), EngineError> {
        for node in self.dag.nodes() {
            if let Some(dataset) = &node.source {
                self.dataset(dataset).await?;
            }
        }
        Ok(())
    }

    async fn dataset(&self, name: &str) -> Result<LoadedDataset, EngineError> {
        let (Some(cell), Some(spec)) = (self.loaded.get(name), self.datasets.get(name)) else {
            return Err(EngineError::Load {
                dataset: name.to_string(),
                message: "dataset is not declared".into(),
            });
        };
        cell.get_or_try_init(|| async {
            let records = self.loader.load(name, spec, self.sample_size).await?;
            let fingerprint = dataset_fingerprint(name, spec.version.as_deref(), &records);
            Ok::<_, EngineError>(LoadedDataset {
                records: Arc::new(records),
                fingerprint,
            })
        })
        .await
        .cloned()
    }

    /// Fingerprint of `id`, computing upstream fingerprints first. Loads
    /// datasets but never executes an operation.
    #[async_recursion]
    pub async fn fingerprint(&self, id: NodeId) -> Result<String, EngineError> {
        let slot = &self.slots[id.0];
        if let Some(fp) = slot.fingerprint.get() {
            return Ok(fp.clone());
        }
        let node = self.dag.node(id);
        let mut upstream: Vec<(Option<String>, String)> = Vec::with_capacity(node.upstream.len() + 1);
        if let Some(dataset) = &node.source {
            upstream.push((None, self.dataset(dataset).await?.fingerprint));
        }
        for edge in &node.upstream {
            upstream.push((edge.role.clone(), self.fingerprint(edge.node).await?));
        }
        let pairs: Vec<(Option<&str>, &str)> = upstream
            .iter()
            .map(|(role, fp)| (role.as_deref(), fp.as_str()))
            .collect();
        let fp = node_fingerprint(&node.spec, node.op.version(), &pairs);
        Ok(slot.fingerprint.get_or_init(|| fp).clone())
    }

    pub fn status(&self, id: NodeId) -> NodeStatus {
        match self.slots[id.0].state.lock().map(|s| s.clone()) {
            Ok(NodeState::Unresolved) => NodeStatus::Unresolved,
            Ok(NodeState::Resolving) => NodeStatus::Resolving,
            Ok(NodeState::Resolved(_)) => NodeStatus::Resolved,
            Ok(NodeState::Failed(_)) | Err(_) => NodeStatus::Failed,
        }
    }

    /// Number of operation executions (cache misses) so far.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Reports for every node that was attempted, in completion order.
    pub fn reports(&self) -> Vec<NodeReport> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn settled(&self, id: NodeId) -> Option<Result<NodeOutput, EngineError>> {
        let state = match self.slots[id.0].state.lock() {
            Ok(state) => state,
            Err(_) => return Some(Err(EngineError::InvalidPipeline("node state lock poisoned".into()))),
        };
        match &*state {
            NodeState::Resolved(out) => Some(Ok(out.clone())),
            NodeState::Failed(err) => Some(Err(err.clone())),
            NodeState::Unresolved | NodeState::Resolving => None,
        }
    }

    fn set_state(&self, id: NodeId, next: NodeState) {
        if let Ok(mut state) = self.slots[id.0].state.lock() {
            *state = next;
        }
    }

    pub async fn resolve_terminal(&self) -> Result<NodeOutput, EngineError> {
        self.resolve(self.dag.terminal()).await
    }

    /// Resolve several targets concurrently; shared ancestors still run once.
    pub async fn resolve_many(&self, ids: &[NodeId]) -> Vec<Result<NodeOutput, EngineError>> {
        join_all(ids.iter().map(|&id| self.resolve(id))).await
    }

    /// Resolve `id`, pulling its dependencies depth-first in declared order.
    #[async_recursion]
    pub async fn resolve(&self, id: NodeId) -> Result<NodeOutput, EngineError> {
        if let Some(done) = self.settled(id) {
            return done;
        }
        if self.run.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let _gate = self.slots[id.0].gate.lock().await;
        if let Some(done) = self.settled(id) {
            return done;
        }
        self.set_state(id, NodeState::Resolving);

        let result = self.resolve_locked(id).await;
        match &result {
            Ok(out) => self.set_state(id, NodeState::Resolved(out.clone())),
            Err(err) => self.set_state(id, NodeState::Failed(err.clone())),
        }
        result
    }

    async fn resolve_locked(&self, id: NodeId) -> Result<NodeOutput, EngineError> {
        let node = self.dag.node(id);
        let fingerprint = self.fingerprint(id).await?;

        match self.cache.lookup(&fingerprint) {
            Ok(Some(entry)) => return Ok(self.adopt(node, entry)),
            Ok(None) => {}
            Err(err @ EngineError::CacheCorruption { .. }) => {
                self.run.emit(ProgressEvent::Warning {
                    message: format!("{}: {err}, recomputing", node.name),
                });
            }
            Err(err) => {
                tracing::warn!(node = %node.name, error = %err, "cache lookup failed, recomputing");
            }
        }

        let input = self.node_input(id).await?;
        if self.run.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.execute(node, fingerprint, input).await
    }

    /// Materialize the input `id` would execute on: its source dataset, then
    /// each upstream in declared order. Pulls upstreams, never runs `id`.
    pub async fn node_input(&self, id: NodeId) -> Result<OperationInput, EngineError> {
        let node = self.dag.node(id);
        let mut upstreams = Vec::with_capacity(node.upstream.len() + 1);
        if let Some(dataset) = &node.source {
            upstreams.push(Upstream {
                role: None,
                records: self.dataset(dataset).await?.records,
            });
        }
        for edge in &node.upstream {
            let out = self.resolve(edge.node).await?;
            upstreams.push(Upstream {
                role: edge.role.clone(),
                records: out.records,
            });
        }
        Ok(OperationInput { upstreams })
    }

    fn adopt(&self, node: &DagNode, entry: CacheEntry) -> NodeOutput {
        tracing::debug!(node = %node.name, fingerprint = short(&entry.fingerprint), "cache hit");
        self.push_report(NodeReport {
            node: node.name.clone(),
            op_type: node.spec.op_type.clone(),
            status: ExecutionStatus::CacheHit,
            fingerprint: Some(entry.fingerprint.clone()),
            records_out: entry.records.len(),
            cost_usd: 0.0,
            started_at: Utc::now(),
            duration_ms: Some(0),
            error: None,
        });
        self.run.emit(ProgressEvent::NodeFinished {
            node: node.name.clone(),
            status: ExecutionStatus::CacheHit,
            records: entry.records.len(),
            cache_hit: true,
        });
        NodeOutput {
            node: node.name.clone(),
            fingerprint: entry.fingerprint,
            records: Arc::new(entry.records),
            cache_hit: true,
        }
    }

    async fn execute(
        &self,
        node: &DagNode,
        fingerprint: String,
        input: OperationInput,
    ) -> Result<NodeOutput, EngineError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let cost_before = self.run.ledger.node_cost(&node.name).cost_usd;
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.run.emit(ProgressEvent::NodeStarted { node: node.name.clone() });
        tracing::info!(
            node = %node.name,
            op_type = %node.spec.op_type,
            fingerprint = short(&fingerprint),
            records_in = input.len(),
            "executing node"
        );

        let outcome = self.run_operation(node, input).await;
        let cost_usd = (self.run.ledger.node_cost(&node.name).cost_usd - cost_before).max(0.0);
        let duration_ms = clock.elapsed().as_millis() as i64;

        let records = match outcome {
            Ok(records) => records,
            Err(err) => {
                let status = if err == EngineError::Cancelled {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                };
                tracing::error!(node = %node.name, error = %err, "node failed");
                self.push_report(NodeReport {
                    node: node.name.clone(),
                    op_type: node.spec.op_type.clone(),
                    status,
                    fingerprint: Some(fingerprint),
                    records_out: 0,
                    cost_usd,
                    started_at,
                    duration_ms: Some(duration_ms),
                    error: Some(err.to_string()),
                });
                self.run.emit(ProgressEvent::NodeFinished {
                    node: node.name.clone(),
                    status,
                    records: 0,
                    cache_hit: false,
                });
                return Err(err);
            }
        };

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            node: node.name.clone(),
            records,
            cost_usd,
            op_version: node.op.version().to_string(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.cache.store(&entry) {
            tracing::warn!(node = %node.name, error = %err, "failed to write cache entry");
        }
        let records_out = entry.records.len();

        self.push_report(NodeReport {
            node: node.name.clone(),
            op_type: node.spec.op_type.clone(),
            status: ExecutionStatus::Completed,
            fingerprint: Some(fingerprint.clone()),
            records_out,
            cost_usd,
            started_at,
            duration_ms: Some(duration_ms),
            error: None,
        });
        self.run.emit(ProgressEvent::NodeFinished {
            node: node.name.clone(),
            status: ExecutionStatus::Completed,
            records: records_out,
            cache_hit: false,
        });
        tracing::info!(node = %node.name, records_out, cost_usd, duration_ms, "node completed");

        Ok(NodeOutput {
            node: node.name.clone(),
            fingerprint,
            records: Arc::new(entry.records),
            cache_hit: false,
        })
    }

    /// Run the operation, in batches when it supports partial execution and
    /// its spec sets `batch_size`.
    async fn run_operation(&self, node: &DagNode, input: OperationInput) -> Result<Vec<Record>, EngineError> {
        let ctx = self.run.op_context(&node.name);
        let batch_size = node
            .spec
            .param_u64("batch_size")
            .filter(|n| *n > 0 && node.op.supports_partial())
            .map(|n| n as usize);

        let Some(size) = batch_size else {
            return node.op.execute(input, &ctx).await.map_err(|e| node_error(node, e));
        };

        let records = input.into_records();
        let total = records.len();
        let mut out = Vec::with_capacity(total);
        let mut done = 0;
        for chunk in records.chunks(size) {
            if self.run.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.run.emit(ProgressEvent::NodeProgress {
                node: node.name.clone(),
                done,
                total,
            });
            let batch = node
                .op
                .execute(OperationInput::single(chunk.to_vec()), &ctx)
                .await
                .map_err(|e| node_error(node, e))?;
            out.extend(batch);
            done += chunk.len();
        }
        self.run.emit(ProgressEvent::NodeProgress {
            node: node.name.clone(),
            done,
            total,
        });
        Ok(out)
    }

    fn push_report(&self, report: NodeReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report);
        }
    }
}

fn node_error(node: &DagNode, cause: OperationError) -> EngineError {
    match cause {
        OperationError::Cancelled => EngineError::Cancelled,
        cause => EngineError::NodeExecution {
            node: node.name.clone(),
            cause,
        },
    }
}
