//! Run context: the per-run services every node execution shares.
//!
//! Constructed once per run and passed down explicitly; nothing here is a
//! process-wide singleton.

use crate::dispatch::RunDispatch;
use crate::progress::{NullSink, ProgressSink};
use df_core::pipeline::{RetryPolicy, RunSettings};
use df_core::trace::ProgressEvent;
use df_ops::llm::NoLlm;
use df_ops::{LlmClient, OpContext};
use df_policy::{CostLedger, RateLimiter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Shared execution context passed to every node during a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub cancel: CancellationToken,
    pub ledger: Arc<CostLedger>,
    pub limiter: RateLimiter,
    pub sink: Arc<dyn ProgressSink>,
    pub retry: RetryPolicy,
    /// Per-node cap on concurrent record-level calls.
    pub max_concurrency: usize,
    pub call_timeout_ms: u64,
    /// `None` runs structural-only pipelines; any LLM call then fails.
    pub llm: Option<Arc<dyn LlmClient>>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::from_settings(&RunSettings::default())
    }
}

impl RunContext {
    pub fn from_settings(settings: &RunSettings) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            ledger: Arc::new(CostLedger::new(settings.cost_limit.clone().unwrap_or_default())),
            limiter: RateLimiter::new(&settings.rate_limits),
            sink: Arc::new(NullSink),
            retry: settings.retry.clone(),
            max_concurrency: settings.max_concurrency.max(1),
            call_timeout_ms: settings.call_timeout_ms,
            llm: None,
        }
    }

    pub fn with_llm(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(client);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn emit(&self, event: ProgressEvent) {
        self.sink.emit(event);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The view handed to one executing node.
    pub fn op_context(&self, node: &str) -> OpContext {
        let ctx = match &self.llm {
            Some(client) => OpContext::new(node, Arc::new(RunDispatch::new(self.clone(), Arc::clone(client)))),
            None => OpContext::new(node, Arc::new(NoLlm)),
        };
        ctx.with_cancel(self.cancel.clone())
            .with_max_concurrency(self.max_concurrency)
    }
}
