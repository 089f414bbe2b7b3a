//! df-ops: Operation contract, name→factory registry, built-in operators and LLM plumbing.
//!
//! Every operator, built-in or plugged in by a host application, implements
//! [`Operation`]. An operation validates its configuration when constructed by
//! its factory and afterwards only transforms record batches.

pub mod builtin;
pub mod llm;
pub mod mock;
pub mod pricing;
pub mod registry;
pub mod schema;
pub mod template;
pub mod timeout;

pub use llm::{CompletionRequest, CompletionResponse, LlmClient, LlmDispatch};
pub use registry::{OperationFactory, OperationRegistry};

use async_trait::async_trait;
use df_core::pipeline::OperationSpec;
use df_core::record::Record;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure raised while an operation executes.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OperationError {
    #[error("timeout after {0}ms")]
    Timeout(u64),
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("output validation failed: {0}")]
    Validation(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("cancelled")]
    Cancelled,
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl OperationError {
    /// Transient failures are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            OperationError::Timeout(_)
            | OperationError::RateLimited(_)
            | OperationError::Network(_) => true,
            OperationError::Upstream { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }
}

/// Failure raised while resolving an operation type into an instance.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("unknown operation type '{0}'")]
    UnknownOperationType(String),
    #[error("invalid config for operation '{operation}' (fields: {}): {message}", .fields.join(", "))]
    InvalidOperationConfig {
        operation: String,
        fields: Vec<String>,
        message: String,
    },
}

impl RegistryError {
    pub fn invalid(spec: &OperationSpec, fields: Vec<String>, message: impl Into<String>) -> Self {
        RegistryError::InvalidOperationConfig {
            operation: spec.name.clone(),
            fields,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// One upstream's materialized output as seen by an operation.
#[derive(Debug, Clone)]
pub struct Upstream {
    /// Role name for operations with named inputs (`left`, `right`).
    pub role: Option<String>,
    pub records: Arc<Vec<Record>>,
}

/// Ordered upstream outputs handed to [`Operation::execute`].
#[derive(Debug, Clone, Default)]
pub struct OperationInput {
    pub upstreams: Vec<Upstream>,
}

impl OperationInput {
    pub fn single(records: Vec<Record>) -> Self {
        Self {
            upstreams: vec![Upstream {
                role: None,
                records: Arc::new(records),
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.upstreams.iter().map(|u| u.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenation of all upstreams in declared order.
    pub fn into_records(self) -> Vec<Record> {
        let mut out = Vec::with_capacity(self.len());
        for up in self.upstreams {
            match Arc::try_unwrap(up.records) {
                Ok(records) => out.extend(records),
                Err(shared) => out.extend(shared.iter().cloned()),
            }
        }
        out
    }

    pub fn role(&self, role: &str) -> Option<&Arc<Vec<Record>>> {
        self.upstreams
            .iter()
            .find(|u| u.role.as_deref() == Some(role))
            .map(|u| &u.records)
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Per-node view of the run handed to an executing operation.
#[derive(Debug, Clone)]
pub struct OpContext {
    /// Node name (`step/operation`), used for cost attribution.
    pub node: String,
    pub llm: Arc<dyn LlmDispatch>,
    pub cancel: CancellationToken,
    /// Upper bound on concurrent per-record calls.
    pub max_concurrency: usize,
}

impl OpContext {
    pub fn new(node: impl Into<String>, llm: Arc<dyn LlmDispatch>) -> Self {
        Self {
            node: node.into(),
            llm,
            cancel: CancellationToken::new(),
            max_concurrency: 8,
        }
    }

    /// A context for structural operations; any LLM call fails.
    pub fn structural(node: impl Into<String>) -> Self {
        Self::new(node, Arc::new(llm::NoLlm))
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    /// Issue one LLM call on behalf of this node.
    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, OperationError> {
        if self.cancel.is_cancelled() {
            return Err(OperationError::Cancelled);
        }
        self.llm.dispatch(&self.node, request).await
    }

    /// Run `f` over `items` with at most `max_concurrency` in flight,
    /// returning results in input order. Stops at the first error.
    pub async fn map_ordered<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        f: F,
    ) -> Result<Vec<R>, OperationError>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, OperationError>>,
    {
        stream::iter(items)
            .map(f)
            .buffered(self.max_concurrency.max(1))
            .try_collect()
            .await
    }
}

// ---------------------------------------------------------------------------
// Operation contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Operation: Send + Sync + std::fmt::Debug {
    /// The configuration this instance was built from.
    fn spec(&self) -> &OperationSpec;

    /// Implementation version; mixed into cache fingerprints.
    fn version(&self) -> &str {
        "1"
    }

    fn is_llm_backed(&self) -> bool {
        false
    }

    /// Whether the operation may be run on independent input batches whose
    /// outputs are concatenated.
    fn supports_partial(&self) -> bool {
        false
    }

    /// Named upstream roles, in the order they are passed to `execute`.
    fn input_roles(&self) -> &[&'static str] {
        &[]
    }

    async fn execute(
        &self,
        input: OperationInput,
        ctx: &OpContext,
    ) -> Result<Vec<Record>, OperationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transient_classification() {
        assert!(OperationError::Timeout(10).is_transient());
        assert!(OperationError::RateLimited("429".into()).is_transient());
        assert!(OperationError::Upstream { status: 503, message: String::new() }.is_transient());
        assert!(!OperationError::Upstream { status: 404, message: String::new() }.is_transient());
        assert!(!OperationError::Validation("schema".into()).is_transient());
        assert!(!OperationError::Auth("401".into()).is_transient());
        assert!(!OperationError::BadRequest("400".into()).is_transient());
    }

    #[test]
    fn invalid_config_names_fields() {
        let spec = OperationSpec::new("m", "map");
        let err = RegistryError::invalid(&spec, vec!["prompt".into(), "model".into()], "missing");
        assert_eq!(
            err.to_string(),
            "invalid config for operation 'm' (fields: prompt, model): missing"
        );
    }

    #[test]
    fn input_concatenates_in_declared_order() {
        let a: Record = json!({"i": 1}).as_object().cloned().unwrap_or_default();
        let b: Record = json!({"i": 2}).as_object().cloned().unwrap_or_default();
        let input = OperationInput {
            upstreams: vec![
                Upstream { role: Some("left".into()), records: Arc::new(vec![a]) },
                Upstream { role: Some("right".into()), records: Arc::new(vec![b]) },
            ],
        };
        assert_eq!(input.role("right").map(|r| r.len()), Some(1));
        let all = input.into_records();
        assert_eq!(all[0]["i"], 1);
        assert_eq!(all[1]["i"], 2);
    }

    #[tokio::test]
    async fn map_ordered_preserves_order() {
        let ctx = OpContext::structural("n").with_max_concurrency(4);
        let out = ctx
            .map_ordered((0..20u64).collect(), |i| async move {
                tokio::time::sleep(std::time::Duration::from_millis(20 - i)).await;
                Ok::<_, OperationError>(i * 2)
            })
            .await
            .unwrap();
        assert_eq!(out, (0..20u64).map(|i| i * 2).collect::<Vec<_>>());
    }
}
