//! LLM dispatch for a run: budget check, rate-limit admission, deadline,
//! retry with backoff, then cost accounting.

use crate::context::RunContext;
use crate::retry::retry_transient;
use async_trait::async_trait;
use df_core::policy::resource;
use df_core::trace::ProgressEvent;
use df_ops::timeout::with_timeout;
use df_ops::{CompletionRequest, CompletionResponse, LlmClient, LlmDispatch, OperationError};
use df_policy::PolicyError;
use std::fmt;
use std::sync::Arc;

pub struct RunDispatch {
    run: RunContext,
    client: Arc<dyn LlmClient>,
}

impl fmt::Debug for RunDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunDispatch")
            .field("run_id", &self.run.run_id)
            .field("client", &self.client)
            .finish()
    }
}

impl RunDispatch {
    pub fn new(run: RunContext, client: Arc<dyn LlmClient>) -> Self {
        Self { run, client }
    }

    async fn attempt(&self, request: &CompletionRequest) -> Result<CompletionResponse, OperationError> {
        if self.run.is_cancelled() {
            return Err(OperationError::Cancelled);
        }
        self.run.ledger.check().map_err(policy_error)?;

        let limiter = &self.run.limiter;
        let _call = tokio::select! {
            _ = self.run.cancel.cancelled() => return Err(OperationError::Cancelled),
            permit = limiter.acquire(resource::LLM_CALL) => permit.map_err(policy_error)?,
        };
        let _tokens = tokio::select! {
            _ = self.run.cancel.cancelled() => return Err(OperationError::Cancelled),
            permit = limiter.acquire_units(resource::LLM_TOKENS, request.estimated_tokens()) => {
                permit.map_err(policy_error)?
            }
        };

        tokio::select! {
            _ = self.run.cancel.cancelled() => Err(OperationError::Cancelled),
            result = with_timeout(self.run.call_timeout_ms, self.client.complete(request)) => result,
        }
    }
}

fn policy_error(err: PolicyError) -> OperationError {
    match err {
        PolicyError::BudgetExceeded(msg) => OperationError::BudgetExceeded(msg),
        other => OperationError::ExecutionFailed(other.to_string()),
    }
}

#[async_trait]
impl LlmDispatch for RunDispatch {
    async fn dispatch(
        &self,
        node: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, OperationError> {
        let response = retry_transient(&self.run.retry, &self.run.cancel, node, |_| self.attempt(&request)).await?;

        let cost = response.cost_usd();
        let booked = self
            .run
            .ledger
            .record(node, response.prompt_tokens, response.completion_tokens, cost);
        self.run.emit(ProgressEvent::CostUpdated {
            total_usd: self.run.ledger.total_cost_usd(),
        });
        tracing::debug!(
            node,
            model = %response.model,
            prompt_tokens = response.prompt_tokens,
            completion_tokens = response.completion_tokens,
            cost_usd = cost,
            "llm call complete"
        );
        booked.map_err(policy_error)?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use df_core::pipeline::{RetryPolicy, RunSettings};
    use df_core::policy::{CostLimit, RateLimitSpec};
    use df_ops::mock::ScriptedLlm;
    use std::time::Duration;

    fn settings() -> RunSettings {
        let mut s = RunSettings::default();
        s.retry = RetryPolicy {
            max_retries: 2,
            backoff_ms: 1,
            backoff_multiplier: 1.0,
            max_backoff_ms: 1,
        };
        s
    }

    #[tokio::test]
    async fn books_cost_and_emits_update() {
        let llm = Arc::new(ScriptedLlm::new().otherwise("four words of output"));
        let sink = Arc::new(crate::progress::CollectingSink::new());
        let run = RunContext::from_settings(&settings()).with_sink(sink.clone());
        let dispatch = RunDispatch::new(run.clone(), llm);

        dispatch
            .dispatch("s/map", CompletionRequest::new("mock", "one two"))
            .await
            .unwrap();
        assert_eq!(run.ledger.total_calls(), 1);
        assert!(run.ledger.total_cost_usd() > 0.0);
        assert_eq!(run.ledger.node_cost("s/map").calls, 1);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, ProgressEvent::CostUpdated { .. })));
    }

    #[tokio::test]
    async fn retries_transient_provider_errors() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .otherwise("ok")
                .fail_next(OperationError::RateLimited("429".into())),
        );
        let run = RunContext::from_settings(&settings());
        let dispatch = RunDispatch::new(run.clone(), llm.clone());
        let out = dispatch.dispatch("n", CompletionRequest::new("mock", "x")).await.unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(llm.calls(), 2);
        assert_eq!(run.ledger.total_calls(), 1);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let llm = Arc::new(ScriptedLlm::new().otherwise("ok").fail_next(OperationError::Auth("401".into())));
        let dispatch = RunDispatch::new(RunContext::from_settings(&settings()), llm.clone());
        let err = dispatch.dispatch("n", CompletionRequest::new("mock", "x")).await.unwrap_err();
        assert!(matches!(err, OperationError::Auth(_)));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn slow_call_times_out_after_retries() {
        let llm = Arc::new(ScriptedLlm::new().otherwise("late").with_delay(Duration::from_millis(200)));
        let mut s = settings();
        s.call_timeout_ms = 10;
        let dispatch = RunDispatch::new(RunContext::from_settings(&s), llm.clone());
        let err = dispatch.dispatch("n", CompletionRequest::new("mock", "x")).await.unwrap_err();
        assert_eq!(err, OperationError::Timeout(10));
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn budget_refuses_further_calls() {
        let mut s = settings();
        s.cost_limit = Some(CostLimit {
            max_tokens: Some(3),
            ..Default::default()
        });
        let llm = Arc::new(ScriptedLlm::new().otherwise("a b c d e"));
        let dispatch = RunDispatch::new(RunContext::from_settings(&s), llm.clone());
        let first = dispatch.dispatch("n", CompletionRequest::new("mock", "x")).await;
        assert!(matches!(first, Err(OperationError::BudgetExceeded(_))));
        let second = dispatch.dispatch("n", CompletionRequest::new("mock", "x")).await;
        assert!(matches!(second, Err(OperationError::BudgetExceeded(_))));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn admission_caps_in_flight_calls() {
        let mut s = settings();
        s.rate_limits.insert(resource::LLM_CALL.into(), RateLimitSpec::new(2, Duration::from_millis(20)));
        let llm = Arc::new(ScriptedLlm::new().otherwise("ok").with_delay(Duration::from_millis(15)));
        let run = RunContext::from_settings(&s);
        let dispatch = Arc::new(RunDispatch::new(run.clone(), llm.clone()));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let d = Arc::clone(&dispatch);
                tokio::spawn(async move { d.dispatch("n", CompletionRequest::new("mock", format!("p{i}"))).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(llm.calls(), 6);
        assert!(llm.peak_concurrency() <= 2);
        assert!(run.limiter.peak_in_flight(resource::LLM_CALL) <= 2);
    }
}
