//! Scripted in-process LLM client for tests and dry runs.
//!
//! Responses are chosen by the first rule whose pattern occurs in the prompt,
//! then by an optional responder closure, then by a default. Failures queued
//! with [`ScriptedLlm::fail_next`] are returned before any response.

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient};
use crate::OperationError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Arc<dyn Fn(&CompletionRequest) -> Result<String, OperationError> + Send + Sync>;

#[derive(Default)]
pub struct ScriptedLlm {
    rules: Vec<(String, String)>,
    responder: Option<Responder>,
    default_response: Option<String>,
    failures: Mutex<VecDeque<OperationError>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl fmt::Debug for ScriptedLlm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedLlm")
            .field("rules", &self.rules.len())
            .field("calls", &self.calls.load(Ordering::SeqCst))
            .finish()
    }
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with `response` whenever the prompt contains `pattern`.
    pub fn when(mut self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.push((pattern.into(), response.into()));
        self
    }

    pub fn respond_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, OperationError> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(f));
        self
    }

    pub fn otherwise(mut self, response: impl Into<String>) -> Self {
        self.default_response = Some(response.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a failure returned by the next call.
    pub fn fail_next(self, err: OperationError) -> Self {
        if let Ok(mut q) = self.failures.lock() {
            q.push_back(err);
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn pick(&self, request: &CompletionRequest) -> Result<String, OperationError> {
        if let Some((_, response)) = self
            .rules
            .iter()
            .find(|(pattern, _)| request.prompt.contains(pattern.as_str()))
        {
            return Ok(response.clone());
        }
        if let Some(responder) = &self.responder {
            return responder(request);
        }
        self.default_response.clone().ok_or_else(|| {
            OperationError::BadRequest(format!("no scripted response for prompt: {}", request.prompt))
        })
    }
}

fn word_count(s: &str) -> u64 {
    s.split_whitespace().count().max(1) as u64
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self.failures.lock().ok().and_then(|mut q| q.pop_front());
        if let Some(err) = queued {
            return Err(err);
        }

        let text = self.pick(request)?;
        Ok(CompletionResponse {
            prompt_tokens: word_count(&request.prompt),
            completion_tokens: word_count(&text),
            model: request.model.clone(),
            text,
        })
    }
}
