//! LLM plumbing: completion types, the provider client trait, the dispatch
//! seam through which operations reach a provider, and an OpenAI-compatible
//! HTTP client.

use crate::pricing;
use crate::OperationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(default)]
    pub system: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON object response.
    #[serde(default)]
    pub json_output: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            prompt: prompt.into(),
            temperature: None,
            max_tokens: None,
            json_output: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }

    /// Rough token estimate used for `llm_tokens` admission (4 chars/token).
    pub fn estimated_tokens(&self) -> u32 {
        let chars = self.prompt.len() + self.system.as_ref().map_or(0, |s| s.len());
        let prompt = (chars / 4).max(1) as u32;
        prompt + self.max_tokens.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl CompletionResponse {
    pub fn cost_usd(&self) -> f64 {
        pricing::estimate_cost(self.prompt_tokens, self.completion_tokens, &self.model)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A model provider.
#[async_trait]
pub trait LlmClient: Send + Sync + std::fmt::Debug {
    async fn complete(&self, request: &CompletionRequest)
        -> Result<CompletionResponse, OperationError>;
}

/// The path an operation's LLM call takes through the run: admission,
/// retries and cost accounting live behind this trait.
#[async_trait]
pub trait LlmDispatch: Send + Sync + std::fmt::Debug {
    async fn dispatch(
        &self,
        node: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, OperationError>;
}

/// Dispatch straight to a client with no limits, retries or accounting.
#[derive(Debug, Clone)]
pub struct DirectDispatch {
    client: Arc<dyn LlmClient>,
}

impl DirectDispatch {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LlmDispatch for DirectDispatch {
    async fn dispatch(
        &self,
        _node: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, OperationError> {
        self.client.complete(&request).await
    }
}

/// Dispatch for contexts where no model is configured.
#[derive(Debug, Clone, Copy)]
pub struct NoLlm;

#[async_trait]
impl LlmDispatch for NoLlm {
    async fn dispatch(
        &self,
        node: &str,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, OperationError> {
        Err(OperationError::BadRequest(format!(
            "node '{node}' requested an LLM call but no client is configured"
        )))
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP client
// ---------------------------------------------------------------------------

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// `OPENAI_API_KEY` plus optional `OPENAI_BASE_URL`.
    pub fn from_env(timeout: Duration) -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Some(Self::new(base_url, api_key, timeout))
    }

    fn body(request: &CompletionRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        if request.json_output {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        body
    }
}

/// Map an HTTP failure status to the retry taxonomy.
pub fn classify_status(status: u16, message: String) -> OperationError {
    match status {
        401 | 403 => OperationError::Auth(message),
        408 => OperationError::Timeout(0),
        429 => OperationError::RateLimited(message),
        400..=499 => OperationError::BadRequest(message),
        _ => OperationError::Upstream { status, message },
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, OperationError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&Self::body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OperationError::Timeout(0)
                } else {
                    OperationError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OperationError::Upstream {
                status: status.as_u16(),
                message: format!("response parse failed: {e}"),
            })?;

        let text = result["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        tracing::debug!(model = %request.model, chars = text.len(), "completion received");

        Ok(CompletionResponse {
            text,
            model: result["model"]
                .as_str()
                .unwrap_or(&request.model)
                .to_string(),
            prompt_tokens: result["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: result["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        })
    }
}
