//! The `Model` capability: a provider-agnostic LLM backend used by both
//! the triage pool and the investigation pool, wrapped in retry and
//! circuit-breaker policy per the error-handling design.

pub mod circuit_breaker;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LlmConfig;
use crate::types::ModelError;
use circuit_breaker::CircuitBreakerRegistry;

/// A tool definition advertised to the model alongside a prompt, in the
/// same shape the `ToolRegistry` exposes to the investigation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// The model's response to a single `generate` call: free text, zero or
/// more tool calls, or both (some providers emit a thought alongside a
/// tool call).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// Pluggable LLM backend. Implementations hide provider differences
/// (OpenAI-compatible vs Anthropic-specific request/response shapes)
/// behind one `generate` call.
#[async_trait]
pub trait Model: Send + Sync {
    async fn generate(&self, prompt: &str, tools: &[ToolSpec]) -> Result<ModelResponse, ModelError>;

    /// Optional introspection hook used by `/status`.
    async fn circuit_breaker_metrics(&self) -> Option<HashMap<String, usize>> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
enum Provider {
    OpenRouter,
    OpenAi,
    Anthropic,
}

/// Cloud-backed `Model` implementation, auto-detecting a provider from
/// environment variables, with retry/backoff and a circuit breaker
/// layered on top.
pub struct CloudModel {
    http: reqwest::Client,
    provider: Provider,
    api_key: String,
    base_url: String,
    model_name: String,
    breaker: CircuitBreakerRegistry,
}

impl CloudModel {
    pub fn from_env(config: &LlmConfig) -> Option<Self> {
        let (provider, default_base, env_key, default_model) =
            if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
                return Some(Self::new(
                    Provider::OpenRouter,
                    key,
                    std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| "https://openrouter.ai/api/v1".into()),
                    config.model.clone().unwrap_or_else(|| "openrouter/auto".into()),
                ));
            } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                (Provider::OpenAi, "https://api.openai.com/v1", "OPENAI_API_KEY", "gpt-4o-mini")
            } else if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
                let _ = key;
                (Provider::Anthropic, "https://api.anthropic.com/v1", "ANTHROPIC_API_KEY", "claude-3-5-sonnet-latest")
            } else {
                return None;
            };
        let key = std::env::var(env_key).ok()?;
        Some(Self::new(
            provider,
            key,
            default_base.to_string(),
            config.model.clone().unwrap_or_else(|| default_model.to_string()),
        ))
    }

    fn new(provider: Provider, api_key: String, base_url: String, model_name: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            provider,
            api_key,
            base_url,
            model_name,
            breaker: CircuitBreakerRegistry::default(),
        }
    }

    fn backend_key(&self) -> String {
        match self.provider {
            Provider::OpenRouter => "openrouter".into(),
            Provider::OpenAi => "openai".into(),
            Provider::Anthropic => "anthropic".into(),
        }
    }

    async fn call_once(&self, prompt: &str, tools: &[ToolSpec]) -> Result<ModelResponse, ModelError> {
        match self.provider {
            Provider::OpenRouter | Provider::OpenAi => self.openai_completion(prompt, tools).await,
            Provider::Anthropic => self.anthropic_completion(prompt, tools).await,
        }
    }

    async fn openai_completion(&self, prompt: &str, tools: &[ToolSpec]) -> Result<ModelResponse, ModelError> {
        let openai_tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": { "name": t.name, "description": t.description, "parameters": t.input_schema }
                })
            })
            .collect();

        let body = serde_json::json!({
            "model": self.model_name,
            "messages": [{ "role": "user", "content": prompt }],
            "tools": openai_tools,
        });

        let started = std::time::Instant::now();
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = resp.status();
        let value: Value = resp.json().await.map_err(|e| ModelError::Transient(e.to_string()))?;
        tracing::info!(latency_ms = started.elapsed().as_millis() as u64, status = status.as_u16(), "model call completed");

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &value));
        }

        let choice = value
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| ModelError::Permanent("missing choices in response".into()))?;
        let message = choice.get("message").cloned().unwrap_or(Value::Null);
        let text = message.get("content").and_then(|v| v.as_str()).map(str::to_string);
        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        let name = tc.get("function")?.get("name")?.as_str()?.to_string();
                        let args_raw = tc.get("function")?.get("arguments")?.as_str()?;
                        let arguments = serde_json::from_str(args_raw).unwrap_or(Value::Null);
                        Some(ToolCall { name, arguments })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ModelResponse { text, tool_calls })
    }

    async fn anthropic_completion(&self, prompt: &str, tools: &[ToolSpec]) -> Result<ModelResponse, ModelError> {
        let anthropic_tools: Vec<Value> = tools
            .iter()
            .map(|t| serde_json::json!({ "name": t.name, "description": t.description, "input_schema": t.input_schema }))
            .collect();

        let body = serde_json::json!({
            "model": self.model_name,
            "max_tokens": 4096,
            "messages": [{ "role": "user", "content": prompt }],
            "tools": anthropic_tools,
        });

        let started = std::time::Instant::now();
        let resp = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = resp.status();
        let value: Value = resp.json().await.map_err(|e| ModelError::Transient(e.to_string()))?;
        tracing::info!(latency_ms = started.elapsed().as_millis() as u64, status = status.as_u16(), "model call completed");

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &value));
        }

        let mut text = None;
        let mut tool_calls = Vec::new();
        if let Some(blocks) = value.get("content").and_then(|v| v.as_array()) {
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        text = block.get("text").and_then(|v| v.as_str()).map(str::to_string);
                    }
                    Some("tool_use") => {
                        if let (Some(name), Some(input)) = (
                            block.get("name").and_then(|v| v.as_str()),
                            block.get("input"),
                        ) {
                            tool_calls.push(ToolCall { name: name.to_string(), arguments: input.clone() });
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(ModelResponse { text, tool_calls })
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> ModelError {
    if e.is_timeout() || e.is_connect() {
        ModelError::Transient(e.to_string())
    } else {
        ModelError::Permanent(e.to_string())
    }
}

fn classify_status(status: u16, body: &Value) -> ModelError {
    let detail = body
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("upstream error")
        .to_string();
    match status {
        429 | 500..=599 => ModelError::Transient(detail),
        _ => ModelError::Permanent(detail),
    }
}

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[async_trait]
impl Model for CloudModel {
    async fn generate(&self, prompt: &str, tools: &[ToolSpec]) -> Result<ModelResponse, ModelError> {
        let key = self.backend_key();
        self.breaker
            .check(&key)
            .await
            .map_err(|e| ModelError::CircuitOpen(e.to_string()))?;

        let mut attempt = 0;
        loop {
            match self.call_once(prompt, tools).await {
                Ok(resp) => {
                    self.breaker.record_success(&key).await;
                    return Ok(resp);
                }
                Err(ModelError::Transient(msg)) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    let backoff = exponential_backoff_with_jitter(attempt, BASE_BACKOFF, MAX_BACKOFF);
                    tracing::warn!(attempt, backoff_ms = backoff.as_millis() as u64, error = %msg, "retrying transient model failure");
                    tokio::time::sleep(backoff).await;
                }
                Err(ModelError::Transient(msg)) => {
                    self.breaker.record_failure(&key).await;
                    return Err(ModelError::Transient(msg));
                }
                Err(other) => {
                    self.breaker.record_failure(&key).await;
                    return Err(other);
                }
            }
        }
    }

    async fn circuit_breaker_metrics(&self) -> Option<HashMap<String, usize>> {
        Some(self.breaker.snapshot().await)
    }
}

fn exponential_backoff_with_jitter(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(10)).min(cap);
    let jitter_ms = rand::thread_rng().gen_range(0..=(exp.as_millis() as u64).max(1));
    Duration::from_millis(jitter_ms)
}

/// No-op model used when no provider credentials are configured; always
/// reports a permanent failure rather than hanging ingestion.
pub struct UnconfiguredModel;

#[async_trait]
impl Model for UnconfiguredModel {
    async fn generate(&self, _prompt: &str, _tools: &[ToolSpec]) -> Result<ModelResponse, ModelError> {
        Err(ModelError::Permanent("no model backend configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap() {
        for attempt in 0..12 {
            let d = exponential_backoff_with_jitter(attempt, BASE_BACKOFF, MAX_BACKOFF);
            assert!(d <= MAX_BACKOFF);
        }
    }

    #[tokio::test]
    async fn unconfigured_model_always_fails_permanently() {
        let model = UnconfiguredModel;
        let err = model.generate("hi", &[]).await.unwrap_err();
        assert!(matches!(err, ModelError::Permanent(_)));
    }
}
