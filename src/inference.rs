//! Structured inference capability.
//!
//! Every pipeline stage that needs a model (extract, plan, generate, repair,
//! summarize) goes through one operation: *given system instructions, a
//! conversation and a target type `T`, return an instance of `T`*.
//!
//! - **[`InferenceClient`]**: the provider seam; returns raw JSON that should
//!   match the requested output schema.
//! - **[`invoke`]**: typed entry point. Derives the JSON schema from
//!   `T: JsonSchema`, bounds the call with a timeout, and deserializes.
//! - **[`OpenAiClient`]**: OpenAI-compatible chat completions with
//!   `response_format: json_schema`.
//! - **[`ScriptedClient`]**: queued responses for tests and offline runs.
//!
//! # Retry Strategy
//!
//! The OpenAI client retries HTTP 429 and 5xx with exponential backoff
//! (1s, 2s, 4s, … capped at 2^5). Client errors fail immediately. Timeouts
//! and network errors are never retried: they surface as fatal
//! [`InferenceError`]s for the request.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::InferenceError;

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Name and JSON schema of the type a call must produce.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: String,
    pub schema: Value,
}

impl OutputSchema {
    pub fn of<T: JsonSchema>() -> Self {
        let schema = schemars::schema_for!(T);
        Self {
            name: T::schema_name(),
            schema: serde_json::to_value(schema).unwrap_or(Value::Null),
        }
    }
}

pub struct InferenceRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [ChatMessage],
    pub output: &'a OutputSchema,
}

/// A provider of structured inference.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Model identifier, for logs.
    fn model_name(&self) -> &str;

    /// Run one call and return the raw structured object.
    async fn complete(&self, request: InferenceRequest<'_>) -> Result<Value, InferenceError>;
}

/// Invoke `client` and decode the answer as `T`.
///
/// The whole call, including provider-side retries, is bounded by
/// `timeout`.
pub async fn invoke<T>(
    client: &dyn InferenceClient,
    system: &str,
    messages: &[ChatMessage],
    timeout: Duration,
) -> Result<T, InferenceError>
where
    T: DeserializeOwned + JsonSchema,
{
    let output = OutputSchema::of::<T>();
    let request = InferenceRequest {
        system,
        messages,
        output: &output,
    };

    debug!(target_type = %output.name, model = client.model_name(), "structured inference call");

    let value = tokio::time::timeout(timeout, client.complete(request))
        .await
        .map_err(|_| InferenceError::Timeout(timeout))??;

    serde_json::from_value(value)
        .map_err(|e| InferenceError::Malformed(format!("{}: {}", output.name, e)))
}

// ============ Disabled ============

/// Fails every call; used when `llm.provider = "disabled"`.
pub struct DisabledClient;

#[async_trait]
impl InferenceClient for DisabledClient {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: InferenceRequest<'_>) -> Result<Value, InferenceError> {
        Err(InferenceError::Disabled)
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAiClient {
    model: String,
    endpoint: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    http: reqwest::Client,
}

impl OpenAiClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` is not set, the API key environment
    /// variable is missing, or the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;

        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set", config.api_key_env)
        })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
            http,
        })
    }

    fn request_body(&self, request: &InferenceRequest<'_>) -> Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.system,
        })];
        messages.extend(
            request
                .messages
                .iter()
                .map(|m| serde_json::json!({ "role": m.role, "content": m.content })),
        );

        serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.output.name,
                    "schema": request.output.schema,
                    "strict": false,
                }
            }
        })
    }
}

#[async_trait]
impl InferenceClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: InferenceRequest<'_>) -> Result<Value, InferenceError> {
        let body = self.request_body(&request);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let response = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        InferenceError::Provider(format!("request timed out: {}", e))
                    } else {
                        InferenceError::Provider(e.to_string())
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                let json: Value = response
                    .json()
                    .await
                    .map_err(|e| InferenceError::Malformed(e.to_string()))?;
                return parse_chat_response(&json);
            }

            let body_text = response.text().await.unwrap_or_default();
            // Rate limited or server error: retry
            if status.as_u16() == 429 || status.is_server_error() {
                warn!(%status, attempt, "inference provider busy, retrying");
                last_err = Some(InferenceError::Provider(format!(
                    "API error {}: {}",
                    status, body_text
                )));
                continue;
            }

            return Err(InferenceError::Provider(format!(
                "API error {}: {}",
                status, body_text
            )));
        }

        Err(last_err
            .unwrap_or_else(|| InferenceError::Provider("inference failed after retries".into())))
    }
}

/// Extract and parse `choices[0].message.content` of a chat completion.
fn parse_chat_response(json: &Value) -> Result<Value, InferenceError> {
    let message = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| InferenceError::Malformed("response has no choices[0].message".into()))?;

    if let Some(refusal) = message.get("refusal").and_then(|r| r.as_str()) {
        return Err(InferenceError::Provider(format!("model refused: {}", refusal)));
    }

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| InferenceError::Malformed("response message has no content".into()))?;

    serde_json::from_str(strip_code_fence(content))
        .map_err(|e| InferenceError::Malformed(format!("content is not JSON: {}", e)))
}

/// Remove one surrounding markdown code fence, if present.
pub fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    if !text.starts_with("```") {
        return text;
    }
    let start = text.find('\n').map(|i| i + 1).unwrap_or(text.len());
    let body = &text[start..];
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Build the configured client.
///
/// | Config Value | Client |
/// |-------------|--------|
/// | `"disabled"` | [`DisabledClient`] |
/// | `"openai"` | [`OpenAiClient`] |
pub fn create_client(config: &LlmConfig) -> anyhow::Result<Box<dyn InferenceClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledClient)),
        "openai" => Ok(Box::new(OpenAiClient::new(config)?)),
        other => anyhow::bail!("Unknown llm provider: {}", other),
    }
}

// ============ Scripted ============

/// A recorded call made against a [`ScriptedClient`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub target: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
}

/// Replays queued responses per target type, in order.
///
/// Responses are keyed by the output schema name (`"QueryStructure"`,
/// `"Plan"`, `"GeneratedQuery"`, `"RepairedQuery"`, `"AnswerSummary"`).
/// A call for a target with an empty queue fails with
/// [`InferenceError::Provider`].
#[derive(Default)]
pub struct ScriptedClient {
    queues: Mutex<HashMap<String, VecDeque<Result<Value, InferenceError>>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response for `target`.
    pub fn respond(self, target: &str, value: Value) -> Self {
        self.push(target, Ok(value));
        self
    }

    /// Queue a failure for `target`.
    pub fn fail(self, target: &str, err: InferenceError) -> Self {
        self.push(target, Err(err));
        self
    }

    pub fn push(&self, target: &str, response: Result<Value, InferenceError>) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(target.to_string()).or_default().push_back(response);
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, target: &str) -> usize {
        self.calls().iter().filter(|c| c.target == target).count()
    }
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: InferenceRequest<'_>) -> Result<Value, InferenceError> {
        let target = request.output.name.clone();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                target: target.clone(),
                system: request.system.to_string(),
                messages: request.messages.to_vec(),
            });
        }

        let next = self
            .queues
            .lock()
            .ok()
            .and_then(|mut q| q.get_mut(&target).and_then(|q| q.pop_front()));

        next.unwrap_or_else(|| {
            Err(InferenceError::Provider(format!(
                "no scripted response for {}",
                target
            )))
        })
    }
}
