/// LLM Client: the single point of entry for every generative-text completion.
///
/// ARCHITECTURAL RULE: stages never call the completion endpoint directly.
/// Everything goes through `CompletionClient` so calls stay cacheable and classified.
///
/// Retries are NOT done here. A transient failure is classified and handed back to
/// the task broker, which owns backoff for the whole stage.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::{ErrorKind, TaskError};

pub mod prompts;

/// Sampling parameters for the completions the pipeline issues. Generation
/// uses `temperature`; structuring and ATS scoring use `scoring_temperature`.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub model: String,
    pub temperature: f32,
    pub scoring_temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            scoring_temperature: 0.1,
            max_tokens: 3000,
            top_p: 1.0,
        }
    }
}

impl LlmSettings {
    pub fn request(&self, prompt: String) -> CompletionRequest {
        self.with_temperature(prompt, self.temperature)
    }

    /// Low-temperature request for answers that must follow a JSON shape.
    pub fn scoring_request(&self, prompt: String) -> CompletionRequest {
        self.with_temperature(prompt, self.scoring_temperature)
    }

    fn with_temperature(&self, prompt: String, temperature: f32) -> CompletionRequest {
        CompletionRequest {
            prompt,
            model: self.model.clone(),
            temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
        }
    }
}

/// One completion call. Every field participates in the cache fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM returned empty content")]
    EmptyContent,
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::Http(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                ErrorKind::TransientExternal
            }
            // A body that failed to decode is a malformed response, not a bad request.
            LlmError::Http(e) if e.is_decode() || e.is_body() => ErrorKind::TransientExternal,
            LlmError::Http(_) => ErrorKind::ExternalRejected,
            LlmError::Api { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::TransientExternal
            }
            LlmError::Api { .. } => ErrorKind::ExternalRejected,
            LlmError::Timeout(_) => ErrorKind::TransientExternal,
            LlmError::EmptyContent => ErrorKind::ExternalRejected,
        }
    }
}

impl From<LlmError> for TaskError {
    fn from(e: LlmError) -> Self {
        TaskError::new(e.kind(), format!("completion failed: {e}"))
    }
}

/// Generative-text completion. Swappable so tests never touch the network.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoiceMessage {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl ChatResponse {
    /// Extracts the text of the first choice.
    pub fn text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .filter(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Client for an OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: String, timeout: Duration) -> Result<Self, LlmError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout)
                } else {
                    LlmError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Try to parse error message
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            warn!("Completion API returned {}: {}", status, message);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        if let Some(usage) = &parsed.usage {
            debug!(
                "Completion succeeded: prompt_tokens={}, completion_tokens={}",
                usage.prompt_tokens, usage.completion_tokens
            );
        }

        parsed
            .text()
            .map(str::to_string)
            .ok_or(LlmError::EmptyContent)
    }
}

/// Strips ```lang ... ``` or ``` ... ``` code fences from LLM output.
pub fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("json", "markdown", ...) up to the first newline.
    let body = match rest.find('\n') {
        Some(newline) if !rest[..newline].contains(char::is_whitespace) => &rest[newline + 1..],
        _ => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .map(str::trim)
        .unwrap_or_else(|| body.trim())
}
