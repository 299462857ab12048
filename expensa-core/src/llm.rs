//! Model client — chat completions against the Groq OpenAI-compatible API.
//!
//! Two entry points:
//! - [`ChatClient::chat_completion`] — one request, one reply string
//! - [`ChatClient::chat_completion_stream`] — a [`FragmentStream`] yielding one
//!   item per server-sent chunk that carries content; `None` ends the reply
//!
//! Apart from construction (which fails without an API key), every call
//! resolves to text: provider failures become user-facing apology strings.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::RetryIf;

use crate::models::MessageRole;
use crate::retry::doubling_delays;

pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const PROVIDER: &str = "Groq";

pub const HIGH_DEMAND_MESSAGE: &str =
    "I apologize, but I'm currently experiencing high demand. Please try again in a few moments.";
pub const AUTH_MESSAGE: &str =
    "I apologize, but there's an authentication issue. Please check your API configuration.";
pub const PERMISSION_MESSAGE: &str =
    "I apologize, but I don't have permission to access this service.";
pub const UNAVAILABLE_MESSAGE: &str =
    "I apologize, but the service is currently experiencing technical difficulties. Please try again later.";
pub const EMPTY_RESPONSE_MESSAGE: &str =
    "I apologize, but I received an empty response. Please try again.";
pub const INVALID_RESPONSE_MESSAGE: &str =
    "I apologize, but I received an invalid response format.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Lazy, finite sequence of reply fragments. Not restartable: each call to
/// [`ChatBackend::chat_completion_stream`] issues a new request.
pub type FragmentStream = Pin<Box<dyn Stream<Item = String> + Send>>;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl From<MessageRole> for ChatRole {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::User => ChatRole::User,
            MessageRole::Assistant => ChatRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limit exceeded: {message}")]
    RateLimited { message: String },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("GROQ_API_KEY environment variable is required")]
    MissingApiKey,
}

impl LlmError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }

    /// The text shown to the user in place of a reply.
    pub fn user_message(&self) -> String {
        match self {
            LlmError::RateLimited { .. } => HIGH_DEMAND_MESSAGE.to_string(),
            LlmError::Api { status, .. } => classify_status(*status, &self.to_string()),
            LlmError::InvalidResponse(_) => INVALID_RESPONSE_MESSAGE.to_string(),
            other => apology(other),
        }
    }
}

/// Map a provider status code to the user-facing message.
pub fn classify_status(status: u16, description: &str) -> String {
    match status {
        401 => {
            tracing::error!("Authentication failed - check API key");
            AUTH_MESSAGE.to_string()
        }
        403 => {
            tracing::error!("Access forbidden - check API permissions");
            PERMISSION_MESSAGE.to_string()
        }
        429 => HIGH_DEMAND_MESSAGE.to_string(),
        s if s >= 500 => {
            tracing::error!(status = s, "Provider server error");
            UNAVAILABLE_MESSAGE.to_string()
        }
        s => {
            tracing::error!(status = s, description, "Provider API error");
            format!("I apologize, but I encountered an error: {description}")
        }
    }
}

fn apology(error: &dyn std::fmt::Display) -> String {
    format!("I apologize, but I encountered an error: {error}")
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub base_url: String,
}

impl ModelConfig {
    /// Explicit arguments win; otherwise `GROQ_API_KEY` and `GROQ_MODEL`.
    pub fn new(api_key: Option<String>, model: Option<String>) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("GROQ_API_KEY").ok())
            .unwrap_or_default();
        let model = model
            .or_else(|| std::env::var("GROQ_MODEL").ok())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Self {
            api_key,
            model,
            max_tokens: 4096,
            temperature: 0.7,
            max_retries: 3,
            retry_delay_ms: 1000,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    fn backoff(&self) -> Vec<Duration> {
        doubling_delays(Duration::from_millis(self.retry_delay_ms), self.max_retries)
    }
}

/// Settings that may change after construction. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub provider: String,
}

// ============================================================================
// Wire types (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// One decoded server-sent-events line.
#[derive(Debug, PartialEq)]
enum SseLine {
    Content(String),
    Done,
    Error(String),
}

fn parse_sse_line(line: &str) -> Option<SseLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?.trim_start();

    if data == "[DONE]" {
        return Some(SseLine::Done);
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return Some(SseLine::Error(error.message));
            }
            chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta)
                .and_then(|d| d.content)
                .filter(|c| !c.is_empty())
                .map(SseLine::Content)
        }
        Err(e) => {
            tracing::warn!(error = %e, data, "Failed to parse SSE chunk");
            None
        }
    }
}

/// First choice's content, trimmed, or the matching placeholder.
fn extract_reply(response: CompletionResponse) -> String {
    let Some(choice) = response.choices.into_iter().next() else {
        tracing::error!("Invalid response format: no choices");
        return INVALID_RESPONSE_MESSAGE.to_string();
    };

    match choice.message.and_then(|m| m.content) {
        Some(content) if !content.trim().is_empty() => content.trim().to_string(),
        _ => {
            tracing::warn!("Empty response content received");
            EMPTY_RESPONSE_MESSAGE.to_string()
        }
    }
}

// ============================================================================
// Request context
// ============================================================================

/// A snapshot of the client taken at the start of a call, so that
/// `update_config` never changes a request in flight.
#[derive(Debug, Clone)]
struct RequestContext {
    http: Client,
    config: ModelConfig,
}

impl RequestContext {
    fn request<'a>(&'a self, messages: &'a [ChatMessage], stream: bool) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: Some(self.config.temperature),
            stream,
        }
    }

    async fn send(&self, body: &CompletionRequest<'_>) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let mut request = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(body);
        if !body.stream {
            request = request.timeout(REQUEST_TIMEOUT);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&error_body)
            .ok()
            .and_then(|e| e.error)
            .map(|e| e.message)
            .unwrap_or(error_body);

        if status == StatusCode::TOO_MANY_REQUESTS {
            Err(LlmError::RateLimited { message })
        } else {
            Err(LlmError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn fetch(&self, body: &CompletionRequest<'_>) -> Result<CompletionResponse, LlmError> {
        let response = self.send(body).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }

    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let response = self.fetch(&self.request(messages, false)).await?;
        Ok(extract_reply(response))
    }

    /// Retry after a rate-limit signal: attempt `k` waits `retry_delay * 2^k`
    /// and only rate limits are retried.
    async fn retry_rate_limited(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let mut delays = self.config.backoff().into_iter();
        let Some(first) = delays.next() else {
            return Err(LlmError::RateLimited {
                message: "no retries configured".to_string(),
            });
        };

        tracing::info!(wait_ms = first.as_millis() as u64, "Rate limited, waiting before retry");
        tokio::time::sleep(first).await;

        RetryIf::spawn(
            delays,
            || self.complete_once(messages),
            LlmError::is_rate_limited,
        )
        .await
    }

    async fn complete(&self, messages: &[ChatMessage]) -> String {
        let result = match self.complete_once(messages).await {
            Err(e) if e.is_rate_limited() => {
                tracing::warn!(error = %e, "Rate limit exceeded");
                self.retry_rate_limited(messages).await
            }
            other => other,
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_rate_limited() {
                    tracing::warn!(
                        attempts = self.config.max_retries,
                        "All rate-limit retries exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Chat completion failed");
                }
                e.user_message()
            }
        }
    }
}

// ============================================================================
// ChatBackend trait
// ============================================================================

/// Abstraction over chat-completion providers.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Single reply for the whole message history. Never fails; failures are
    /// rendered as placeholder text.
    async fn chat_completion(&self, messages: &[ChatMessage]) -> String;

    /// Streaming reply. The consumer concatenates fragments.
    fn chat_completion_stream(&self, messages: Vec<ChatMessage>) -> FragmentStream;

    fn update_config(&self, update: ConfigUpdate);

    fn model_info(&self) -> ModelInfo;

    /// Minimal round trip; `false` on any failure.
    async fn test_connection(&self) -> bool;
}

// ============================================================================
// ChatClient
// ============================================================================

#[derive(Debug)]
pub struct ChatClient {
    http: Client,
    config: RwLock<ModelConfig>,
}

impl ChatClient {
    pub fn new(config: ModelConfig) -> Result<Self, LlmError> {
        if config.api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        tracing::info!(model = %config.model, "Initialized chat client");

        Ok(Self {
            http,
            config: RwLock::new(config),
        })
    }

    /// Create a client against a custom base URL (for testing / integration)
    pub fn with_base_url(mut config: ModelConfig, base_url: String) -> Result<Self, LlmError> {
        config.base_url = base_url;
        Self::new(config)
    }

    fn snapshot(&self) -> RequestContext {
        let config = self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        RequestContext {
            http: self.http.clone(),
            config,
        }
    }

    pub async fn chat_completion(&self, messages: &[ChatMessage]) -> String {
        self.snapshot().complete(messages).await
    }

    pub fn chat_completion_stream(&self, messages: Vec<ChatMessage>) -> FragmentStream {
        let ctx = self.snapshot();

        Box::pin(async_stream::stream! {
            let response = match ctx.send(&ctx.request(&messages, true)).await {
                Ok(response) => response,
                Err(e) if e.is_rate_limited() => {
                    tracing::warn!(error = %e, "Rate limit exceeded during streaming");
                    let reply = match ctx.retry_rate_limited(&messages).await {
                        Ok(reply) => reply,
                        Err(e) => e.user_message(),
                    };
                    yield reply;
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "API error during streaming");
                    yield e.user_message();
                    return;
                }
            };

            let mut body = response.bytes_stream().fuse();
            let mut buffer: Vec<u8> = Vec::new();

            loop {
                let line = match buffer.iter().position(|b| *b == b'\n') {
                    Some(end) => buffer.drain(..=end).collect::<Vec<u8>>(),
                    None => match body.next().await {
                        Some(Ok(bytes)) => {
                            buffer.extend_from_slice(&bytes);
                            continue;
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Unexpected error in streaming completion");
                            yield apology(&e);
                            return;
                        }
                        // Upstream closed; flush a trailing unterminated line.
                        None => std::mem::take(&mut buffer),
                    },
                };

                if line.is_empty() {
                    return;
                }

                match parse_sse_line(&String::from_utf8_lossy(&line)) {
                    Some(SseLine::Content(fragment)) => yield fragment,
                    Some(SseLine::Done) => return,
                    Some(SseLine::Error(message)) => {
                        tracing::error!(message = %message, "Provider error during streaming");
                        yield apology(&message);
                        return;
                    }
                    None => {}
                }
            }
        })
    }

    /// Merge recognised settings into the live configuration.
    pub fn update_config(&self, update: ConfigUpdate) {
        let mut config = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(max_tokens) = update.max_tokens {
            config.max_tokens = max_tokens;
        }
        if let Some(temperature) = update.temperature {
            config.temperature = temperature;
        }
        if let Some(model) = update.model {
            config.model = model;
        }
        tracing::info!(
            model = %config.model,
            max_tokens = config.max_tokens,
            temperature = config.temperature,
            "Updated configuration"
        );
    }

    pub fn model_info(&self) -> ModelInfo {
        let config = self.snapshot().config;
        ModelInfo {
            model: config.model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            provider: PROVIDER.to_string(),
        }
    }

    pub async fn test_connection(&self) -> bool {
        let ctx = self.snapshot();
        let probe = [ChatMessage::user("Hello")];
        let body = CompletionRequest {
            model: &ctx.config.model,
            messages: &probe,
            max_tokens: 5,
            temperature: None,
            stream: false,
        };

        match ctx.fetch(&body).await {
            Ok(response) => {
                let has_content = response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message)
                    .and_then(|m| m.content)
                    .is_some_and(|c| !c.is_empty());
                if has_content {
                    tracing::info!("Chat API connection test successful");
                } else {
                    tracing::warn!("Chat API connection test failed - empty response");
                }
                has_content
            }
            Err(e) => {
                tracing::error!(error = %e, "Chat API connection test failed");
                false
            }
        }
    }
}

#[async_trait]
impl ChatBackend for ChatClient {
    async fn chat_completion(&self, messages: &[ChatMessage]) -> String {
        ChatClient::chat_completion(self, messages).await
    }

    fn chat_completion_stream(&self, messages: Vec<ChatMessage>) -> FragmentStream {
        ChatClient::chat_completion_stream(self, messages)
    }

    fn update_config(&self, update: ConfigUpdate) {
        ChatClient::update_config(self, update)
    }

    fn model_info(&self) -> ModelInfo {
        ChatClient::model_info(self)
    }

    async fn test_connection(&self) -> bool {
        ChatClient::test_connection(self).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
