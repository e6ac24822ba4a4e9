//! Provider client for OpenAI-compatible endpoints.
//!
//! Epistemic foundation:
//! - K_i: OpenAI API schema is the de facto standard
//! - K_i: Groq, OpenRouter, vLLM and Ollama all speak it
//! - B_i: API will respond within timeout (might fail)
//! - B_i: Response will be valid JSON (might fail)
//! - I^B: Network availability unknowable → the router falls back instead of retrying

use super::sse::{ChunkStream, data_lines};
use crate::models::{Completion, Message, ProviderError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// A backend that can answer a chat request.
///
/// Implementations make exactly one attempt per call; fallback and quota
/// accounting live in the router.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (unique across the registry)
    fn name(&self) -> &str;

    /// Model identifier sent with each request
    fn model(&self) -> &str;

    /// Send one chat completion request.
    async fn complete(&self, messages: &[Message]) -> Result<Completion, ProviderError>;

    /// Send one streamed chat request.
    ///
    /// The returned stream yields non-empty text chunks. Providers without
    /// native streaming answer with their whole completion as one chunk.
    async fn stream(&self, messages: &[Message]) -> Result<ChunkStream, ProviderError> {
        let completion = self.complete(messages).await?;
        Ok(stream::once(async move { Ok(completion.content) }).boxed())
    }

    /// Minimal authenticated round-trip used by health probing.
    async fn probe(&self) -> Result<(), ProviderError>;
}

/// Per-request generation settings.
#[derive(Debug, Clone)]
pub struct RequestSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
}

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f64,
    stream: bool,
}

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// One `chat.completion.chunk` event.
#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Extract a readable message from an error body, falling back to the raw text.
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.chars().take(500).collect())
}

/// Turn a non-success response into a provider error, keeping any
/// `retry-after` hint on 429.
pub(crate) async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok());
    let body = response.text().await.unwrap_or_default();

    match ProviderError::from_status(status, error_message(&body)) {
        ProviderError::RateLimited { message, .. } => ProviderError::RateLimited {
            message,
            retry_after_secs: retry_after,
        },
        other => other,
    }
}

/// Client for any OpenAI-compatible endpoint.
///
/// Supports:
/// - Groq, OpenRouter, Together AI, Fireworks (aggregators)
/// - vLLM, TGI, Ollama, llama.cpp (on-prem)
pub struct LlmClient {
    client: reqwest::Client,
    /// Name of this provider (for logging)
    name: String,
    /// API key (None for local endpoints without auth)
    api_key: Option<String>,
    /// Base URL for the API
    base_url: String,
    /// Custom headers to include in requests
    custom_headers: HashMap<String, String>,
    settings: RequestSettings,
}

impl LlmClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// - `name`: Provider name for logging (e.g., "groq", "local")
    /// - `api_key`: Optional API key (None for local endpoints)
    /// - `base_url`: Base URL for the API, without trailing slash
    /// - `custom_headers`: Additional headers to include in requests
    /// - `settings`: Model and generation parameters
    pub fn new(
        name: String,
        api_key: Option<String>,
        base_url: String,
        custom_headers: HashMap<String, String>,
        settings: RequestSettings,
    ) -> Result<Self, ProviderError> {
        // whole-request timeouts are set per call; a stream may outlive them
        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeout)
            .build()
            .map_err(ProviderError::Network)?;

        Ok(Self {
            client,
            name,
            api_key,
            base_url,
            custom_headers,
            settings,
        })
    }

    /// Build headers for a request.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // Add Authorization header if API key is present
        if let Some(api_key) = &self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        // Add custom headers
        for (key, value) in &self.custom_headers {
            if let (Ok(name), Ok(val)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }

        headers
    }

    fn request(&self, messages: &[Message], stream: bool) -> reqwest::RequestBuilder {
        let request = ChatCompletionRequest {
            model: &self.settings.model,
            messages,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            stream,
        };
        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .headers(self.headers())
            .json(&request)
    }

    fn map_send_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.settings.timeout)
        } else {
            ProviderError::Network(e)
        }
    }
}

#[async_trait]
impl LlmProvider for LlmClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    /// Complete a chat request.
    ///
    /// B_i(API available) → Result
    /// B_i(valid response) → Result
    async fn complete(&self, messages: &[Message]) -> Result<Completion, ProviderError> {
        let start = Instant::now();
        debug!(
            provider = %self.name,
            model = %self.settings.model,
            messages = messages.len(),
            "Sending chat completion"
        );

        let response = self
            .request(messages, false)
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        // Parse successful response
        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("No content in response".to_string()))?;

        let usage = body.usage.unwrap_or_default();

        Ok(Completion {
            content,
            model: body.model.unwrap_or_else(|| self.settings.model.clone()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            duration: start.elapsed(),
        })
    }

    /// Streamed completion over server-sent `chat.completion.chunk` events.
    async fn stream(&self, messages: &[Message]) -> Result<ChunkStream, ProviderError> {
        debug!(
            provider = %self.name,
            model = %self.settings.model,
            messages = messages.len(),
            "Opening chat completion stream"
        );

        let response = self
            .request(messages, true)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let chunks = data_lines(response.bytes_stream().boxed()).filter_map(|item| async move {
            match item {
                Ok(data) => match serde_json::from_str::<ChatStreamChunk>(&data) {
                    Ok(chunk) => chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|text| !text.is_empty())
                        .map(Ok),
                    Err(e) => Some(Err(ProviderError::InvalidResponse(format!(
                        "Failed to parse stream chunk: {e}"
                    )))),
                },
                Err(e) => Some(Err(e)),
            }
        });

        Ok(chunks.boxed())
    }

    /// Health probe: ping the /models endpoint.
    ///
    /// K_i: endpoint is reachable and accepts our credential
    async fn probe(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models", self.base_url);

        let response = self
            .client
            .get(&url)
            .headers(self.headers())
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ProviderError::from_status(status.as_u16(), error_message(&body)))
        }
    }
}
