//! Google Gemini client.
//!
//! Epistemic foundation:
//! - K_i: Gemini uses `generateContent` with `user`/`model` roles
//! - K_i: System messages travel separately as `systemInstruction`
//! - B_i: API will respond within timeout (might fail)
//! - B_i: A candidate will carry text parts (might be blocked or empty)

use super::llm_client::{error_from_response, error_message};
use super::sse::{ChunkStream, data_lines};
use crate::client::{LlmProvider, RequestSettings};
use crate::models::{Completion, Message, ProviderError, Role};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GenerateContentResponse {
    /// Concatenated text parts of the first candidate.
    fn text(&mut self) -> String {
        self.candidates
            .drain(..)
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

/// Gemini `generateContent` client.
pub struct GeminiClient {
    client: reqwest::Client,
    name: String,
    api_key: String,
    base_url: String,
    settings: RequestSettings,
}

impl GeminiClient {
    pub fn new(
        name: String,
        api_key: String,
        base_url: String,
        settings: RequestSettings,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeout)
            .build()
            .map_err(ProviderError::Network)?;

        Ok(Self {
            client,
            name,
            api_key,
            base_url,
            settings,
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&self.api_key) {
            headers.insert("x-goog-api-key", value);
        }
        headers
    }

    fn map_send_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.settings.timeout)
        } else {
            ProviderError::Network(e)
        }
    }

    /// Split chat messages into Gemini contents plus a system instruction.
    fn build_request(&self, messages: &[Message]) -> GenerateContentRequest {
        let system_text: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let contents = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| Content {
                role: Some(
                    match m.role {
                        Role::Assistant => "model",
                        _ => "user",
                    }
                    .to_string(),
                ),
                parts: vec![Part {
                    text: Some(m.content.clone()),
                }],
            })
            .collect();

        GenerateContentRequest {
            contents,
            system_instruction: (!system_text.is_empty()).then(|| Content {
                role: None,
                parts: vec![Part {
                    text: Some(system_text.join("\n\n")),
                }],
            }),
            generation_config: GenerationConfig {
                temperature: self.settings.temperature,
                max_output_tokens: self.settings.max_tokens,
            },
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, messages: &[Message]) -> Result<Completion, ProviderError> {
        let start = Instant::now();
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.settings.model
        );
        let request = self.build_request(messages);

        debug!(
            provider = %self.name,
            model = %self.settings.model,
            contents = request.contents.len(),
            "Sending generateContent"
        );

        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(&request)
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let mut body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        let content = body.text();

        if content.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "No text in response candidates".to_string(),
            ));
        }

        let usage = body.usage_metadata.unwrap_or_default();

        Ok(Completion {
            content,
            model: body
                .model_version
                .unwrap_or_else(|| self.settings.model.clone()),
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            duration: start.elapsed(),
        })
    }

    async fn stream(&self, messages: &[Message]) -> Result<ChunkStream, ProviderError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.settings.model
        );
        let request = self.build_request(messages);

        debug!(
            provider = %self.name,
            model = %self.settings.model,
            contents = request.contents.len(),
            "Opening streamGenerateContent"
        );

        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let chunks = data_lines(response.bytes_stream().boxed()).filter_map(|item| async move {
            match item {
                Ok(data) => match serde_json::from_str::<GenerateContentResponse>(&data) {
                    Ok(mut event) => Some(event.text()).filter(|t| !t.is_empty()).map(Ok),
                    Err(e) => Some(Err(ProviderError::InvalidResponse(format!(
                        "Failed to parse stream event: {e}"
                    )))),
                },
                Err(e) => Some(Err(e)),
            }
        });

        Ok(chunks.boxed())
    }

    /// Health probe: fetch the configured model's metadata.
    async fn probe(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models/{}", self.base_url, self.settings.model);

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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GeminiClient {
        GeminiClient::new(
            "gemini".to_string(),
            "g-test".to_string(),
            server.uri(),
            RequestSettings {
                model: "gemini-1.5-flash".to_string(),
                max_tokens: 512,
                temperature: 0.7,
                timeout: Duration::from_secs(5),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_complete_maps_roles_and_system_instruction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .and(header("x-goog-api-key", "g-test"))
            .and(body_partial_json(json!({
                "systemInstruction": {"parts": [{"text": "be brief"}]},
                "contents": [
                    {"role": "user", "parts": [{"text": "hi"}]},
                    {"role": "model", "parts": [{"text": "hello"}]},
                    {"role": "user", "parts": [{"text": "again"}]}
                ],
                "generationConfig": {"maxOutputTokens": 512}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "sure"}, {"text": "!"}]}}],
                "usageMetadata": {"promptTokenCount": 9, "candidatesTokenCount": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let messages = [
            Message::system("be brief"),
            Message::user("hi"),
            Message::assistant("hello"),
            Message::user("again"),
        ];
        let completion = client(&server).complete(&messages).await.unwrap();
        assert_eq!(completion.content, "sure!");
        assert_eq!(completion.input_tokens, 9);
        assert_eq!(completion.model, "gemini-1.5-flash");
    }

    #[tokio::test]
    async fn test_blocked_candidate_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"finishReason": "SAFETY"}]
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .complete(&[Message::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_stream_concatenates_event_text() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"lo\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"finishReason\":\"STOP\"}]}\r\n\r\n",
        );
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(header("x-goog-api-key", "g-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let chunks: Vec<String> = client(&server)
            .stream(&[Message::user("hi")])
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_retry_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "30")
                    .set_body_json(json!({"error": {"code": 429, "message": "quota"}})),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .complete(&[Message::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::RateLimited {
                retry_after_secs: Some(30.0),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_probe_reports_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/gemini-1.5-flash"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = client(&server).probe().await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 503, .. }));
    }
}
