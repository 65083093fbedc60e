//! HTTP transports for the supported LLM providers.
//!
//! Groq, OpenAI and Gemini all accept the OpenAI chat-completions format
//! (Gemini through its `/v1beta/openai` endpoint), so a single
//! [`OpenAiCompatTransport`] serves them. Anthropic uses its native Messages
//! API through [`AnthropicTransport`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{LlmTransport, ProviderKind};
use crate::config::LlmConfig;
use crate::error::{MailbotError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";

fn build_http_client(config: &LlmConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| MailbotError::config("llm.timeout_secs", e.to_string()))
}

/// Turn a non-success response into an error, keeping the body for context
async fn error_from_response(provider: &str, response: reqwest::Response) -> MailbotError {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();

    let error = MailbotError::from_status(status, &headers, &body);
    warn!(provider, status, error = %error, "LLM request failed");
    error
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for OpenAI-compatible endpoints
pub struct OpenAiCompatTransport {
    kind: ProviderKind,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompatTransport {
    pub fn new(
        kind: ProviderKind,
        base_url: String,
        api_key: String,
        model: String,
        config: &LlmConfig,
    ) -> Result<Self> {
        Ok(Self {
            kind,
            http: build_http_client(config)?,
            base_url,
            api_key,
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmTransport for OpenAiCompatTransport {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        debug!(
            provider = %self.kind,
            model = %self.model,
            prompt_chars = prompt.len(),
            "Sending chat completion request"
        );

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(self.kind.name(), response).await);
        }

        let body: ChatCompletionResponse = response.json().await.map_err(|e| {
            MailbotError::InvalidResponse(format!("{}: failed to parse response: {}", self.kind, e))
        })?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                MailbotError::InvalidResponse(format!("{}: response has no content", self.kind))
            })
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Anthropic Messages API client
pub struct AnthropicTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl AnthropicTransport {
    pub fn new(base_url: String, api_key: String, model: String, config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            http: build_http_client(config)?,
            base_url,
            api_key,
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl LlmTransport for AnthropicTransport {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        debug!(model = %self.model, prompt_chars = prompt.len(), "Sending Anthropic messages request");

        let response = self
            .http
            .post(format!("{}/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response("anthropic", response).await);
        }

        let body: MessagesResponse = response.json().await.map_err(|e| {
            MailbotError::InvalidResponse(format!("anthropic: failed to parse response: {}", e))
        })?;

        let text: String = body
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();

        if text.is_empty() {
            return Err(MailbotError::InvalidResponse(
                "anthropic: response has no text content".to_string(),
            ));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn openai_transport(server: &MockServer, kind: ProviderKind) -> OpenAiCompatTransport {
        OpenAiCompatTransport::new(
            kind,
            server.uri(),
            "test-key".to_string(),
            kind.default_model().to_string(),
            &LlmConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_openai_compat_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "llama-3.1-8b-instant",
                "max_tokens": 1000
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"category\":\"JUNK\"}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = openai_transport(&server, ProviderKind::Groq);
        let text = transport.complete("classify this").await.unwrap();
        assert_eq!(text, "{\"category\":\"JUNK\"}");
    }

    #[tokio::test]
    async fn test_openai_compat_maps_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "12")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let transport = openai_transport(&server, ProviderKind::OpenAi);
        let err = transport.complete("hi").await.unwrap_err();
        assert!(matches!(err, MailbotError::RateLimitExceeded { retry_after: 12 }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_openai_compat_maps_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let transport = openai_transport(&server, ProviderKind::Gemini);
        let err = transport.complete("hi").await.unwrap_err();
        assert!(matches!(err, MailbotError::AuthError(_)));
    }

    #[tokio::test]
    async fn test_openai_compat_empty_choices_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let transport = openai_transport(&server, ProviderKind::OpenAi);
        let err = transport.complete("hi").await.unwrap_err();
        assert!(matches!(err, MailbotError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_anthropic_sends_version_header_and_joins_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "anthropic-key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [
                    {"type": "text", "text": "{\"category\":"},
                    {"type": "text", "text": "\"IMPORTANT\"}"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = AnthropicTransport::new(
            server.uri(),
            "anthropic-key".to_string(),
            "claude-3-haiku-20240307".to_string(),
            &LlmConfig::default(),
        )
        .unwrap();

        let text = transport.complete("classify").await.unwrap();
        assert_eq!(text, "{\"category\":\"IMPORTANT\"}");
    }

    #[tokio::test]
    async fn test_anthropic_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let transport = AnthropicTransport::new(
            server.uri(),
            "k".to_string(),
            "claude-3-haiku-20240307".to_string(),
            &LlmConfig::default(),
        )
        .unwrap();

        let err = transport.complete("classify").await.unwrap_err();
        assert!(matches!(err, MailbotError::ServerError { status: 529, .. }));
        assert!(err.is_transient());
    }
}
