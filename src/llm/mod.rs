//! LLM provider abstraction
//!
//! The set of supported providers is closed: [`ProviderKind`] enumerates them
//! together with their capabilities, and [`LlmProvider`] pairs a kind with an
//! [`LlmTransport`] that performs the actual completion request. Selection is
//! always explicit; there is no automatic fallback between providers.

pub mod http;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{MailbotError, Result};
use crate::prompt::BatchPrompt;

pub use http::{AnthropicTransport, OpenAiCompatTransport};

static JSON_ARRAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\[.*\]").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Groq,
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Groq,
        ProviderKind::Gemini,
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Groq => "groq",
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    /// Whether one request may classify several messages at once
    pub fn supports_batch(&self) -> bool {
        !matches!(self, ProviderKind::Groq)
    }

    pub fn is_free_tier(&self) -> bool {
        matches!(self, ProviderKind::Groq | ProviderKind::Gemini)
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Groq => "llama-3.1-8b-instant",
            ProviderKind::Gemini => "gemini-1.5-flash",
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::Anthropic => "claude-3-haiku-20240307",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
        }
    }

    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::Groq => "GROQ_API_KEY",
            ProviderKind::Gemini => "GOOGLE_API_KEY",
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    /// Batch size used when the configuration leaves it unset
    pub fn default_batch_size(&self) -> usize {
        if self.supports_batch() {
            10
        } else {
            1
        }
    }

    /// True when the provider's API key is present in the environment
    pub fn has_api_key(&self) -> bool {
        std::env::var(self.api_key_env())
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = MailbotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(ProviderKind::Groq),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "auto" | "" => Err(MailbotError::config(
                "llm.provider",
                "a provider must be selected explicitly (groq, gemini, openai or anthropic)",
            )),
            other => Err(MailbotError::config(
                "llm.provider",
                format!(
                    "unknown provider '{}'; expected groq, gemini, openai or anthropic",
                    other
                ),
            )),
        }
    }
}

/// Sends a prompt to a model and returns the raw completion text
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[async_trait]
impl<T: LlmTransport + ?Sized> LlmTransport for Arc<T> {
    async fn complete(&self, prompt: &str) -> Result<String> {
        (**self).complete(prompt).await
    }
}

/// A provider kind bound to a transport
#[derive(Clone)]
pub struct LlmProvider {
    kind: ProviderKind,
    transport: Arc<dyn LlmTransport>,
}

impl fmt::Debug for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmProvider")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl LlmProvider {
    pub fn new(kind: ProviderKind, transport: Arc<dyn LlmTransport>) -> Self {
        Self { kind, transport }
    }

    /// Build the HTTP transport for `kind`, reading its API key from the
    /// environment.
    pub fn from_config(kind: ProviderKind, config: &LlmConfig) -> Result<Self> {
        let key_env = kind.api_key_env();
        let api_key = std::env::var(key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                MailbotError::config(
                    key_env,
                    format!("API key for provider '{}' is not set", kind),
                )
            })?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| kind.default_base_url().to_string());
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| kind.default_model().to_string());

        let transport: Arc<dyn LlmTransport> = match kind {
            ProviderKind::Anthropic => Arc::new(AnthropicTransport::new(
                base_url, api_key, model, config,
            )?),
            _ => Arc::new(OpenAiCompatTransport::new(
                kind, base_url, api_key, model, config,
            )?),
        };

        debug!(provider = %kind, "Initialized LLM transport");
        Ok(Self::new(kind, transport))
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn supports_batch(&self) -> bool {
        self.kind.supports_batch()
    }

    /// Raw model response for a single-message prompt
    pub async fn classify_one(&self, prompt: &str) -> Result<String> {
        self.transport.complete(prompt).await
    }

    /// One request for the whole batch. The result is aligned with
    /// `batch.ids`; `None` marks ids the model left out of its answer.
    pub async fn classify_batch(&self, batch: &BatchPrompt) -> Result<Vec<Option<String>>> {
        if !self.supports_batch() {
            return Err(MailbotError::UnsupportedOperation {
                provider: self.name().to_string(),
                operation: "batch classification".to_string(),
            });
        }

        let raw = self.transport.complete(&batch.text).await?;
        let mut by_id = split_batch_response(&raw)?;

        debug!(
            provider = %self.kind,
            requested = batch.ids.len(),
            answered = by_id.len(),
            "Batch response parsed"
        );

        Ok(batch.ids.iter().map(|id| by_id.remove(id)).collect())
    }
}

/// First `T` that parses from an `open` bracket in `raw`, ignoring whatever
/// follows it. Falls back to the widest bracketed span.
pub(crate) fn extract_json<T: DeserializeOwned>(raw: &str, open: char, fallback: &Regex) -> Option<T> {
    raw.match_indices(open)
        .find_map(|(idx, _)| {
            serde_json::Deserializer::from_str(&raw[idx..])
                .into_iter::<T>()
                .next()
                .and_then(|value| value.ok())
        })
        .or_else(|| {
            fallback
                .find(raw)
                .and_then(|m| serde_json::from_str(m.as_str()).ok())
        })
}

/// Split a batch answer into per-message JSON objects keyed by email id
fn split_batch_response(raw: &str) -> Result<HashMap<String, String>> {
    let entries: Vec<serde_json::Value> = extract_json(raw, '[', &JSON_ARRAY).ok_or_else(|| {
        MailbotError::InvalidResponse("batch response has no parseable JSON array".into())
    })?;

    let mut by_id = HashMap::with_capacity(entries.len());
    for entry in entries {
        let id = match entry.get("email_id").or_else(|| entry.get("id")) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        by_id.entry(id).or_insert_with(|| entry.to_string());
    }

    Ok(by_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_capabilities() {
        assert!(!ProviderKind::Groq.supports_batch());
        assert!(ProviderKind::Gemini.supports_batch());
        assert!(ProviderKind::OpenAi.supports_batch());
        assert!(ProviderKind::Anthropic.supports_batch());

        assert_eq!(ProviderKind::Groq.default_batch_size(), 1);
        assert_eq!(ProviderKind::OpenAi.default_batch_size(), 10);
        assert!(ProviderKind::Groq.is_free_tier());
        assert!(!ProviderKind::Anthropic.is_free_tier());
    }

    #[test]
    fn test_parse_provider_names() {
        assert_eq!("groq".parse::<ProviderKind>().unwrap(), ProviderKind::Groq);
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!(" anthropic ".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert_eq!("gemini".parse::<ProviderKind>().unwrap(), ProviderKind::Gemini);
    }

    #[test]
    fn test_auto_and_unknown_providers_are_config_errors() {
        for name in ["auto", "", "mistral"] {
            match name.parse::<ProviderKind>() {
                Err(MailbotError::ConfigError { key, .. }) => assert_eq!(key, "llm.provider"),
                other => panic!("expected config error for {:?}, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn test_split_batch_response_by_id() {
        let raw = r#"Here you go:
```json
[
  {"email_id": "a", "category": "JUNK", "confidence": 0.9},
  {"email_id": "b", "category": "IMPORTANT", "confidence": 0.7},
  {"category": "JUNK"}
]
```"#;
        let by_id = split_batch_response(raw).unwrap();
        assert_eq!(by_id.len(), 2);
        assert!(by_id["a"].contains("JUNK"));
        assert!(by_id["b"].contains("IMPORTANT"));
    }

    #[test]
    fn test_split_batch_response_rejects_garbage() {
        assert!(matches!(
            split_batch_response("no array here"),
            Err(MailbotError::InvalidResponse(_))
        ));
        assert!(matches!(
            split_batch_response("[not json]"),
            Err(MailbotError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_split_batch_response_ignores_trailing_brackets() {
        let raw = r#"[{"email_id": "a", "category": "PROMOTIONAL", "confidence": 0.8}]
Note: [a] looked like a newsletter."#;
        let by_id = split_batch_response(raw).unwrap();
        assert_eq!(by_id.len(), 1);
        assert!(by_id["a"].contains("PROMOTIONAL"));
    }

    #[test]
    fn test_extract_json_skips_bracketed_prose() {
        let raw = r#"[draft] answer: [{"email_id": "x"}] (see [1])"#;
        let entries: Vec<serde_json::Value> = extract_json(raw, '[', &JSON_ARRAY).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["email_id"], "x");
    }
}
