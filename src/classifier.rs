use futures::stream::{self, Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{MailbotError, Result};
use crate::llm::{extract_json, LlmProvider};
use crate::models::{
    Category, Classification, Message, SenderAnalysis, SenderCategory, SuggestedRule,
};
use crate::prompt::{build_batch_prompt, build_prompt, build_sender_prompt};
use crate::retry::{with_retry, Backoff};

/// Confidence assigned when the model names a category but gives no score
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

const MAX_RETRIES: u32 = 1;

static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

static BARE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(JUNK|PROMOTIONAL|IMPORTANT|UNKNOWN)\b").unwrap());

#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
    #[serde(default, alias = "reasoning")]
    reason: Option<String>,
}

/// Result for one message. `error` is set when the provider call failed and
/// the classification is the UNKNOWN fallback.
#[derive(Debug)]
pub struct ClassificationOutcome {
    pub classification: Classification,
    pub error: Option<MailbotError>,
}

impl ClassificationOutcome {
    fn ok(classification: Classification) -> Self {
        Self {
            classification,
            error: None,
        }
    }
}

fn confidence_from(value: Option<&serde_json::Value>) -> f32 {
    let score = match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match score {
        Some(score) if score.is_finite() => score.clamp(0.0, 1.0) as f32,
        _ => DEFAULT_CONFIDENCE,
    }
}

/// Interpret a raw model response.
///
/// A JSON object anywhere in the text wins; its `category` must be one of the
/// four labels (any case) or the result is UNKNOWN with confidence 0. Without
/// a JSON object, exactly one distinct bare label is accepted with the
/// default confidence.
pub fn parse_classification(message_id: &str, raw: &str, provider: &str) -> Classification {
    let mut classification = Classification::unknown(message_id, provider);

    if let Some(verdict) = extract_json::<Verdict>(raw, '{', &JSON_OBJECT) {
        match verdict.category.as_deref().and_then(Category::from_label) {
            Some(category) => {
                classification.category = category;
                classification.confidence = confidence_from(verdict.confidence.as_ref());
                classification.reasoning = verdict.reason.filter(|r| !r.trim().is_empty());
            }
            None => {
                debug!(message_id, "Model returned an unrecognized category");
                classification.reasoning = Some("unrecognized category".to_string());
            }
        }
        return classification;
    }

    let labels: BTreeSet<Category> = BARE_LABEL
        .find_iter(raw)
        .filter_map(|m| Category::from_label(m.as_str()))
        .collect();

    if labels.len() == 1 {
        if let Some(category) = labels.into_iter().next() {
            classification.category = category;
            classification.confidence = DEFAULT_CONFIDENCE;
        }
    } else {
        debug!(message_id, "Could not parse model response");
        classification.reasoning = Some("unparseable response".to_string());
    }

    classification
}

#[derive(Debug, Deserialize)]
struct SenderVerdict {
    #[serde(default)]
    sender_category: Option<String>,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
    #[serde(default, alias = "reason")]
    reasoning: Option<String>,
    #[serde(default)]
    suggested_rule: Option<String>,
}

/// Interpret a sender analysis answer. Anything without a JSON object or
/// with an unknown sender category is the UNKNOWN / manual review fallback.
pub fn parse_sender_analysis(
    sender: &str,
    message_count: usize,
    raw: &str,
    provider: &str,
) -> SenderAnalysis {
    let mut analysis = SenderAnalysis::unknown(sender, message_count, provider);

    let Some(verdict) = extract_json::<SenderVerdict>(raw, '{', &JSON_OBJECT) else {
        debug!(sender, "Could not parse sender analysis");
        return analysis;
    };
    let Some(category) = verdict
        .sender_category
        .as_deref()
        .and_then(SenderCategory::from_label)
    else {
        debug!(sender, "Model returned an unrecognized sender category");
        return analysis;
    };

    analysis.sender_category = category;
    analysis.confidence = confidence_from(verdict.confidence.as_ref());
    analysis.reasoning = verdict.reasoning.filter(|r| !r.trim().is_empty());
    analysis.suggested_rule = verdict
        .suggested_rule
        .as_deref()
        .and_then(SuggestedRule::parse)
        .unwrap_or(SuggestedRule::ManualReview);
    analysis
}

/// LLM-backed email classifier
#[derive(Debug)]
pub struct EmailClassifier {
    provider: LlmProvider,
    batch_size: usize,
    retry_delay: Duration,
    max_concurrent: usize,
}

impl EmailClassifier {
    /// Fails with `UnsupportedOperation` when `batch_size > 1` and the
    /// provider cannot batch.
    pub fn new(provider: LlmProvider, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(MailbotError::config("llm.batch_size", "must be at least 1"));
        }
        if batch_size > 1 && !provider.supports_batch() {
            return Err(MailbotError::UnsupportedOperation {
                provider: provider.name().to_string(),
                operation: format!("batch classification (batch_size = {})", batch_size),
            });
        }

        Ok(Self {
            provider,
            batch_size,
            retry_delay: Duration::from_millis(500),
            max_concurrent: 1,
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Chunks classified in parallel; results keep input order
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn provider(&self) -> &LlmProvider {
        &self.provider
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Lazily classify `messages`, yielding exactly one outcome per message in
    /// input order. Each call starts a fresh stream.
    pub fn classify<'a>(
        &'a self,
        messages: &'a [Message],
    ) -> impl Stream<Item = ClassificationOutcome> + 'a {
        stream::iter(messages.chunks(self.batch_size))
            .map(move |chunk| self.classify_chunk(chunk))
            .buffered(self.max_concurrent)
            .flat_map(stream::iter)
    }

    pub async fn classify_message(&self, message: &Message) -> ClassificationOutcome {
        let prompt = build_prompt(message);
        let operation = format!("Classification of {}", message.id);

        match with_retry(&operation, MAX_RETRIES, Backoff::Fixed(self.retry_delay), || {
            self.provider.classify_one(&prompt)
        })
        .await
        {
            Ok(raw) => ClassificationOutcome::ok(parse_classification(
                &message.id,
                &raw,
                self.provider.name(),
            )),
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Falling back to UNKNOWN");
                ClassificationOutcome {
                    classification: Classification::unknown(&message.id, self.provider.name()),
                    error: Some(MailbotError::ProviderError {
                        message_id: message.id.clone(),
                        message: e.to_string(),
                    }),
                }
            }
        }
    }

    /// One provider call judging `sender` from a sample of its messages.
    /// Provider failures yield the UNKNOWN fallback.
    pub async fn analyze_sender(&self, sender: &str, messages: &[Message]) -> SenderAnalysis {
        let prompt = build_sender_prompt(sender, messages);
        let operation = format!("Sender analysis of {}", sender);
        let backoff = Backoff::Fixed(self.retry_delay);

        let answer = with_retry(&operation, MAX_RETRIES, backoff, || {
            self.provider.classify_one(&prompt)
        })
        .await;

        match answer {
            Ok(raw) => parse_sender_analysis(sender, messages.len(), &raw, self.provider.name()),
            Err(e) => {
                warn!(sender, error = %e, "Sender analysis failed");
                SenderAnalysis::unknown(sender, messages.len(), self.provider.name())
            }
        }
    }

    async fn classify_chunk(&self, chunk: &[Message]) -> Vec<ClassificationOutcome> {
        if chunk.len() == 1 || !self.provider.supports_batch() {
            let mut outcomes = Vec::with_capacity(chunk.len());
            for message in chunk {
                outcomes.push(self.classify_message(message).await);
            }
            return outcomes;
        }

        let batch = build_batch_prompt(chunk);
        let backoff = Backoff::Fixed(self.retry_delay);
        let responses = match with_retry("Batch classification", MAX_RETRIES, backoff, || {
            self.provider.classify_batch(&batch)
        })
        .await
        {
            Ok(responses) => responses,
            Err(e) => {
                warn!(
                    size = chunk.len(),
                    error = %e,
                    "Batch classification failed, classifying individually"
                );
                vec![None; chunk.len()]
            }
        };

        let mut outcomes = Vec::with_capacity(chunk.len());
        for (message, response) in chunk.iter().zip(responses) {
            match response {
                Some(raw) => outcomes.push(ClassificationOutcome::ok(parse_classification(
                    &message.id,
                    &raw,
                    self.provider.name(),
                ))),
                None => {
                    debug!(message_id = %message.id, "Missing from batch answer");
                    outcomes.push(self.classify_message(message).await);
                }
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let c = parse_classification(
            "m1",
            r#"{"category": "JUNK", "confidence": 0.93, "reason": "lottery scam"}"#,
            "openai",
        );
        assert_eq!(c.category, Category::Junk);
        assert!((c.confidence - 0.93).abs() < 1e-6);
        assert_eq!(c.reasoning.as_deref(), Some("lottery scam"));
        assert_eq!(c.provider_used, "openai");
        assert_eq!(c.message_id, "m1");
    }

    #[test]
    fn test_parse_json_inside_prose_and_code_fence() {
        let raw = "Sure!\n```json\n{\"category\": \"promotional\", \"confidence\": \"0.8\"}\n```";
        let c = parse_classification("m1", raw, "gemini");
        assert_eq!(c.category, Category::Promotional);
        assert!((c.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_label_is_unknown_with_zero_confidence() {
        let c = parse_classification("m1", r#"{"category": "SPAM", "confidence": 0.99}"#, "groq");
        assert_eq!(c.category, Category::Unknown);
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn test_missing_confidence_uses_default() {
        let c = parse_classification("m1", r#"{"category": "IMPORTANT"}"#, "groq");
        assert_eq!(c.category, Category::Important);
        assert_eq!(c.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let c = parse_classification("m1", r#"{"category": "JUNK", "confidence": 7}"#, "groq");
        assert_eq!(c.confidence, 1.0);
        let c = parse_classification("m1", r#"{"category": "JUNK", "confidence": -2}"#, "groq");
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn test_bare_label_without_json() {
        let c = parse_classification("m1", "This looks like JUNK to me.", "groq");
        assert_eq!(c.category, Category::Junk);
        assert_eq!(c.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_ambiguous_or_empty_text_is_unknown() {
        let c = parse_classification("m1", "Either JUNK or PROMOTIONAL", "groq");
        assert_eq!(c.category, Category::Unknown);
        assert_eq!(c.confidence, 0.0);

        let c = parse_classification("m1", "", "groq");
        assert_eq!(c.category, Category::Unknown);
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn test_parse_json_followed_by_braced_prose() {
        let raw = r#"{"category": "JUNK", "confidence": 0.9} {note: sender spoofed}"#;
        let c = parse_classification("m1", raw, "openai");
        assert_eq!(c.category, Category::Junk);
        assert!((c.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_parse_sender_analysis() {
        let raw = r#"```json
{"sender_category": "promotional", "confidence": 0.85, "reasoning": "Retail newsletter", "suggested_rule": "auto_promotional"}
```"#;
        let a = parse_sender_analysis("deals@shop.example", 12, raw, "gemini");
        assert_eq!(a.sender_category, SenderCategory::Promotional);
        assert!((a.confidence - 0.85).abs() < 1e-6);
        assert_eq!(a.suggested_rule, SuggestedRule::AutoPromotional);
        assert_eq!(a.reasoning.as_deref(), Some("Retail newsletter"));
        assert_eq!(a.domain, "shop.example");
        assert_eq!(a.message_count, 12);
    }

    #[test]
    fn test_parse_sender_analysis_unknown_rule_means_manual_review() {
        let raw = r#"{"sender_category": "SUSPICIOUS", "confidence": 0.7, "suggested_rule": "block"}"#;
        let a = parse_sender_analysis("x@bad.example", 3, raw, "groq");
        assert_eq!(a.sender_category, SenderCategory::Suspicious);
        assert_eq!(a.suggested_rule, SuggestedRule::ManualReview);
    }

    #[test]
    fn test_parse_sender_analysis_fallback() {
        for raw in ["I am not sure", r#"{"sender_category": "SPAMMER", "confidence": 0.9}"#] {
            let a = parse_sender_analysis("x@bad.example", 3, raw, "groq");
            assert_eq!(a.sender_category, SenderCategory::Unknown);
            assert_eq!(a.confidence, 0.0);
            assert_eq!(a.suggested_rule, SuggestedRule::ManualReview);
            assert_eq!(a.provider_used, "groq");
        }
    }
}
