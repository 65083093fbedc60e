use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fetched email, normalized across mailbox providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub folder: String,
    pub sender: String,
    #[serde(default)]
    pub sender_name: String,
    pub subject: String,
    /// Snippet or body preview, possibly truncated by the provider
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    /// Provider payload kept for export; never interpreted by the pipeline
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Junk,
    Promotional,
    Important,
    Unknown,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Junk,
        Category::Promotional,
        Category::Important,
        Category::Unknown,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Category::Junk => "JUNK",
            Category::Promotional => "PROMOTIONAL",
            Category::Important => "IMPORTANT",
            Category::Unknown => "UNKNOWN",
        }
    }

    /// Case-insensitive match against the four labels
    pub fn from_label(label: &str) -> Option<Category> {
        let label = label.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.label().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub message_id: String,
    pub category: Category,
    pub confidence: f32,
    pub reasoning: Option<String>,
    pub provider_used: String,
}

impl Classification {
    /// Fallback used when the provider could not classify the message
    pub fn unknown(message_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            category: Category::Unknown,
            confidence: 0.0,
            reasoning: None,
            provider_used: provider.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    None,
    Delete,
    Move,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::None => "NONE",
            ActionKind::Delete => "DELETE",
            ActionKind::Move => "MOVE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDecision {
    pub message_id: String,
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_folder: Option<String>,
    pub reason: String,
    pub executed: bool,
    /// Set when the mailbox rejected the action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Verdict on a sender as a whole, from a sample of its messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum SenderCategory {
    Trustworthy,
    Promotional,
    Suspicious,
    Unknown,
}

impl SenderCategory {
    pub const ALL: [SenderCategory; 4] = [
        SenderCategory::Trustworthy,
        SenderCategory::Promotional,
        SenderCategory::Suspicious,
        SenderCategory::Unknown,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            SenderCategory::Trustworthy => "TRUSTWORTHY",
            SenderCategory::Promotional => "PROMOTIONAL",
            SenderCategory::Suspicious => "SUSPICIOUS",
            SenderCategory::Unknown => "UNKNOWN",
        }
    }

    pub fn from_label(label: &str) -> Option<SenderCategory> {
        let label = label.trim();
        SenderCategory::ALL
            .into_iter()
            .find(|c| c.label().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for SenderCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Rule the model suggests for future mail from a sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedRule {
    AutoDelete,
    AutoPromotional,
    ManualReview,
    Whitelist,
}

impl SuggestedRule {
    pub const ALL: [SuggestedRule; 4] = [
        SuggestedRule::AutoDelete,
        SuggestedRule::AutoPromotional,
        SuggestedRule::ManualReview,
        SuggestedRule::Whitelist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestedRule::AutoDelete => "auto_delete",
            SuggestedRule::AutoPromotional => "auto_promotional",
            SuggestedRule::ManualReview => "manual_review",
            SuggestedRule::Whitelist => "whitelist",
        }
    }

    pub fn parse(value: &str) -> Option<SuggestedRule> {
        let value = value.trim();
        SuggestedRule::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for SuggestedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderAnalysis {
    pub sender: String,
    pub domain: String,
    pub message_count: usize,
    pub sender_category: SenderCategory,
    pub confidence: f32,
    pub reasoning: Option<String>,
    pub suggested_rule: SuggestedRule,
    pub provider_used: String,
}

impl SenderAnalysis {
    /// Fallback when the provider failed or its answer could not be read
    pub fn unknown(sender: &str, message_count: usize, provider: impl Into<String>) -> Self {
        Self {
            sender: sender.to_string(),
            domain: sender_domain(sender).to_string(),
            message_count,
            sender_category: SenderCategory::Unknown,
            confidence: 0.0,
            reasoning: Some("Failed to analyze sender".to_string()),
            suggested_rule: SuggestedRule::ManualReview,
            provider_used: provider.into(),
        }
    }
}

/// Part after the last `@`, or the whole string when there is none
pub fn sender_domain(sender: &str) -> &str {
    sender.rsplit_once('@').map(|(_, domain)| domain).unwrap_or(sender)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_labels_are_case_insensitive() {
        assert_eq!(Category::from_label("junk"), Some(Category::Junk));
        assert_eq!(Category::from_label(" Promotional "), Some(Category::Promotional));
        assert_eq!(Category::from_label("IMPORTANT"), Some(Category::Important));
        assert_eq!(Category::from_label("spam"), None);
        assert_eq!(Category::from_label(""), None);
    }

    #[test]
    fn test_category_serializes_uppercase() {
        let json = serde_json::to_string(&Category::Promotional).unwrap();
        assert_eq!(json, "\"PROMOTIONAL\"");
        let json = serde_json::to_string(&ActionKind::Move).unwrap();
        assert_eq!(json, "\"MOVE\"");
    }

    #[test]
    fn test_decision_omits_empty_optionals() {
        let decision = ActionDecision {
            message_id: "m1".to_string(),
            action: ActionKind::None,
            target_folder: None,
            reason: "below threshold".to_string(),
            executed: false,
            error: None,
        };
        let value = serde_json::to_value(&decision).unwrap();
        assert!(value.get("target_folder").is_none());
        assert!(value.get("error").is_none());
        assert_eq!(value["action"], "NONE");
    }

    #[test]
    fn test_unknown_fallback() {
        let c = Classification::unknown("m9", "groq");
        assert_eq!(c.category, Category::Unknown);
        assert_eq!(c.confidence, 0.0);
        assert_eq!(c.provider_used, "groq");
    }

    #[test]
    fn test_sender_labels_and_rules() {
        assert_eq!(SenderCategory::from_label("suspicious"), Some(SenderCategory::Suspicious));
        assert_eq!(SenderCategory::from_label("JUNK"), None);
        assert_eq!(SuggestedRule::parse("Auto_Delete"), Some(SuggestedRule::AutoDelete));
        assert_eq!(SuggestedRule::parse("block"), None);
        assert_eq!(
            serde_json::to_value(SuggestedRule::ManualReview).unwrap(),
            "manual_review"
        );
    }

    #[test]
    fn test_sender_domain() {
        assert_eq!(sender_domain("news@shop.example"), "shop.example");
        assert_eq!(sender_domain("shop.example"), "shop.example");
    }
}
