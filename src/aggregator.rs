//! Per-run bookkeeping: outcomes, counters, summary and export.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{MailbotError, Result};
use crate::models::{ActionDecision, ActionKind, Category, Classification, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// Classification failed; the message was recorded as UNKNOWN
    Provider,
    /// The mailbox refused a delete/move
    ActionExecution,
    /// The mailbox rate-limited an action
    RateLimited,
}

impl RunErrorKind {
    /// Classify a per-message action failure
    pub fn for_action_error(error: &MailbotError) -> Self {
        match error {
            MailbotError::RateLimitExceeded { .. } => RunErrorKind::RateLimited,
            _ => RunErrorKind::ActionExecution,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub message_id: String,
    pub kind: RunErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub provider: String,
    pub dry_run: bool,
    pub total_processed: usize,
    pub counts_by_category: BTreeMap<Category, usize>,
    pub counts_by_action: BTreeMap<ActionKind, usize>,
    pub executed_actions: usize,
    pub decisions: Vec<ActionDecision>,
    pub errors: Vec<RunError>,
    /// Set when the run stopped early on cancellation
    pub aborted: bool,
}

impl RunSummary {
    pub fn category_count(&self, category: Category) -> usize {
        self.counts_by_category.get(&category).copied().unwrap_or(0)
    }

    pub fn action_count(&self, action: ActionKind) -> usize {
        self.counts_by_action.get(&action).copied().unwrap_or(0)
    }

    pub fn rate_limited(&self) -> bool {
        self.errors.iter().any(|e| e.kind == RunErrorKind::RateLimited)
    }

    /// Generate Markdown report
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        if self.dry_run {
            md.push_str("# Mailbot Run Report (DRY RUN)\n\n");
            md.push_str("> No mailbox changes were made. Actions below show what WOULD happen.\n\n");
        } else {
            md.push_str("# Mailbot Run Report\n\n");
        }

        md.push_str(&format!("- **Run ID:** {}\n", self.run_id));
        md.push_str(&format!("- **Provider:** {}\n", self.provider));
        md.push_str(&format!("- **Messages processed:** {}\n", self.total_processed));
        md.push_str(&format!("- **Actions executed:** {}\n", self.executed_actions));
        md.push_str(&format!(
            "- **Duration:** {} seconds\n",
            (self.completed_at - self.started_at).num_seconds()
        ));
        if self.aborted {
            md.push_str("- **Status:** cancelled before completion\n");
        }
        md.push('\n');

        md.push_str("## Categories\n\n");
        md.push_str("| Category | Count |\n");
        md.push_str("|----------|-------|\n");
        for category in Category::ALL {
            md.push_str(&format!("| {} | {} |\n", category, self.category_count(category)));
        }
        md.push('\n');

        md.push_str("## Actions\n\n");
        md.push_str("| Action | Count |\n");
        md.push_str("|--------|-------|\n");
        for (action, count) in &self.counts_by_action {
            md.push_str(&format!("| {} | {} |\n", action, count));
        }
        md.push('\n');

        if !self.errors.is_empty() {
            md.push_str("## Errors\n\n");
            for error in &self.errors {
                md.push_str(&format!(
                    "- `{}` ({:?}): {}\n",
                    error.message_id, error.kind, error.detail
                ));
            }
            md.push('\n');
        }

        md
    }
}

/// One exported row per processed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    pub message_id: String,
    pub folder: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub classification: Classification,
    pub decision: ActionDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub provider: String,
    pub dry_run: bool,
    pub counts_by_category: BTreeMap<Category, usize>,
    pub counts_by_action: BTreeMap<ActionKind, usize>,
    pub records: Vec<ExportRecord>,
    pub errors: Vec<RunError>,
}

impl ExportDocument {
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::info!("Saved classification results to {:?}", path);
        Ok(())
    }
}

/// Collects per-message outcomes for a run. Owned by the single consumer of
/// the classification stream.
#[derive(Debug)]
pub struct RunAggregator {
    run_id: String,
    provider: String,
    dry_run: bool,
    started_at: DateTime<Utc>,
    records: Vec<ExportRecord>,
    counts_by_category: BTreeMap<Category, usize>,
    counts_by_action: BTreeMap<ActionKind, usize>,
    executed_actions: usize,
    errors: Vec<RunError>,
    aborted: bool,
}

impl RunAggregator {
    pub fn new(provider: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            provider: provider.into(),
            dry_run,
            started_at: Utc::now(),
            records: Vec::new(),
            counts_by_category: BTreeMap::new(),
            counts_by_action: BTreeMap::new(),
            executed_actions: 0,
            errors: Vec::new(),
            aborted: false,
        }
    }

    pub fn record(
        &mut self,
        message: &Message,
        classification: Classification,
        decision: ActionDecision,
    ) {
        *self
            .counts_by_category
            .entry(classification.category)
            .or_insert(0) += 1;
        *self.counts_by_action.entry(decision.action).or_insert(0) += 1;
        if decision.executed {
            self.executed_actions += 1;
        }

        self.records.push(ExportRecord {
            message_id: message.id.clone(),
            folder: message.folder.clone(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            received_at: message.received_at,
            classification,
            decision,
        });
    }

    pub fn record_error(
        &mut self,
        message_id: impl Into<String>,
        kind: RunErrorKind,
        detail: impl Into<String>,
    ) {
        self.errors.push(RunError {
            message_id: message_id.into(),
            kind,
            detail: detail.into(),
        });
    }

    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    pub fn processed(&self) -> usize {
        self.records.len()
    }

    /// Snapshot of the run so far. Valid at any point, including after
    /// cancellation.
    pub fn summarize(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            completed_at: Utc::now(),
            provider: self.provider.clone(),
            dry_run: self.dry_run,
            total_processed: self.records.len(),
            counts_by_category: self.counts_by_category.clone(),
            counts_by_action: self.counts_by_action.clone(),
            executed_actions: self.executed_actions,
            decisions: self.records.iter().map(|r| r.decision.clone()).collect(),
            errors: self.errors.clone(),
            aborted: self.aborted,
        }
    }

    pub fn to_export_format(&self) -> ExportDocument {
        ExportDocument {
            run_id: self.run_id.clone(),
            generated_at: Utc::now(),
            provider: self.provider.clone(),
            dry_run: self.dry_run,
            counts_by_category: self.counts_by_category.clone(),
            counts_by_action: self.counts_by_action.clone(),
            records: self.records.clone(),
            errors: self.errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            folder: "INBOX".to_string(),
            sender: "a@b.example".to_string(),
            sender_name: String::new(),
            subject: format!("subject {}", id),
            snippet: String::new(),
            received_at: Utc::now(),
            raw: serde_json::Value::Null,
        }
    }

    fn outcome(id: &str, category: Category, action: ActionKind, executed: bool) -> (Classification, ActionDecision) {
        (
            Classification {
                message_id: id.to_string(),
                category,
                confidence: 0.9,
                reasoning: None,
                provider_used: "gemini".to_string(),
            },
            ActionDecision {
                message_id: id.to_string(),
                action,
                target_folder: None,
                reason: "test".to_string(),
                executed,
                error: None,
            },
        )
    }

    #[test]
    fn test_counts_and_decisions() {
        let mut agg = RunAggregator::new("gemini", false);
        for (id, category, action, executed) in [
            ("1", Category::Junk, ActionKind::Delete, true),
            ("2", Category::Junk, ActionKind::None, false),
            ("3", Category::Important, ActionKind::None, false),
        ] {
            let (c, d) = outcome(id, category, action, executed);
            agg.record(&message(id), c, d);
        }

        let summary = agg.summarize();
        assert_eq!(summary.total_processed, 3);
        assert_eq!(summary.category_count(Category::Junk), 2);
        assert_eq!(summary.category_count(Category::Promotional), 0);
        assert_eq!(summary.action_count(ActionKind::Delete), 1);
        assert_eq!(summary.action_count(ActionKind::None), 2);
        assert_eq!(summary.executed_actions, 1);
        assert_eq!(summary.decisions.len(), 3);
        assert!(!summary.aborted);
    }

    #[test]
    fn test_errors_and_rate_limit_flag() {
        let mut agg = RunAggregator::new("openai", false);
        agg.record_error("m1", RunErrorKind::Provider, "timeout");
        assert!(!agg.summarize().rate_limited());

        let kind = RunErrorKind::for_action_error(&MailbotError::RateLimitExceeded { retry_after: 3 });
        agg.record_error("m2", kind, "429");
        let summary = agg.summarize();
        assert_eq!(summary.errors.len(), 2);
        assert!(summary.rate_limited());
    }

    #[test]
    fn test_empty_run_summary_is_valid() {
        let mut agg = RunAggregator::new("groq", true);
        agg.mark_aborted();
        let summary = agg.summarize();
        assert_eq!(summary.total_processed, 0);
        assert!(summary.aborted);
        assert!(summary.to_markdown().contains("DRY RUN"));
    }

    #[test]
    fn test_export_contains_message_fields() {
        let mut agg = RunAggregator::new("anthropic", true);
        let (c, d) = outcome("x1", Category::Promotional, ActionKind::Move, false);
        agg.record(&message("x1"), c, d);

        let value = serde_json::to_value(agg.to_export_format()).unwrap();
        assert_eq!(value["provider"], "anthropic");
        assert_eq!(value["records"][0]["message_id"], "x1");
        assert_eq!(value["records"][0]["subject"], "subject x1");
        assert_eq!(value["records"][0]["classification"]["category"], "PROMOTIONAL");
        assert_eq!(value["records"][0]["decision"]["action"], "MOVE");
        assert_eq!(value["counts_by_category"]["PROMOTIONAL"], 1);
    }

    #[tokio::test]
    async fn test_export_save_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");

        let agg = RunAggregator::new("groq", true);
        agg.to_export_format().save(&path).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: ExportDocument = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.provider, "groq");
    }
}
