//! Command-line interface

use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::aggregator::{RunAggregator, RunSummary};
use crate::auth;
use crate::classifier::EmailClassifier;
use crate::config::{Config, MailboxKind, RunConfig, RunOverrides};
use crate::error::{MailbotError, Result};
use crate::gateway::{GmailGateway, MailboxGateway, OutlookGateway};
use crate::llm::{LlmProvider, ProviderKind};
use crate::models::{ActionKind, Category, SenderAnalysis};
use crate::pipeline::{Pipeline, ProgressCallback};

#[derive(Parser, Debug)]
#[command(name = "mailbot")]
#[command(version)]
#[command(about = "Classify and clean up email with an LLM", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mailbot.toml")]
    pub config: PathBuf,

    /// Path to OAuth2 credentials file (overrides mailbox.credentials_path)
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Path to token cache file (overrides mailbox.token_cache_path)
    #[arg(long)]
    pub token_cache: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by analyze and clean
#[derive(Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// Maximum number of messages to process
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Folder (Gmail label or Outlook folder) to read from
    #[arg(short, long)]
    pub folder: Option<String>,

    /// Only messages received in the last N days
    #[arg(short, long)]
    pub days: Option<u32>,

    /// LLM provider: groq, gemini, openai or anthropic
    #[arg(short, long)]
    pub provider: Option<String>,

    /// Write per-message results to classification_results_<folder>_<n>.json
    #[arg(long)]
    pub save_results: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate with Gmail API
    Auth {
        /// Force re-authentication even if token exists
        #[arg(long)]
        force: bool,
    },

    /// Classify messages and report what would happen (never changes the mailbox)
    Analyze {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Classify messages and delete/move them according to policy
    Clean {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Delete messages classified as JUNK
        #[arg(long)]
        auto_delete: bool,

        /// Minimum confidence required before acting (0.0 - 1.0)
        #[arg(long)]
        confidence_threshold: Option<f32>,

        /// Move PROMOTIONAL messages to this folder/label
        #[arg(long)]
        promotional_folder: Option<String>,

        /// Apply actions to the mailbox (overrides run.dry_run)
        #[arg(long)]
        live: bool,

        /// Skip the confirmation prompt in live mode
        #[arg(long)]
        force: bool,
    },

    /// Ask the LLM to judge one sender from a sample of its messages
    SenderAnalysis {
        /// Sender email address to analyze
        #[arg(long)]
        sender: String,

        /// Maximum number of the sender's messages to fetch
        #[arg(short, long, default_value_t = 100)]
        limit: usize,

        /// LLM provider: groq, gemini, openai or anthropic
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// List LLM providers and whether they are configured
    Providers,

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "mailbot.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

impl SelectionArgs {
    fn overrides(&self) -> RunOverrides {
        RunOverrides {
            provider: self.provider.clone(),
            folder: self.folder.clone(),
            limit: self.limit,
            since_days: self.days,
            save_results: self.save_results.then_some(true),
            ..Default::default()
        }
    }
}

impl Commands {
    /// Run overrides for commands that process messages
    pub fn run_overrides(&self) -> Option<RunOverrides> {
        match self {
            Commands::Analyze { selection } => Some(RunOverrides {
                dry_run: Some(true),
                ..selection.overrides()
            }),
            Commands::Clean {
                selection,
                auto_delete,
                confidence_threshold,
                promotional_folder,
                live,
                ..
            } => Some(RunOverrides {
                dry_run: live.then_some(false),
                auto_delete: auto_delete.then_some(true),
                confidence_threshold: *confidence_threshold,
                promotional_folder: promotional_folder.clone(),
                ..selection.overrides()
            }),
            _ => None,
        }
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Share a MultiProgress with the log writer so log lines print above bars
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of an analyze/clean invocation
#[derive(Debug)]
pub struct RunOutput {
    pub summary: RunSummary,
    pub results_path: Option<PathBuf>,
    /// Set when the run stopped on a fatal error after processing started
    pub error: Option<MailbotError>,
}

/// `classification_results_<folder>_<n>.json`
pub fn results_file_name(folder: &str, processed: usize) -> String {
    let folder: String = folder
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("classification_results_{}_{}.json", folder, processed)
}

pub fn confirm_action(prompt: &str) -> Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn credentials_path<'a>(cli: &'a Cli, config: &'a Config) -> &'a Path {
    cli.credentials
        .as_deref()
        .unwrap_or(&config.mailbox.credentials_path)
}

fn token_cache_path<'a>(cli: &'a Cli, config: &'a Config) -> &'a Path {
    cli.token_cache
        .as_deref()
        .unwrap_or(&config.mailbox.token_cache_path)
}

pub async fn build_gateway(cli: &Cli, config: &Config) -> Result<Arc<dyn MailboxGateway>> {
    match config.mailbox.provider {
        MailboxKind::Gmail => {
            let hub = auth::initialize_gmail_hub(
                credentials_path(cli, config),
                token_cache_path(cli, config),
            )
            .await?;
            Ok(Arc::new(GmailGateway::new(
                hub,
                config.mailbox.max_concurrent_requests,
            )))
        }
        MailboxKind::Outlook => Ok(Arc::new(OutlookGateway::from_env(
            config.mailbox.graph_base_url.clone(),
        )?)),
    }
}

/// Authenticate with Gmail and return the connected account address
pub async fn authenticate(cli: &Cli, config: &Config, force: bool) -> Result<String> {
    if config.mailbox.provider == MailboxKind::Outlook {
        return Err(MailbotError::config(
            "mailbox.provider",
            "the auth command only applies to Gmail; Outlook reads its token from MS_GRAPH_TOKEN",
        ));
    }

    let credentials = credentials_path(cli, config);
    let token_cache = token_cache_path(cli, config);
    auth::load_credentials(credentials).await?;

    if force && token_cache.exists() {
        tokio::fs::remove_file(token_cache).await?;
        info!("Removed existing token cache");
    }

    let hub = auth::initialize_gmail_hub(credentials, token_cache).await?;
    let (_, profile) = hub
        .users()
        .get_profile("me")
        .add_scope("https://www.googleapis.com/auth/gmail.modify")
        .doit()
        .await?;

    Ok(profile.email_address.unwrap_or_default())
}

/// Resolve configuration, classify the selected messages and apply the
/// policy. Configuration problems are reported before any network call.
pub async fn run_classification(
    cli: &Cli,
    config: &Config,
    overrides: &RunOverrides,
    reporter: &ProgressReporter,
    cancel: Arc<AtomicBool>,
    skip_confirmation: bool,
) -> Result<RunOutput> {
    let run_config = RunConfig::from_config(config, overrides)?;
    let provider = LlmProvider::from_config(run_config.provider, &config.llm)?;
    let classifier = EmailClassifier::new(provider, run_config.batch_size)?
        .with_retry_delay(Duration::from_millis(config.llm.retry_delay_ms))
        .with_max_concurrent(config.llm.max_concurrent_requests);

    if !run_config.dry_run && !skip_confirmation {
        let prompt = format!(
            "LIVE mode: messages in '{}' may be {}. Continue?",
            run_config.folder,
            describe_live_actions(&run_config)
        );
        if !confirm_action(&prompt)? {
            return Err(MailbotError::OperationCancelled(
                "live run declined at confirmation prompt".to_string(),
            ));
        }
    }

    let spinner = reporter.add_spinner("Connecting to mailbox...");
    let gateway = build_gateway(cli, config).await?;
    reporter.finish_spinner(&spinner, &format!("Connected to {}", gateway.name()));

    let pipeline = Pipeline::new(&classifier, gateway.as_ref(), &run_config);

    let spinner = reporter.add_spinner(&format!("Fetching messages from {}...", run_config.folder));
    let messages = pipeline.fetch().await?;
    reporter.finish_spinner(&spinner, &format!("Fetched {} messages", messages.len()));

    let bar = reporter.add_progress_bar(
        messages.len() as u64,
        &format!("Classifying with {}", run_config.provider),
    );
    let progress_bar = bar.clone();
    let on_progress: ProgressCallback = Arc::new(move || progress_bar.inc(1));

    let mut aggregator = RunAggregator::new(run_config.provider.name(), run_config.dry_run);
    let outcome = pipeline
        .with_progress(on_progress)
        .with_cancellation(cancel)
        .process_into(&messages, &mut aggregator)
        .await;
    bar.finish_and_clear();

    let error = match outcome {
        Ok(()) => None,
        Err(e) if aggregator.processed() == 0 => return Err(e),
        Err(e) => Some(e),
    };

    let summary = aggregator.summarize();
    let results_path = if run_config.save_results {
        let path = PathBuf::from(results_file_name(&run_config.folder, summary.total_processed));
        aggregator.to_export_format().save(&path).await?;
        Some(path)
    } else {
        None
    };

    Ok(RunOutput {
        summary,
        results_path,
        error,
    })
}

/// Fetch up to `limit` messages from `sender` and have the selected provider
/// judge the sender. `None` when the mailbox holds nothing from them.
pub async fn run_sender_analysis(
    cli: &Cli,
    config: &Config,
    sender: &str,
    limit: usize,
    provider: Option<String>,
    reporter: &ProgressReporter,
) -> Result<Option<SenderAnalysis>> {
    if sender.trim().is_empty() {
        return Err(MailbotError::config("sender", "cannot be empty"));
    }
    let overrides = RunOverrides {
        provider,
        limit: Some(limit),
        ..Default::default()
    };
    let run_config = RunConfig::from_config(config, &overrides)?;
    let provider = LlmProvider::from_config(run_config.provider, &config.llm)?;
    let classifier = EmailClassifier::new(provider, 1)?
        .with_retry_delay(Duration::from_millis(config.llm.retry_delay_ms));

    let spinner = reporter.add_spinner("Connecting to mailbox...");
    let gateway = build_gateway(cli, config).await?;
    reporter.finish_spinner(&spinner, &format!("Connected to {}", gateway.name()));

    analyze_sender_with(&classifier, gateway.as_ref(), sender, run_config.limit, reporter).await
}

/// Fetch-then-analyze half of [`run_sender_analysis`]
pub async fn analyze_sender_with(
    classifier: &EmailClassifier,
    gateway: &dyn MailboxGateway,
    sender: &str,
    limit: usize,
    reporter: &ProgressReporter,
) -> Result<Option<SenderAnalysis>> {
    let sender = sender.trim();
    let spinner = reporter.add_spinner(&format!("Fetching messages from {}...", sender));
    let messages = gateway.fetch_from_sender(sender, limit).await?;
    reporter.finish_spinner(&spinner, &format!("Fetched {} messages", messages.len()));

    if messages.is_empty() {
        return Ok(None);
    }

    let spinner = reporter.add_spinner(&format!("Analyzing {}...", sender));
    let analysis = classifier.analyze_sender(sender, &messages).await;
    reporter.finish_spinner(&spinner, "Analysis complete");
    Ok(Some(analysis))
}

fn describe_live_actions(config: &RunConfig) -> String {
    match (config.auto_delete, &config.promotional_folder) {
        (true, Some(folder)) => format!("deleted (JUNK) or moved to '{}' (PROMOTIONAL)", folder),
        (true, None) => "deleted (JUNK)".to_string(),
        (false, Some(folder)) => format!("moved to '{}' (PROMOTIONAL)", folder),
        (false, None) => "left untouched (no actions enabled)".to_string(),
    }
}

/// Plain-text summary table for the terminal
pub fn format_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    out.push_str("\n========================================\n");
    if summary.dry_run {
        out.push_str("Classification Summary (DRY RUN)\n");
    } else {
        out.push_str("Classification Summary\n");
    }
    out.push_str("========================================\n");
    out.push_str(&format!("Run ID:     {}\n", summary.run_id));
    out.push_str(&format!("Provider:   {}\n", summary.provider));
    out.push_str(&format!("Processed:  {}\n", summary.total_processed));
    out.push('\n');

    for category in Category::ALL {
        out.push_str(&format!("{:<12} {:>5}\n", category.label(), summary.category_count(category)));
    }
    out.push('\n');

    for action in [ActionKind::Delete, ActionKind::Move, ActionKind::None] {
        out.push_str(&format!("{:<12} {:>5}\n", action.to_string(), summary.action_count(action)));
    }
    out.push_str(&format!("{:<12} {:>5}\n", "EXECUTED", summary.executed_actions));

    if !summary.errors.is_empty() {
        out.push_str(&format!("\nErrors: {}\n", summary.errors.len()));
        for error in summary.errors.iter().take(10) {
            out.push_str(&format!("  {} ({:?}): {}\n", error.message_id, error.kind, error.detail));
        }
    }
    if summary.rate_limited() {
        out.push_str("\nThe mailbox rate-limited some actions; rerun later to finish.\n");
    }
    if summary.aborted {
        out.push_str("\nRun was cancelled before all messages were processed.\n");
    }
    if summary.dry_run {
        out.push_str("\nNo changes were made. Use `clean --live` to apply actions.\n");
    }
    out.push_str("========================================\n");
    out
}

pub fn format_sender_analysis(analysis: &SenderAnalysis) -> String {
    let mut out = String::new();
    out.push_str("\n========================================\n");
    out.push_str("Sender Analysis\n");
    out.push_str("========================================\n");
    out.push_str(&format!("Sender:      {}\n", analysis.sender));
    out.push_str(&format!("Domain:      {}\n", analysis.domain));
    out.push_str(&format!("Messages:    {}\n", analysis.message_count));
    out.push_str(&format!("Category:    {}\n", analysis.sender_category));
    out.push_str(&format!("Confidence:  {:.2}\n", analysis.confidence));
    out.push_str(&format!("Rule:        {}\n", analysis.suggested_rule));
    out.push_str(&format!("Provider:    {}\n", analysis.provider_used));
    if let Some(reasoning) = &analysis.reasoning {
        out.push_str(&format!("Reasoning:   {}\n", reasoning));
    }
    out.push_str("========================================\n");
    out
}

/// Provider table for the `providers` command
pub fn format_providers(selected: Option<ProviderKind>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<3}{:<11}{:<26}{:<8}{:<7}{}\n",
        "", "PROVIDER", "DEFAULT MODEL", "BATCH", "TIER", "API KEY"
    ));
    for kind in ProviderKind::ALL {
        let marker = if Some(kind) == selected { "*" } else { "" };
        out.push_str(&format!(
            "{:<3}{:<11}{:<26}{:<8}{:<7}{} ({})\n",
            marker,
            kind.name(),
            kind.default_model(),
            if kind.supports_batch() { "yes" } else { "no" },
            if kind.is_free_tier() { "free" } else { "paid" },
            if kind.has_api_key() { "set" } else { "missing" },
            kind.api_key_env(),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_file_name() {
        assert_eq!(results_file_name("INBOX", 42), "classification_results_inbox_42.json");
        assert_eq!(
            results_file_name("Old Stuff/2023", 0),
            "classification_results_old_stuff_2023_0.json"
        );
    }

    #[test]
    fn test_analyze_forces_dry_run() {
        let cli = Cli::parse_from(["mailbot", "analyze", "--limit", "10", "--provider", "groq"]);
        let overrides = cli.command.run_overrides().unwrap();
        assert_eq!(overrides.dry_run, Some(true));
        assert_eq!(overrides.limit, Some(10));
        assert_eq!(overrides.provider.as_deref(), Some("groq"));
    }

    #[test]
    fn test_clean_flags_map_to_overrides() {
        let cli = Cli::parse_from([
            "mailbot",
            "clean",
            "--auto-delete",
            "--confidence-threshold",
            "0.9",
            "--promotional-folder",
            "Promotions",
            "--live",
        ]);
        let overrides = cli.command.run_overrides().unwrap();
        assert_eq!(overrides.dry_run, Some(false));
        assert_eq!(overrides.auto_delete, Some(true));
        assert_eq!(overrides.confidence_threshold, Some(0.9));
        assert_eq!(overrides.promotional_folder.as_deref(), Some("Promotions"));
    }

    #[test]
    fn test_clean_without_live_keeps_config_dry_run() {
        let cli = Cli::parse_from(["mailbot", "clean"]);
        let overrides = cli.command.run_overrides().unwrap();
        assert_eq!(overrides.dry_run, None);
        assert_eq!(overrides.auto_delete, None);
    }

    #[test]
    fn test_providers_table_marks_selection() {
        let table = format_providers(Some(ProviderKind::Gemini));
        let gemini_line = table.lines().find(|l| l.contains("gemini")).unwrap();
        assert!(gemini_line.starts_with('*'));
        let groq_line = table.lines().find(|l| l.contains("groq")).unwrap();
        assert!(groq_line.contains(" no "));
    }

    #[test]
    fn test_format_summary_mentions_dry_run() {
        let summary = RunAggregator::new("groq", true).summarize();
        let text = format_summary(&summary);
        assert!(text.contains("DRY RUN"));
        assert!(text.contains("JUNK"));
    }

    #[test]
    fn test_sender_analysis_arguments() {
        let cli = Cli::parse_from([
            "mailbot",
            "sender-analysis",
            "--sender",
            "deals@shop.example",
            "--limit",
            "20",
        ]);
        match &cli.command {
            Commands::SenderAnalysis {
                sender,
                limit,
                provider,
            } => {
                assert_eq!(sender, "deals@shop.example");
                assert_eq!(*limit, 20);
                assert!(provider.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(cli.command.run_overrides().is_none());
    }

    #[test]
    fn test_sender_analysis_requires_sender() {
        assert!(Cli::try_parse_from(["mailbot", "sender-analysis"]).is_err());
    }
}
