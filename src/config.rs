use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MailbotError, Result};
use crate::llm::ProviderKind;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub run: RunSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// groq, gemini, openai or anthropic. There is no default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Overrides the provider's default model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Messages per request; unset means the provider default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default = "default_llm_concurrency")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            base_url: None,
            batch_size: None,
            max_concurrent_requests: default_llm_concurrency(),
            timeout_secs: default_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MailboxKind {
    #[default]
    Gmail,
    Outlook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    #[serde(default)]
    pub provider: MailboxKind,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: PathBuf,
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    #[serde(default = "default_mailbox_concurrency")]
    pub max_concurrent_requests: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            provider: MailboxKind::default(),
            credentials_path: default_credentials_path(),
            token_cache_path: default_token_cache_path(),
            graph_base_url: default_graph_base_url(),
            max_concurrent_requests: default_mailbox_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_days: Option<u32>,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Folder/label that PROMOTIONAL messages are moved to. Routing is off
    /// while unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotional_folder: Option<String>,
    #[serde(default)]
    pub save_results: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            folder: default_folder(),
            limit: default_limit(),
            since_days: None,
            dry_run: default_dry_run(),
            auto_delete: false,
            confidence_threshold: default_confidence_threshold(),
            promotional_folder: None,
            save_results: false,
        }
    }
}

fn default_llm_concurrency() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_token_cache_path() -> PathBuf {
    PathBuf::from(".mailbot/token.json")
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_mailbox_concurrency() -> usize {
    10
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_limit() -> usize {
    50
}

fn default_dry_run() -> bool {
    true
}

fn default_confidence_threshold() -> f32 {
    0.8
}

/// Upper bound on messages handled in one run
pub const MAX_MESSAGES_PER_RUN: usize = 500;

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            MailbotError::config(path.display().to_string(), format!("Failed to read config file: {}", e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            MailbotError::config(path.display().to_string(), format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| MailbotError::config("config", format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content).await?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if let Some(provider) = &self.llm.provider {
            provider.parse::<ProviderKind>()?;
        }

        if self.llm.batch_size == Some(0) {
            return Err(MailbotError::config("llm.batch_size", "must be at least 1"));
        }

        if !(1..=10).contains(&self.llm.max_concurrent_requests) {
            return Err(MailbotError::config(
                "llm.max_concurrent_requests",
                "must be between 1 and 10",
            ));
        }

        if self.llm.timeout_secs == 0 {
            return Err(MailbotError::config("llm.timeout_secs", "must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(MailbotError::config("llm.temperature", "must be between 0.0 and 2.0"));
        }

        if self.llm.max_tokens == 0 {
            return Err(MailbotError::config("llm.max_tokens", "must be greater than 0"));
        }

        // Gmail allows 250 quota units/sec; keep concurrent fetches well under that
        if !(1..=50).contains(&self.mailbox.max_concurrent_requests) {
            return Err(MailbotError::config(
                "mailbox.max_concurrent_requests",
                "must be between 1 and 50",
            ));
        }

        if self.run.folder.trim().is_empty() {
            return Err(MailbotError::config("run.folder", "cannot be empty"));
        }

        if self.run.limit == 0 || self.run.limit > MAX_MESSAGES_PER_RUN {
            return Err(MailbotError::config(
                "run.limit",
                format!("must be between 1 and {}", MAX_MESSAGES_PER_RUN),
            ));
        }

        if self.run.since_days == Some(0) {
            return Err(MailbotError::config("run.since_days", "must be at least 1"));
        }

        check_threshold("run.confidence_threshold", self.run.confidence_threshold)?;

        if matches!(&self.run.promotional_folder, Some(folder) if folder.trim().is_empty()) {
            return Err(MailbotError::config("run.promotional_folder", "cannot be empty"));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let mut config = Self::default();
        config.llm.provider = Some(ProviderKind::Groq.name().to_string());
        config.save(path).await
    }
}

fn check_threshold(key: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(MailbotError::config(key, "must be between 0.0 and 1.0"));
    }
    Ok(())
}

/// Values supplied on the command line; `None` keeps the config file value
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub provider: Option<String>,
    pub folder: Option<String>,
    pub limit: Option<usize>,
    pub since_days: Option<u32>,
    pub dry_run: Option<bool>,
    pub auto_delete: Option<bool>,
    pub confidence_threshold: Option<f32>,
    pub promotional_folder: Option<String>,
    pub save_results: Option<bool>,
}

/// Fully resolved settings for one invocation. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub provider: ProviderKind,
    pub folder: String,
    pub limit: usize,
    pub since_days: Option<u32>,
    pub dry_run: bool,
    pub auto_delete: bool,
    pub confidence_threshold: f32,
    pub promotional_folder: Option<String>,
    pub batch_size: usize,
    pub save_results: bool,
}

impl RunConfig {
    /// Defaults for `provider`: dry-run, threshold 0.8, no routing
    pub fn new(provider: ProviderKind) -> Self {
        let settings = RunSettings::default();
        Self {
            provider,
            folder: settings.folder,
            limit: settings.limit,
            since_days: settings.since_days,
            dry_run: settings.dry_run,
            auto_delete: settings.auto_delete,
            confidence_threshold: settings.confidence_threshold,
            promotional_folder: settings.promotional_folder,
            batch_size: provider.default_batch_size(),
            save_results: settings.save_results,
        }
    }

    /// Resolve file settings and command-line overrides into a validated run
    /// configuration.
    pub fn from_config(config: &Config, overrides: &RunOverrides) -> Result<Self> {
        let provider_name = overrides
            .provider
            .as_deref()
            .or(config.llm.provider.as_deref())
            .ok_or_else(|| {
                MailbotError::config(
                    "llm.provider",
                    "no LLM provider selected; set llm.provider or pass --provider",
                )
            })?;
        let provider: ProviderKind = provider_name.parse()?;

        let run = &config.run;
        let resolved = Self {
            provider,
            folder: overrides.folder.clone().unwrap_or_else(|| run.folder.clone()),
            limit: overrides.limit.unwrap_or(run.limit),
            since_days: overrides.since_days.or(run.since_days),
            dry_run: overrides.dry_run.unwrap_or(run.dry_run),
            auto_delete: overrides.auto_delete.unwrap_or(run.auto_delete),
            confidence_threshold: overrides
                .confidence_threshold
                .unwrap_or(run.confidence_threshold),
            promotional_folder: overrides
                .promotional_folder
                .clone()
                .or_else(|| run.promotional_folder.clone()),
            batch_size: config
                .llm
                .batch_size
                .unwrap_or_else(|| provider.default_batch_size()),
            save_results: overrides.save_results.unwrap_or(run.save_results),
        };

        resolved.validate()?;
        Ok(resolved)
    }

    /// Re-assert the run invariants. Batching with a provider that cannot
    /// batch is rejected here, before any request is made.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 || self.limit > MAX_MESSAGES_PER_RUN {
            return Err(MailbotError::config(
                "run.limit",
                format!("must be between 1 and {}", MAX_MESSAGES_PER_RUN),
            ));
        }

        if self.folder.trim().is_empty() {
            return Err(MailbotError::config("run.folder", "cannot be empty"));
        }

        if self.since_days == Some(0) {
            return Err(MailbotError::config("run.since_days", "must be at least 1"));
        }

        check_threshold("run.confidence_threshold", self.confidence_threshold)?;

        if matches!(&self.promotional_folder, Some(folder) if folder.trim().is_empty()) {
            return Err(MailbotError::config("run.promotional_folder", "cannot be empty"));
        }

        if self.batch_size == 0 {
            return Err(MailbotError::config("llm.batch_size", "must be at least 1"));
        }

        if self.batch_size > 1 && !self.provider.supports_batch() {
            return Err(MailbotError::UnsupportedOperation {
                provider: self.provider.name().to_string(),
                operation: format!("batch classification (batch_size = {})", self.batch_size),
            });
        }

        Ok(())
    }
}
