//! Mailbot
//!
//! Classifies email with a large language model and applies a small action
//! policy to the results: delete junk, move promotions, leave the rest.
//!
//! # Overview
//!
//! A run flows through these stages:
//! - **Fetch**: read messages from a Gmail or Outlook folder
//! - **Prompt**: render single-message or batch classification prompts
//! - **Classify**: ask the selected LLM provider and parse its answer
//! - **Decide**: map each classification to DELETE, MOVE or NONE
//! - **Act**: apply the decision through the mailbox gateway (skipped in dry-run)
//! - **Aggregate**: count categories, actions and errors into a run summary
//!
//! # Example Usage
//!
//! ```no_run
//! use mailbot::{
//!     classifier::EmailClassifier,
//!     config::{Config, RunConfig, RunOverrides},
//!     gateway::OutlookGateway,
//!     llm::LlmProvider,
//!     pipeline::Pipeline,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("mailbot.toml".as_ref()).await?;
//!     let run = RunConfig::from_config(&config, &RunOverrides::default())?;
//!
//!     let provider = LlmProvider::from_config(run.provider, &config.llm)?;
//!     let classifier = EmailClassifier::new(provider, run.batch_size)?;
//!     let gateway = OutlookGateway::from_env(config.mailbox.graph_base_url.clone())?;
//!
//!     let summary = Pipeline::new(&classifier, &gateway, &run).run().await?;
//!     println!("{}", summary.to_markdown());
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`aggregator`] - Run summary and JSON export
//! - [`auth`] - OAuth2 authentication and Gmail API initialization
//! - [`classifier`] - LLM answer parsing, retries and batch fallback
//! - [`cli`] - Command-line interface and run orchestration
//! - [`config`] - Configuration file, overrides and resolved run settings
//! - [`error`] - Error types and result aliases
//! - [`gateway`] - Gmail and Outlook mailbox access
//! - [`llm`] - Provider selection and HTTP transports
//! - [`models`] - Core data structures
//! - [`pipeline`] - Fetch, classify, decide, act, record
//! - [`policy`] - Classification to action decisions
//! - [`prompt`] - Prompt rendering
//! - [`retry`] - Bounded retry with fixed or exponential backoff

pub mod aggregator;
pub mod auth;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod prompt;
pub mod retry;

pub use error::{MailbotError, Result};

pub use models::{
    ActionDecision, ActionKind, Category, Classification, Message, SenderAnalysis,
};

pub use aggregator::{RunAggregator, RunSummary};
pub use classifier::EmailClassifier;
pub use config::{Config, RunConfig};
pub use gateway::MailboxGateway;
pub use llm::{LlmProvider, LlmTransport, ProviderKind};
pub use pipeline::{run_classification_pipeline, Pipeline};
