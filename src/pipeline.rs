//! Fetch -> classify -> decide -> act -> record

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregator::{RunAggregator, RunErrorKind, RunSummary};
use crate::classifier::EmailClassifier;
use crate::config::RunConfig;
use crate::error::{MailbotError, Result};
use crate::gateway::MailboxGateway;
use crate::models::Message;
use crate::policy;

/// Progress callback invoked once per processed message
pub type ProgressCallback = Arc<dyn Fn() + Send + Sync>;

pub struct Pipeline<'a> {
    classifier: &'a EmailClassifier,
    gateway: &'a dyn MailboxGateway,
    config: &'a RunConfig,
    on_progress: Option<ProgressCallback>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        classifier: &'a EmailClassifier,
        gateway: &'a dyn MailboxGateway,
        config: &'a RunConfig,
    ) -> Self {
        Self {
            classifier,
            gateway,
            config,
            on_progress: None,
            cancel: None,
        }
    }

    pub fn with_progress(mut self, on_progress: ProgressCallback) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    /// Stop after the current message once `flag` is set
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Checks that must pass before any message is touched
    fn preflight(&self) -> Result<()> {
        self.config.validate()?;

        let provider = self.classifier.provider().kind();
        if provider != self.config.provider {
            return Err(MailbotError::config(
                "llm.provider",
                format!(
                    "classifier uses '{}' but the run is configured for '{}'",
                    provider, self.config.provider
                ),
            ));
        }

        let batch_size = self.classifier.batch_size();
        if batch_size != self.config.batch_size {
            return Err(MailbotError::config(
                "llm.batch_size",
                format!(
                    "classifier batches {} messages but the run is configured for {}",
                    batch_size, self.config.batch_size
                ),
            ));
        }
        Ok(())
    }

    pub async fn fetch(&self) -> Result<Vec<Message>> {
        self.preflight()?;
        self.gateway
            .fetch(&self.config.folder, self.config.limit, self.config.since_days)
            .await
    }

    /// Fetch and process in one go
    pub async fn run(&self) -> Result<RunSummary> {
        let messages = self.fetch().await?;
        self.process(messages).await
    }

    pub async fn process(&self, messages: Vec<Message>) -> Result<RunSummary> {
        let mut aggregator = RunAggregator::new(self.classifier.provider().name(), self.config.dry_run);
        self.process_into(&messages, &mut aggregator).await?;
        Ok(aggregator.summarize())
    }

    /// Process `messages` into `aggregator`. On a fatal error the aggregator
    /// still holds everything recorded up to that point.
    pub async fn process_into(
        &self,
        messages: &[Message],
        aggregator: &mut RunAggregator,
    ) -> Result<()> {
        self.preflight()?;

        let messages = &messages[..messages.len().min(self.config.limit)];
        info!(
            provider = %self.config.provider,
            count = messages.len(),
            dry_run = self.config.dry_run,
            "Processing messages"
        );

        let outcomes = self.classifier.classify(messages);
        futures::pin_mut!(outcomes);
        let mut pending = messages.iter();

        loop {
            // A flag raised while the last message was recorded leaves the run complete
            if self.is_cancelled() && !pending.as_slice().is_empty() {
                info!(processed = aggregator.processed(), "Run cancelled");
                aggregator.mark_aborted();
                break;
            }

            let (Some(outcome), Some(message)) = (outcomes.next().await, pending.next()) else {
                break;
            };

            if let Some(error) = &outcome.error {
                aggregator.record_error(&message.id, RunErrorKind::Provider, error.to_string());
            }

            let mut decision = policy::decide(&outcome.classification, self.config);
            debug!(
                message_id = %message.id,
                category = %outcome.classification.category,
                confidence = outcome.classification.confidence,
                action = %decision.action,
                reason = %decision.reason,
                "Decision"
            );

            let mut fatal = None;
            if decision.executed {
                if let Err(e) = self
                    .gateway
                    .perform_action(&message.id, decision.action, decision.target_folder.as_deref())
                    .await
                {
                    warn!(message_id = %message.id, error = %e, "Action failed");
                    decision.executed = false;
                    decision.error = Some(e.to_string());
                    aggregator.record_error(
                        &message.id,
                        RunErrorKind::for_action_error(&e),
                        e.to_string(),
                    );
                    if e.is_fatal() {
                        fatal = Some(e);
                    }
                }
            }

            aggregator.record(message, outcome.classification, decision);

            if let Some(on_progress) = &self.on_progress {
                on_progress();
            }

            if let Some(e) = fatal {
                return Err(e);
            }
        }

        Ok(())
    }
}

/// Classify `messages`, decide and apply actions, and summarize the run
pub async fn run_classification_pipeline(
    messages: Vec<Message>,
    classifier: &EmailClassifier,
    gateway: &dyn MailboxGateway,
    config: &RunConfig,
) -> Result<RunSummary> {
    Pipeline::new(classifier, gateway, config)
        .process(messages)
        .await
}
