//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mailbot::error::{MailbotError, Result};
use mailbot::gateway::MailboxGateway;
use mailbot::llm::LlmTransport;
use mailbot::models::{ActionKind, Message};
use mockall::mock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Create a test message. The subject embeds `[id]` so scripted transports can
/// recognise the prompt built for it.
pub fn create_test_message(id: &str, sender: &str, subject: &str) -> Message {
    Message {
        id: id.to_string(),
        folder: "INBOX".to_string(),
        sender: sender.to_string(),
        sender_name: "Test Sender".to_string(),
        subject: format!("[{}] {}", id, subject),
        snippet: format!("Body of {}", subject),
        received_at: Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap(),
        raw: serde_json::Value::Null,
    }
}

/// `count` messages with ids m1..=m<count>
pub fn create_test_messages(count: usize) -> Vec<Message> {
    (1..=count)
        .map(|i| {
            create_test_message(
                &format!("m{}", i),
                &format!("sender{}@example.com", i),
                "Weekly update",
            )
        })
        .collect()
}

/// Marker that appears only in the prompt built for `id`
pub fn marker(id: &str) -> String {
    format!("[{}]", id)
}

/// JSON answer in the shape the prompts ask for
pub fn answer(category: &str, confidence: f32) -> String {
    format!(
        r#"{{"category": "{}", "confidence": {}, "reason": "test"}}"#,
        category, confidence
    )
}

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    RateLimited,
    ServerError,
    Unauthorized,
}

impl Reply {
    fn into_result(self) -> Result<String> {
        match self {
            Reply::Text(text) => Ok(text),
            Reply::RateLimited => Err(MailbotError::RateLimitExceeded { retry_after: 1 }),
            Reply::ServerError => Err(MailbotError::ServerError {
                status: 503,
                message: "unavailable".to_string(),
            }),
            Reply::Unauthorized => Err(MailbotError::AuthError("bad key".to_string())),
        }
    }
}

/// Transport that answers prompts by substring match. Each rule holds a queue
/// of replies; the last reply repeats once the queue is drained.
#[derive(Default)]
pub struct ScriptedTransport {
    rules: Vec<(String, Mutex<VecDeque<Reply>>)>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to prompts containing `needle`. Earlier rules win.
    pub fn on(mut self, needle: impl Into<String>, replies: Vec<Reply>) -> Self {
        self.rules.push((needle.into(), Mutex::new(replies.into())));
        self
    }

    /// Shorthand for a single-message answer keyed by message id
    pub fn answer(self, id: &str, category: &str, confidence: f32) -> Self {
        self.on(marker(id), vec![Reply::Text(answer(category, confidence))])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmTransport for ScriptedTransport {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());

        for (needle, replies) in &self.rules {
            if prompt.contains(needle.as_str()) {
                let mut replies = replies.lock().unwrap();
                let reply = if replies.len() > 1 {
                    replies.pop_front()
                } else {
                    replies.front().cloned()
                };
                return reply
                    .unwrap_or_else(|| Reply::Text(String::new()))
                    .into_result();
            }
        }

        Err(MailbotError::ApiError("no scripted reply".to_string()))
    }
}

mock! {
    pub Transport {}

    #[async_trait]
    impl LlmTransport for Transport {
        async fn complete(&self, prompt: &str) -> Result<String>;
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FailWith {
    Auth,
    RateLimited,
    NotFound,
}

impl FailWith {
    fn to_error(self, message_id: &str) -> MailbotError {
        match self {
            FailWith::Auth => MailbotError::AuthError("token expired".to_string()),
            FailWith::RateLimited => MailbotError::RateLimitExceeded { retry_after: 30 },
            FailWith::NotFound => MailbotError::MessageNotFound(message_id.to_string()),
        }
    }
}

/// In-memory mailbox that records every action it is asked to perform
#[derive(Default)]
pub struct RecordingGateway {
    messages: Vec<Message>,
    failures: HashMap<String, FailWith>,
    actions: Mutex<Vec<(String, ActionKind, Option<String>)>>,
    fetch_calls: AtomicUsize,
}

impl RecordingGateway {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn fail_on(mut self, message_id: &str, failure: FailWith) -> Self {
        self.failures.insert(message_id.to_string(), failure);
        self
    }

    pub fn actions(&self) -> Vec<(String, ActionKind, Option<String>)> {
        self.actions.lock().unwrap().clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailboxGateway for RecordingGateway {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn fetch(
        &self,
        _folder: &str,
        limit: usize,
        _since_days: Option<u32>,
    ) -> Result<Vec<Message>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.messages.iter().take(limit).cloned().collect())
    }

    async fn fetch_from_sender(&self, sender: &str, limit: usize) -> Result<Vec<Message>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .messages
            .iter()
            .filter(|m| m.sender.eq_ignore_ascii_case(sender))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn perform_action(
        &self,
        message_id: &str,
        action: ActionKind,
        target_folder: Option<&str>,
    ) -> Result<()> {
        self.actions.lock().unwrap().push((
            message_id.to_string(),
            action,
            target_folder.map(str::to_string),
        ));

        match self.failures.get(message_id) {
            Some(failure) => Err(failure.to_error(message_id)),
            None => Ok(()),
        }
    }
}
