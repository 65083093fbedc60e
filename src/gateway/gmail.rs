//! Gmail gateway on top of the `google-gmail1` hub

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use google_gmail1::api::{Label, Message as GmailMessage, ModifyMessageRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

use super::{parse_address, MailboxGateway};
use crate::auth::GmailHub;
use crate::error::{MailbotError, Result};
use crate::models::{ActionKind, Message};
use crate::retry::{with_retry, Backoff};

const MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
const LABELS_SCOPE: &str = "https://www.googleapis.com/auth/gmail.labels";
const MAX_PAGE_SIZE: usize = 500;
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Backoff = Backoff::Exponential {
    initial: Duration::from_millis(250),
    max: Duration::from_secs(10),
};

/// Gmail search query for a folder/label and optional age window
pub fn build_query(folder: &str, since_days: Option<u32>) -> String {
    let label = folder.trim().to_lowercase().replace(' ', "-");
    match since_days {
        Some(days) => format!("in:{} newer_than:{}d", label, days),
        None => format!("in:{}", label),
    }
}

/// Gmail search query for every message from `sender`
pub fn build_sender_query(sender: &str) -> String {
    format!("from:{}", sender.trim())
}

/// Convert a metadata-format Gmail message into a [`Message`]
pub fn to_message(msg: GmailMessage, folder: &str) -> Result<Message> {
    let id = msg
        .id
        .clone()
        .ok_or_else(|| MailbotError::InvalidResponse("Gmail message without id".to_string()))?;

    let mut sender = String::new();
    let mut sender_name = String::new();
    let mut subject = String::new();
    let mut date_header = None;

    let headers = msg
        .payload
        .as_ref()
        .and_then(|p| p.headers.as_ref())
        .map(|h| h.as_slice())
        .unwrap_or_default();

    for header in headers {
        if let (Some(name), Some(value)) = (&header.name, &header.value) {
            match name.to_lowercase().as_str() {
                "from" => {
                    let (name, address) = parse_address(value);
                    sender_name = name;
                    sender = address;
                }
                "subject" => subject = value.clone(),
                "date" => date_header = Some(value.clone()),
                _ => {}
            }
        }
    }

    let received_at = date_header
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
        .map(|d| d.with_timezone(&Utc))
        .or_else(|| msg.internal_date.and_then(DateTime::from_timestamp_millis))
        .unwrap_or_else(Utc::now);

    let snippet = msg.snippet.clone().unwrap_or_default();
    let raw = serde_json::to_value(&msg).unwrap_or(serde_json::Value::Null);

    Ok(Message {
        id,
        folder: folder.to_string(),
        sender,
        sender_name,
        subject,
        snippet,
        received_at,
        raw,
    })
}

/// Gmail mailbox with semaphore-bounded concurrency and bounded retries
pub struct GmailGateway {
    hub: GmailHub,
    rate_limiter: Arc<Semaphore>,
    max_concurrent: usize,
    /// Label name (lowercase) -> label id
    label_cache: Mutex<Option<HashMap<String, String>>>,
}

impl GmailGateway {
    pub fn new(hub: GmailHub, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            hub,
            rate_limiter: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            label_cache: Mutex::new(None),
        }
    }

    async fn list_message_ids(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        debug!("Listing Gmail messages with query '{}'", query);
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while ids.len() < limit {
            let page_size = (limit - ids.len()).min(MAX_PAGE_SIZE) as u32;
            let mut call = self
                .hub
                .users()
                .messages_list("me")
                .q(query)
                .max_results(page_size);

            if let Some(token) = page_token.as_ref() {
                call = call.page_token(token);
            }

            let (_, response) = call.add_scope(MODIFY_SCOPE).doit().await?;

            ids.extend(
                response
                    .messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| m.id),
            );

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        ids.truncate(limit);
        Ok(ids)
    }

    async fn fetch_all(&self, ids: Vec<String>, folder: &str) -> Result<Vec<Message>> {
        stream::iter(ids)
            .map(|id| async move { self.fetch_single(&id, folder).await })
            .buffered(self.max_concurrent)
            .try_collect()
            .await
    }

    async fn fetch_single(&self, id: &str, folder: &str) -> Result<Message> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| MailbotError::Unknown(format!("Failed to acquire permit: {}", e)))?;

        let msg = with_retry("messages.get", MAX_RETRIES, RETRY_BACKOFF, || async {
            let (_, msg) = self
                .hub
                .users()
                .messages_get("me", id)
                .format("metadata")
                .add_metadata_headers("From")
                .add_metadata_headers("Subject")
                .add_metadata_headers("Date")
                .add_scope(MODIFY_SCOPE)
                .doit()
                .await?;
            Ok(msg)
        })
        .await?;

        to_message(msg, folder)
    }

    async fn load_labels(&self) -> Result<HashMap<String, String>> {
        let (_, response) = self
            .hub
            .users()
            .labels_list("me")
            .add_scope(LABELS_SCOPE)
            .doit()
            .await?;

        Ok(response
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter_map(|label| match (label.id, label.name) {
                (Some(id), Some(name)) => Some((name.to_lowercase(), id)),
                _ => None,
            })
            .collect())
    }

    /// Label id for `name`, creating the label when it does not exist yet
    async fn resolve_label(&self, name: &str) -> Result<String> {
        let mut cache = self.label_cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.load_labels().await?);
        }
        let labels = cache.get_or_insert_with(HashMap::new);

        let key = name.to_lowercase();
        if let Some(id) = labels.get(&key) {
            return Ok(id.clone());
        }

        let label = Label {
            name: Some(name.to_string()),
            message_list_visibility: Some("show".to_string()),
            label_list_visibility: Some("labelShow".to_string()),
            ..Default::default()
        };
        let (_, created) = self
            .hub
            .users()
            .labels_create(label, "me")
            .add_scope(LABELS_SCOPE)
            .doit()
            .await?;

        let id = created
            .id
            .ok_or_else(|| MailbotError::InvalidResponse("Created label has no ID".to_string()))?;
        info!("Created label '{}' ({})", name, id);
        labels.insert(key, id.clone());
        Ok(id)
    }
}

#[async_trait]
impl MailboxGateway for GmailGateway {
    fn name(&self) -> &'static str {
        "gmail"
    }

    async fn fetch(
        &self,
        folder: &str,
        limit: usize,
        since_days: Option<u32>,
    ) -> Result<Vec<Message>> {
        let query = build_query(folder, since_days);
        let ids = self.list_message_ids(&query, limit).await?;
        info!("Found {} messages in {}", ids.len(), folder);

        self.fetch_all(ids, folder).await
    }

    async fn fetch_from_sender(&self, sender: &str, limit: usize) -> Result<Vec<Message>> {
        let query = build_sender_query(sender);
        let ids = self.list_message_ids(&query, limit).await?;
        info!("Found {} messages from {}", ids.len(), sender);

        self.fetch_all(ids, "ALL").await
    }

    async fn perform_action(
        &self,
        message_id: &str,
        action: ActionKind,
        target_folder: Option<&str>,
    ) -> Result<()> {
        match action {
            ActionKind::None => Ok(()),
            ActionKind::Delete => {
                self.hub
                    .users()
                    .messages_trash("me", message_id)
                    .add_scope(MODIFY_SCOPE)
                    .doit()
                    .await?;
                debug!("Moved {} to trash", message_id);
                Ok(())
            }
            ActionKind::Move => {
                let target = target_folder.ok_or_else(|| MailbotError::ActionExecutionError {
                    message_id: message_id.to_string(),
                    message: "MOVE requires a target folder".to_string(),
                })?;
                let label_id = self.resolve_label(target).await?;

                let request = ModifyMessageRequest {
                    add_label_ids: Some(vec![label_id]),
                    remove_label_ids: Some(vec!["INBOX".to_string()]),
                };
                self.hub
                    .users()
                    .messages_modify(request, "me", message_id)
                    .add_scope(MODIFY_SCOPE)
                    .doit()
                    .await?;
                debug!("Moved {} to {}", message_id, target);
                Ok(())
            }
        }
    }
}
