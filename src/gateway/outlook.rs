//! Outlook gateway over the Microsoft Graph REST API.
//!
//! Token acquisition happens outside this crate; the gateway takes a bearer
//! token (from `MS_GRAPH_TOKEN` when built with [`OutlookGateway::from_env`]).

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::MailboxGateway;
use crate::error::{MailbotError, Result};
use crate::models::{ActionKind, Message};

pub const TOKEN_ENV: &str = "MS_GRAPH_TOKEN";
const MAX_PAGE_SIZE: usize = 50;
const SELECT_FIELDS: &str = "id,subject,from,receivedDateTime,bodyPreview";

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<GraphRecipient>,
    #[serde(default)]
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    body_preview: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphEmailAddress,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolder {
    id: String,
    display_name: String,
}

const WELL_KNOWN_FOLDERS: [&str; 6] = [
    "inbox",
    "junkemail",
    "deleteditems",
    "archive",
    "sentitems",
    "drafts",
];

fn well_known(folder: &str) -> Option<String> {
    let lower = folder.trim().to_lowercase();
    WELL_KNOWN_FOLDERS.contains(&lower.as_str()).then_some(lower)
}

/// Graph folder segment: well-known names pass through lowercased
fn folder_segment(folder: &str) -> String {
    well_known(folder).unwrap_or_else(|| folder.trim().to_string())
}

/// OData filter matching the sender address exactly
fn sender_filter(sender: &str) -> String {
    format!(
        "from/emailAddress/address eq '{}'",
        sender.trim().replace('\'', "''")
    )
}

fn to_message(raw: serde_json::Value, folder: &str) -> Result<Message> {
    let graph: GraphMessage = serde_json::from_value(raw.clone())
        .map_err(|e| MailbotError::InvalidResponse(format!("Graph message: {}", e)))?;

    let (sender_name, sender) = graph
        .from
        .map(|r| {
            (
                r.email_address.name.unwrap_or_default(),
                r.email_address.address.unwrap_or_default(),
            )
        })
        .unwrap_or_default();

    Ok(Message {
        id: graph.id,
        folder: folder.to_string(),
        sender,
        sender_name,
        subject: graph.subject.unwrap_or_default(),
        snippet: graph.body_preview.unwrap_or_default(),
        received_at: graph.received_date_time.unwrap_or_else(Utc::now),
        raw,
    })
}

pub struct OutlookGateway {
    http: reqwest::Client,
    base_url: String,
    token: String,
    /// Display name (lowercase) -> folder id
    folder_cache: Mutex<HashMap<String, String>>,
}

impl OutlookGateway {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            folder_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env(base_url: impl Into<String>) -> Result<Self> {
        let token = std::env::var(TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| MailbotError::config(TOKEN_ENV, "Microsoft Graph access token is not set"))?;
        Ok(Self::new(base_url, token))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(MailbotError::from_status(status.as_u16(), &headers, &body));
        }
        response
            .json()
            .await
            .map_err(|e| MailbotError::InvalidResponse(format!("Graph response: {}", e)))
    }

    /// Messages across pages; the next page is requested only when the
    /// consumer asks for more.
    fn messages<'a>(
        &'a self,
        first: reqwest::RequestBuilder,
    ) -> impl Stream<Item = Result<serde_json::Value>> + 'a {
        try_stream! {
            let mut page: Page<serde_json::Value> = self.send_json(first).await?;
            loop {
                for item in page.value {
                    yield item;
                }
                match page.next_link {
                    Some(link) => {
                        debug!("Following Graph nextLink");
                        page = self.send_json(self.http.get(link)).await?;
                    }
                    None => break,
                }
            }
        }
    }

    async fn collect(
        &self,
        first: reqwest::RequestBuilder,
        limit: usize,
        folder: &str,
    ) -> Result<Vec<Message>> {
        let stream = self.messages(first);
        futures::pin_mut!(stream);

        let mut messages = Vec::new();
        while messages.len() < limit {
            match stream.next().await {
                Some(raw) => messages.push(to_message(raw?, folder)?),
                None => break,
            }
        }
        Ok(messages)
    }

    async fn resolve_folder_id(&self, name: &str, message_id: &str) -> Result<String> {
        let key = name.trim().to_lowercase();
        if let Some(id) = self.folder_cache.lock().await.get(&key) {
            return Ok(id.clone());
        }

        // Well-known names are valid destination ids as they are
        if let Some(id) = well_known(name) {
            return Ok(id);
        }

        let filter = format!("displayName eq '{}'", name.trim().replace('\'', "''"));
        let page: Page<GraphFolder> = self
            .send_json(
                self.http
                    .get(format!("{}/me/mailFolders", self.base_url))
                    .query(&[("$filter", filter.as_str())]),
            )
            .await?;

        let folder = page
            .value
            .into_iter()
            .find(|f| f.display_name.eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| MailbotError::ActionExecutionError {
                message_id: message_id.to_string(),
                message: format!("Outlook folder '{}' not found", name),
            })?;

        self.folder_cache.lock().await.insert(key, folder.id.clone());
        Ok(folder.id)
    }

    async fn move_to(&self, message_id: &str, destination_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .send_json(
                self.http
                    .post(format!("{}/me/messages/{}/move", self.base_url, message_id))
                    .json(&serde_json::json!({ "destinationId": destination_id })),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MailboxGateway for OutlookGateway {
    fn name(&self) -> &'static str {
        "outlook"
    }

    async fn fetch(
        &self,
        folder: &str,
        limit: usize,
        since_days: Option<u32>,
    ) -> Result<Vec<Message>> {
        let url = format!("{}/me/mailFolders/{}/messages", self.base_url, folder_segment(folder));
        let mut query = vec![
            ("$top", limit.min(MAX_PAGE_SIZE).to_string()),
            ("$orderby", "receivedDateTime desc".to_string()),
            ("$select", SELECT_FIELDS.to_string()),
        ];
        if let Some(days) = since_days {
            let cutoff = Utc::now() - Duration::days(i64::from(days));
            query.push((
                "$filter",
                format!("receivedDateTime ge {}", cutoff.format("%Y-%m-%dT%H:%M:%SZ")),
            ));
        }

        let messages = self
            .collect(self.http.get(url).query(&query), limit, folder)
            .await?;
        info!("Fetched {} Outlook messages from {}", messages.len(), folder);
        Ok(messages)
    }

    async fn fetch_from_sender(&self, sender: &str, limit: usize) -> Result<Vec<Message>> {
        // Graph rejects $orderby combined with a from/ filter
        let query = [
            ("$top", limit.min(MAX_PAGE_SIZE).to_string()),
            ("$select", SELECT_FIELDS.to_string()),
            ("$filter", sender_filter(sender)),
        ];
        let request = self
            .http
            .get(format!("{}/me/messages", self.base_url))
            .query(&query);

        let messages = self.collect(request, limit, "ALL").await?;
        info!("Fetched {} Outlook messages from {}", messages.len(), sender);
        Ok(messages)
    }

    async fn perform_action(
        &self,
        message_id: &str,
        action: ActionKind,
        target_folder: Option<&str>,
    ) -> Result<()> {
        match action {
            ActionKind::None => Ok(()),
            ActionKind::Delete => self.move_to(message_id, "deleteditems").await,
            ActionKind::Move => {
                let target = target_folder.ok_or_else(|| MailbotError::ActionExecutionError {
                    message_id: message_id.to_string(),
                    message: "MOVE requires a target folder".to_string(),
                })?;
                let destination = self.resolve_folder_id(target, message_id).await?;
                self.move_to(message_id, &destination).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn graph_message(id: &str, subject: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "subject": subject,
            "from": {"emailAddress": {"name": "Sender", "address": "sender@example.com"}},
            "receivedDateTime": "2024-05-01T12:00:00Z",
            "bodyPreview": "preview"
        })
    }

    #[test]
    fn test_folder_segment() {
        assert_eq!(folder_segment("INBOX"), "inbox");
        assert_eq!(folder_segment("JunkEmail"), "junkemail");
        assert_eq!(folder_segment("Receipts"), "Receipts");
    }

    #[tokio::test]
    async fn test_fetch_follows_next_link_until_limit() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/me/mailFolders/inbox/messages"))
            .and(header("authorization", "Bearer graph-token"))
            .and(query_param("$top", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [graph_message("1", "one"), graph_message("2", "two")],
                "@odata.nextLink": format!("{}/page2", server.uri())
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [graph_message("3", "three"), graph_message("4", "four")],
                "@odata.nextLink": format!("{}/page3", server.uri())
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = OutlookGateway::new(server.uri(), "graph-token");
        let messages = gateway.fetch("INBOX", 3, None).await.unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].id, "1");
        assert_eq!(messages[2].subject, "three");
        assert_eq!(messages[0].sender, "sender@example.com");
        assert_eq!(messages[0].sender_name, "Sender");
        assert_eq!(messages[0].received_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_sender_filter_escapes_quotes() {
        assert_eq!(
            sender_filter(" o'brien@example.com "),
            "from/emailAddress/address eq 'o''brien@example.com'"
        );
    }

    #[tokio::test]
    async fn test_fetch_from_sender_filters_by_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/messages"))
            .and(query_param(
                "$filter",
                "from/emailAddress/address eq 'sender@example.com'",
            ))
            .and(query_param("$top", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [graph_message("a", "first"), graph_message("b", "second")]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = OutlookGateway::new(server.uri(), "t");
        let messages = gateway
            .fetch_from_sender("sender@example.com", 2)
            .await
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].subject, "second");
        assert_eq!(messages[0].folder, "ALL");
    }

    #[tokio::test]
    async fn test_fetch_unauthorized_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("InvalidAuthenticationToken"))
            .mount(&server)
            .await;

        let gateway = OutlookGateway::new(server.uri(), "expired");
        let err = gateway.fetch("inbox", 10, Some(7)).await.unwrap_err();
        assert!(matches!(err, MailbotError::AuthError(_)));
    }

    #[tokio::test]
    async fn test_delete_moves_to_deleted_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/messages/abc/move"))
            .and(body_json(serde_json::json!({"destinationId": "deleteditems"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(graph_message("abc", "x")))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = OutlookGateway::new(server.uri(), "t");
        gateway
            .perform_action("abc", ActionKind::Delete, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_move_resolves_folder_by_display_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/mailFolders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [{"id": "folder-42", "displayName": "Promotions"}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/me/messages/m1/move"))
            .and(body_json(serde_json::json!({"destinationId": "folder-42"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(graph_message("m1", "x")))
            .expect(2)
            .mount(&server)
            .await;

        let gateway = OutlookGateway::new(server.uri(), "t");
        gateway
            .perform_action("m1", ActionKind::Move, Some("Promotions"))
            .await
            .unwrap();
        // Second move uses the cached folder id
        gateway
            .perform_action("m1", ActionKind::Move, Some("promotions"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_move_to_missing_folder_fails_for_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/mailFolders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": []})))
            .mount(&server)
            .await;

        let gateway = OutlookGateway::new(server.uri(), "t");
        let err = gateway
            .perform_action("m1", ActionKind::Move, Some("Nowhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, MailbotError::ActionExecutionError { .. }));
    }

    #[tokio::test]
    async fn test_action_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&server)
            .await;

        let gateway = OutlookGateway::new(server.uri(), "t");
        let err = gateway
            .perform_action("m1", ActionKind::Delete, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MailbotError::RateLimitExceeded { retry_after: 30 }));
    }
}
