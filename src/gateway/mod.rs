//! Mailbox gateways: fetching messages and applying delete/move actions.

pub mod gmail;
pub mod outlook;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{ActionKind, Message};

pub use gmail::GmailGateway;
pub use outlook::OutlookGateway;

/// Narrow interface the pipeline uses to talk to a mailbox provider.
///
/// Implementations surface `AuthError` and `RateLimitExceeded` unchanged so
/// the pipeline can tell fatal failures from per-message ones.
#[async_trait]
pub trait MailboxGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Newest-first messages from `folder`, at most `limit`, optionally only
    /// those received in the last `since_days` days.
    async fn fetch(&self, folder: &str, limit: usize, since_days: Option<u32>)
        -> Result<Vec<Message>>;

    /// Newest-first messages from `sender` across the mailbox, at most `limit`
    async fn fetch_from_sender(&self, sender: &str, limit: usize) -> Result<Vec<Message>>;

    /// Apply `action` to one message. `target_folder` is required for MOVE;
    /// NONE is a no-op.
    async fn perform_action(
        &self,
        message_id: &str,
        action: ActionKind,
        target_folder: Option<&str>,
    ) -> Result<()>;
}

#[async_trait]
impl<T: MailboxGateway + ?Sized> MailboxGateway for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn fetch(
        &self,
        folder: &str,
        limit: usize,
        since_days: Option<u32>,
    ) -> Result<Vec<Message>> {
        (**self).fetch(folder, limit, since_days).await
    }

    async fn fetch_from_sender(&self, sender: &str, limit: usize) -> Result<Vec<Message>> {
        (**self).fetch_from_sender(sender, limit).await
    }

    async fn perform_action(
        &self,
        message_id: &str,
        action: ActionKind,
        target_folder: Option<&str>,
    ) -> Result<()> {
        (**self).perform_action(message_id, action, target_folder).await
    }
}

/// Split a `Name <address>` header into (name, address)
pub fn parse_address(header: &str) -> (String, String) {
    if let (Some(start), Some(end)) = (header.find('<'), header.rfind('>')) {
        if start < end {
            let name = header[..start].trim().trim_matches('"').to_string();
            let address = header[start + 1..end].trim().to_string();
            return (name, address);
        }
    }
    (String::new(), header.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_with_name() {
        let (name, address) = parse_address("\"Acme Deals\" <deals@acme.example>");
        assert_eq!(name, "Acme Deals");
        assert_eq!(address, "deals@acme.example");
    }

    #[test]
    fn test_parse_address_bare() {
        let (name, address) = parse_address(" alice@example.com ");
        assert_eq!(name, "");
        assert_eq!(address, "alice@example.com");
    }
}
