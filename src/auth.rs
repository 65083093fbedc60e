//! OAuth2 authentication for the Gmail mailbox gateway

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MailbotError, Result};

/// Scopes needed to read, trash and relabel messages
///
/// - gmail.modify: read/write access without permanent deletion
/// - gmail.labels: resolve or create the target label for MOVE
pub const REQUIRED_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.labels",
];

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Initialize Gmail API hub with OAuth2 authentication
///
/// Uses the installed-app flow (a browser window opens on first use) and
/// persists tokens to `token_cache_path` so later runs refresh silently.
pub async fn initialize_gmail_hub(
    credentials_path: &Path,
    token_cache_path: &Path,
) -> Result<GmailHub> {
    let secret = yup_oauth2::read_application_secret(credentials_path)
        .await
        .map_err(|e| {
            MailbotError::AuthError(format!(
                "Failed to read credentials from {}: {}",
                credentials_path.display(),
                e
            ))
        })?;

    if let Some(parent) = token_cache_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_cache_path)
    .build()
    .await
    .map_err(|e| MailbotError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    // Fetch once up front so the cached token carries every scope we use
    auth.token(REQUIRED_SCOPES)
        .await
        .map_err(|e| MailbotError::AuthError(format!("Failed to obtain token: {}", e)))?;

    if token_cache_path.exists() {
        secure_token_file(token_cache_path).await?;
    }

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| MailbotError::AuthError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, auth))
}

/// Google's OAuth2 client file for desktop apps
#[derive(Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub installed: InstalledApp,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstalledApp {
    pub client_id: String,
    #[serde(default)]
    pub project_id: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

/// Load and sanity-check the OAuth2 client file
pub async fn load_credentials(path: &Path) -> Result<Credentials> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        MailbotError::config(
            path.display().to_string(),
            format!("cannot read OAuth credentials: {}", e),
        )
    })?;
    let creds: Credentials = serde_json::from_str(&content).map_err(|e| {
        MailbotError::config(
            path.display().to_string(),
            format!("not a desktop-app OAuth client file: {}", e),
        )
    })?;
    Ok(creds)
}

/// Restrict the token cache to the owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    // NTFS ACLs already scope the profile directory to the user
    Ok(())
}
