use hyper::header::HeaderMap;
use thiserror::Error;

/// Type alias for Result with MailbotError
pub type Result<T> = std::result::Result<T, MailbotError>;

/// Error types for the classification-and-action pipeline
#[derive(Error, Debug)]
pub enum MailbotError {
    /// Invalid or missing configuration. `key` names the offending setting or
    /// environment variable.
    #[error("Configuration error ({key}): {message}")]
    ConfigError { key: String, message: String },

    /// Mailbox or LLM authentication failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Classification of a single message failed after retries
    #[error("Classification failed for message {message_id}: {message}")]
    ProviderError { message_id: String, message: String },

    /// The selected LLM provider cannot perform the requested operation
    #[error("Provider {provider} does not support {operation}")]
    UnsupportedOperation { provider: String, operation: String },

    /// Mailbox action (delete/move) failed for a message
    #[error("Action failed for message {message_id}: {message}")]
    ActionExecutionError { message_id: String, message: String },

    /// User cancelled operation
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// Remote API returned an error that fits no other variant
    #[error("API error: {0}")]
    ApiError(String),

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Response body did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl MailbotError {
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        MailbotError::ConfigError {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MailbotError::RateLimitExceeded { .. }
                | MailbotError::ServerError { .. }
                | MailbotError::NetworkError(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Errors that abort the whole run instead of being recorded per message
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MailbotError::ConfigError { .. }
                | MailbotError::AuthError(_)
                | MailbotError::UnsupportedOperation { .. }
                | MailbotError::OperationCancelled(_)
        )
    }

    /// Map a non-success HTTP status to an error. Shared by the LLM transports
    /// and the Graph gateway.
    pub fn from_status(status: u16, headers: &HeaderMap, body: &str) -> Self {
        let message = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, truncate_body(body))
        };

        match status {
            429 => MailbotError::RateLimitExceeded {
                retry_after: parse_retry_after(headers),
            },
            401 | 403 => MailbotError::AuthError(message),
            404 => MailbotError::MessageNotFound(message),
            400 => MailbotError::BadRequest(message),
            500..=599 => MailbotError::ServerError { status, message },
            _ => MailbotError::ApiError(message),
        }
    }
}

fn truncate_body(body: &str) -> &str {
    const MAX: usize = 300;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Parse the Retry-After header
///
/// The Retry-After header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns the number of seconds to wait. If the header is missing, invalid or
/// in the past, returns a default of 5 seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    let Some(value) = headers.get("retry-after").and_then(|v| v.to_str().ok()) else {
        return DEFAULT_RETRY_AFTER;
    };

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return seconds;
    }

    if let Ok(http_date) = httpdate::parse_http_date(value) {
        if let Ok(duration) = http_date.duration_since(std::time::SystemTime::now()) {
            return duration.as_secs();
        }
    }

    DEFAULT_RETRY_AFTER
}

impl From<google_gmail1::Error> for MailbotError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    429 => MailbotError::RateLimitExceeded {
                        retry_after: parse_retry_after(response.headers()),
                    },
                    401 => MailbotError::AuthError(message),
                    404 => MailbotError::MessageNotFound("Resource not found".to_string()),
                    400 => MailbotError::BadRequest(message),
                    403 => MailbotError::Forbidden(message),
                    500..=599 => MailbotError::ServerError {
                        status: status_code,
                        message,
                    },
                    _ => MailbotError::ApiError(message),
                }
            }
            google_gmail1::Error::BadRequest(ref err) => MailbotError::BadRequest(err.to_string()),
            google_gmail1::Error::HttpError(ref err) => {
                MailbotError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => MailbotError::NetworkError(err.to_string()),
            google_gmail1::Error::MissingToken(err) => MailbotError::AuthError(err.to_string()),
            _ => MailbotError::ApiError(error.to_string()),
        }
    }
}

impl From<reqwest::Error> for MailbotError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            MailbotError::NetworkError(error.to_string())
        } else if error.is_decode() {
            MailbotError::InvalidResponse(error.to_string())
        } else if let Some(status) = error.status() {
            MailbotError::from_status(status.as_u16(), &HeaderMap::new(), &error.to_string())
        } else {
            MailbotError::ApiError(error.to_string())
        }
    }
}
