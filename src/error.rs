//! Top-level error types for Osiris.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Settings store errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to SQLite: {0}")]
    SqliteConnect(#[source] sqlx::Error),

    #[error("failed to prepare schema: {0}")]
    Schema(#[source] sqlx::Error),
}

/// Completion API errors.
///
/// Moderation never retries; completion retries the variants for which
/// [`LlmError::is_retriable`] holds.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{endpoint} request failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} request timed out after {timeout_secs}s")]
    Timeout { endpoint: String, timeout_secs: u64 },

    #[error("{endpoint} API error ({status}): {message}")]
    RemoteApi {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("{endpoint} returned a malformed response: {message}")]
    MalformedResponse { endpoint: String, message: String },

    #[error("no API key configured")]
    MissingApiKey,
}

impl LlmError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            LlmError::Transport { .. } | LlmError::Timeout { .. } => true,
            LlmError::RemoteApi { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            LlmError::MalformedResponse { .. } | LlmError::MissingApiKey => false,
        }
    }
}

/// Platform delivery and fetch errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("platform is not ready: {0}")]
    NotReady(String),

    #[error("failed to send message to channel {channel_id}: {message}")]
    SendFailed { channel_id: u64, message: String },

    #[error("failed to fetch history for channel {channel_id}: {message}")]
    HistoryFailed { channel_id: u64, message: String },

    #[error("failed to download attachment {filename}: {message}")]
    AttachmentFailed { filename: String, message: String },

    #[error("failed to update display status: {0}")]
    StatusFailed(String),
}
