//! Error types for qget core

use qget_types::Status;
use thiserror::Error;

/// Errors that can occur in qget core
#[derive(Debug, Error)]
pub enum QgetError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Server reported no content for {0}")]
    EmptyContent(String),

    /// A transfer stopped because pause, pend, cancel or fail was requested
    #[error("Transfer interrupted ({0})")]
    Interrupted(Status),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue already exists: {0}")]
    QueueExists(String),

    #[error("Queue {0} is full")]
    QueueFull(String),

    #[error("Download not found: {0}")]
    DownloadNotFound(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl QgetError {
    /// Whether this error is a requested interruption rather than a failure
    pub fn is_interruption(&self) -> bool {
        matches!(self, QgetError::Interrupted(_))
    }
}

impl From<serde_json::Error> for QgetError {
    fn from(error: serde_json::Error) -> Self {
        QgetError::Serialization(error.to_string())
    }
}

// Allow converting to String for UI layers
impl From<QgetError> for String {
    fn from(error: QgetError) -> Self {
        error.to_string()
    }
}

pub type Result<T, E = QgetError> = std::result::Result<T, E>;
