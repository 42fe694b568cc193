use thiserror::Error;

use crate::models::MessageId;

/// Top-level engine error.
///
/// Transport faults never reach callers as values of this type (they are logged
/// and retried by the connection); request faults and validation failures do.
#[derive(Debug, Error)]
pub enum SyncError {
    // ── Request faults ───────────────────────────────────────────────────────
    #[error("Network error calling {endpoint}: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Server rejected {endpoint} with status {status}")]
    Rejected { endpoint: String, status: u16 },

    #[error("Failed to decode {endpoint} response: {message}")]
    Decode { endpoint: String, message: String },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Message must have text or at least one attachment")]
    EmptyMessage,

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    // ── Data faults ──────────────────────────────────────────────────────────
    #[error("No conversation is addressable for the current identity")]
    NoConversation,

    #[error("Message {id} is not known locally")]
    UnknownMessage { id: MessageId },

    #[error("No failed message with client id '{client_id}'")]
    NotFailed { client_id: String },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn network(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        SyncError::Network { endpoint: endpoint.into(), source }
    }

    pub fn decode(endpoint: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Decode { endpoint: endpoint.into(), message: message.to_string() }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::EmptyMessage | SyncError::FieldTooLong { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, SyncError::Rejected { .. })
    }

    /// Whether repeating the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { .. } => true,
            SyncError::Rejected { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
