//! Error taxonomy shared by the cache, the gateway and the mutation coordinator.

use crate::network::Network;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Network or HTTP-level failure. Reads retry these with backoff.
    #[error("transport error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Transport {
        message: String,
        status: Option<u16>,
    },

    /// Rejected locally, or a response that does not match its schema.
    #[error("validation error: {0}")]
    Validation(String),

    /// 2xx response carrying `success: false`.
    #[error("{0}")]
    Business(String),

    /// The same logical mutation is still pending.
    #[error("already in progress: {0}")]
    DuplicateMutation(String),

    /// A read issued on `network` was dropped because the network changed
    /// before it completed.
    #[error("read on {network} superseded by a network switch")]
    Superseded { network: Network },

    /// The snapshot feed of a subscription ended.
    #[error("subscription closed")]
    SubscriptionClosed,
}

impl SyncError {
    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::Transport {
            message: message.into(),
            status: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::Validation(message.into())
    }

    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport { .. })
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SyncError::Validation(format!("malformed response body: {err}"));
        }
        SyncError::Transport {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Validation(format!("response does not match schema: {err}"))
    }
}
