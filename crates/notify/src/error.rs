//! Error types for the notification system.

use thiserror::Error;

/// Errors that can occur when delivering a message to a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request failed (connect, timeout, body)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Channel is not configured
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rate limited by the receiving service
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The endpoint answered with a non-success status
    #[error("Webhook returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl ChannelError {
    /// Minimum delay the receiving side asked for before the next attempt.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
