//! Shared error types for the Courier channel adapter.

use thiserror::Error;

/// Top-level error type for channel operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// The provider answered with `ok: false` (or a non-2xx status).
    #[error("Remote API error {status}: {description}")]
    RemoteApi {
        /// Provider error code (HTTP status when no code was reported).
        status: u16,
        /// Human-readable description from the provider.
        description: String,
        /// Seconds the provider asked us to wait before retrying.
        retry_after: Option<u64>,
    },

    /// Network or timeout failure with no structured provider response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An attachment exceeds the configured download cap.
    #[error("Attachment too large: {actual} bytes (limit {limit} bytes)")]
    SizeLimit {
        /// Configured cap in bytes.
        limit: u64,
        /// Declared or observed size in bytes.
        actual: u64,
    },

    /// The channel configuration is malformed.
    #[error("Invalid channel configuration: {0}")]
    ConfigValidation(String),

    /// The provider rejected rich-text markup.
    #[error("Markup rejected by provider: {0}")]
    MarkupParse(String),

    /// Invalid caller input (empty text, unsafe file path, bad chat id).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The channel has no live session.
    #[error("Channel is not connected")]
    NotConnected,

    /// The channel is in the wrong state for the requested operation.
    #[error("Invalid channel state: {0}")]
    InvalidState(String),

    /// A provider payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ChannelError {
    /// Seconds the provider asked us to wait, if this is a rate-limit signal.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ChannelError::RemoteApi { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether this error is a provider throttle carrying a wait duration.
    pub fn is_rate_limited(&self) -> bool {
        self.retry_after().is_some()
    }

    /// Whether retrying cannot succeed: revoked token (401) or a competing
    /// poller on the same token (409).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::RemoteApi {
                status: 401 | 409,
                ..
            }
        )
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Serialization(e.to_string())
    }
}

/// Alias for Result with ChannelError.
pub type ChannelResult<T> = Result<T, ChannelError>;
