//! Error types for the gridwire messaging layer.
//!
//! Splits channel-local failures (malformed frames, which are logged and
//! dropped at the decode boundary) from request-level failures, which are
//! always surfaced to the caller that issued the request.

use std::time::Duration;
use thiserror::Error;

/// Main error type for gridwire operations.
#[derive(Debug, Error)]
pub enum GridwireError {
    // Decode-boundary errors. Never surfaced to a request caller; the
    // receive loop logs these and drops the frame.
    #[error("Malformed message: {message}")]
    MalformedMessage {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Request-level errors, surfaced through `send_request`.
    #[error("Command not supported by peer: {command}")]
    CommandNotSupported { command: String },

    #[error("Delivery failed for '{command}': no ACK after {attempts} attempts")]
    DeliveryFailed { command: String, attempts: u32 },

    #[error("Request '{command}' timed out after {timeout:?} (may have completed on the peer)")]
    RequestTimeout { command: String, timeout: Duration },

    #[error("Handler failed for '{command}': {message}")]
    HandlerFailure { command: String, message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Channel closed")]
    ChannelClosed,

    // Programming-error path: `register` on an id that is still live.
    #[error("Duplicate request id: {id}")]
    DuplicateRequestId { id: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for gridwire operations.
pub type Result<T> = std::result::Result<T, GridwireError>;

impl From<serde_json::Error> for GridwireError {
    fn from(err: serde_json::Error) -> Self {
        GridwireError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl GridwireError {
    /// Whether the caller may reasonably retry the request later.
    ///
    /// `RequestTimeout` is deliberately excluded: the peer ACKed the
    /// request, so the work may have completed and a blind retry could
    /// apply it twice.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GridwireError::DeliveryFailed { .. } | GridwireError::ChannelClosed
        )
    }
}
