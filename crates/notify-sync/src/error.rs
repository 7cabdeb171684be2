//! Sync engine error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while synchronizing notifications.
///
/// Stale deliveries that would revert a read flag are not errors; the store
/// drops them silently.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Connection-related errors (handshake, send, closed channel)
    #[error("Transport error: {0}")]
    Transport(String),

    /// STOMP framing or envelope decoding errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The REST API answered with `success = false`
    #[error("API error{}: {message}", .code.map(|c| format!(" ({c})")).unwrap_or_default())]
    Api { code: Option<i64>, message: String },

    /// A mark-read/delete acknowledgement failed after an optimistic local mutation
    #[error("Acknowledgement failed for {operation}: {reason}")]
    Acknowledgement { operation: String, reason: String },

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine task is no longer running
    #[error("Notification engine is not running")]
    EngineClosed,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an API error.
    pub fn api(code: Option<i64>, msg: impl Into<String>) -> Self {
        Self::Api {
            code,
            message: msg.into(),
        }
    }

    /// Create an acknowledgement error.
    pub fn acknowledgement(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Acknowledgement {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let err = SyncError::api(Some(403), "forbidden");
        assert_eq!(err.to_string(), "API error (403): forbidden");

        let err = SyncError::api(None, "boom");
        assert_eq!(err.to_string(), "API error: boom");
    }
}
