//! Transport and request error types

use std::time::Duration;
use thiserror::Error;

/// Connection-level failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Gave up after {0} reconnect attempts")]
    RetriesExhausted(u32),

    #[error("Token acquisition failed: {0}")]
    Token(String),
}

/// Why a tracked request did not succeed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    #[error("Rate limit exceeded")]
    RateLimited,

    /// Server answered with a failure; carries the extracted message
    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    ConnectionClosed(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl From<trellis_protocol::ProtocolError> for RequestError {
    fn from(e: trellis_protocol::ProtocolError) -> Self {
        RequestError::Serialization(e.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
