//! Transport error types.

use std::time::Duration;
use thiserror::Error;

use relay_protocol::{JsonRpcError, MessageError};

use crate::core::ConnectionState;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Represents errors that can occur during transport operations.
///
/// Configuration and validation failures surface synchronously to the caller
/// of the offending operation; in-flight request failures surface only to the
/// caller awaiting that request. No variant is fatal to the transport
/// instance itself.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// An operation was attempted before `initialize`.
    #[error("Transport not initialized")]
    NotInitialized,

    /// The connection configuration is missing a required field or carries
    /// an unusable value.
    #[error("Invalid connection config: {0}")]
    InvalidConfig(String),

    /// No connection with the given id exists on this transport.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// The connection exists but is not in a sendable state.
    #[error("Connection {id} is not active (state: {state})")]
    ConnectionInactive {
        /// The connection id.
        id: String,
        /// The state the connection was observed in.
        state: ConnectionState,
    },

    /// The outbound message fails JSON-RPC 2.0 shape validation.
    #[error("Invalid JSON-RPC message: {0}")]
    InvalidMessage(#[from] MessageError),

    /// Malformed JSON or framing arrived on the wire.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The network failed: connection refused, DNS failure, non-2xx HTTP.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A request or handshake exceeded its window.
    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout window that was exceeded.
        timeout: Duration,
    },

    /// The backend went away: subprocess exited, socket closed without a
    /// graceful shutdown. Carries the JSON-RPC error object broadcast to
    /// every pending request on the connection.
    #[error("Backend terminated: {0}")]
    BackendTerminated(JsonRpcError),
}

impl TransportError {
    /// Shorthand for a request timeout.
    pub(crate) fn request_timeout(timeout: Duration) -> Self {
        Self::Timeout {
            operation: "response".to_string(),
            timeout,
        }
    }

    /// Shorthand for a handshake timeout.
    pub(crate) fn handshake_timeout(timeout: Duration) -> Self {
        Self::Timeout {
            operation: "handshake".to_string(),
            timeout,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProtocolError(err.to_string())
    }
}
