//! Core transport contract and shared types.
//!
//! Every backend kind implements the same four-operation contract behind the
//! [`Transport`] trait: open a connection, send a message, close a
//! connection, query status. Callers hold a `dyn Transport` (usually via the
//! [`TransportSelector`](crate::TransportSelector)) and never see which kind
//! of I/O backs a given connection id.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{TransportError, TransportResult};
use crate::metrics::{MetricsSnapshot, TransportMetrics};

/// Enumerates the backend kinds this layer can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// A spawned child process speaking newline-delimited JSON over stdio.
    Process,
    /// A remote HTTP endpoint, optionally paired with a push stream.
    Http,
    /// A persistent full-duplex WebSocket connection.
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Http => write!(f, "http"),
            Self::WebSocket => write!(f, "websocket"),
        }
    }
}

/// The lifecycle state of a single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// The underlying link is being established.
    Connecting,
    /// The connection is ready to carry messages.
    Connected,
    /// The connection has been torn down or the backend went away.
    Disconnected,
    /// The connection failed and is not recoverable.
    Error,
    /// A socket connection lost its link and a reconnection is scheduled.
    Reconnecting,
    /// Status-reporting only: the connection id is not known.
    Unknown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// An opaque handle for one logical connection.
///
/// Generated at creation, unique within a transport instance, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generates a fresh, unique connection id.
    pub(crate) fn generate() -> Self {
        Self(format!("conn-{}", Uuid::new_v4()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A point-in-time status report for a connection.
///
/// `get_status` never fails: unknown ids yield [`ConnectionStatus::unknown`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// Current lifecycle state.
    pub status: ConnectionState,
    /// Seconds since the connection record was created.
    pub uptime_seconds: u64,
    /// Per-transport-instance counters as a JSON object; empty for unknown ids.
    pub metrics: Value,
}

impl ConnectionStatus {
    /// The status reported for a connection id this transport does not know.
    pub fn unknown() -> Self {
        Self {
            status: ConnectionState::Unknown,
            uptime_seconds: 0,
            metrics: Value::Object(serde_json::Map::new()),
        }
    }

    pub(crate) fn report(state: ConnectionState, uptime_seconds: u64, snapshot: &MetricsSnapshot) -> Self {
        Self {
            status: state,
            uptime_seconds,
            metrics: serde_json::to_value(snapshot).unwrap_or_default(),
        }
    }
}

/// The four-operation contract implemented by every transport kind.
///
/// All methods other than [`initialize`](Transport::initialize) fail with
/// [`TransportError::NotInitialized`] until `initialize` has been called.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Returns the backend kind this transport drives.
    fn kind(&self) -> TransportKind;

    /// Transitions the transport instance from uninitialized to initialized.
    ///
    /// Idempotent; calling it again is a no-op.
    fn initialize(&self) -> TransportResult<()>;

    /// Validates the configuration, allocates a connection record, begins
    /// establishing the underlying I/O, and returns an opaque id.
    async fn create_connection(&self, config: ConnectionConfig) -> TransportResult<ConnectionId>;

    /// Sends a JSON-RPC 2.0 message on a connection and resolves with the
    /// correlated response, a synthetic acknowledgement for notifications,
    /// a timeout, or a connection-level failure. Never hangs indefinitely.
    async fn send_message(
        &self,
        connection_id: &ConnectionId,
        message: Value,
    ) -> TransportResult<Value>;

    /// Tears down the underlying I/O, flushes pending requests with a
    /// synthetic failure, and removes the connection record. Idempotent:
    /// closing an unknown id succeeds.
    async fn close_connection(&self, connection_id: &ConnectionId) -> TransportResult<()>;

    /// Reports the connection's state, uptime, and instance metrics.
    /// Never fails; unknown ids yield `{status: "unknown", uptime: 0, metrics: {}}`.
    async fn get_status(&self, connection_id: &ConnectionId) -> ConnectionStatus;
}

/// Shared per-instance state: the initialization gate and the metrics
/// counters every transport kind maintains.
#[derive(Debug)]
pub(crate) struct TransportCore {
    initialized: AtomicBool,
    pub(crate) metrics: Arc<TransportMetrics>,
}

impl TransportCore {
    pub(crate) fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            metrics: Arc::new(TransportMetrics::default()),
        }
    }

    pub(crate) fn initialize(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub(crate) fn ensure_initialized(&self) -> TransportResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotInitialized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Unknown.to_string(), "unknown");
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn-"));
    }

    #[test]
    fn unknown_status_shape() {
        let status = ConnectionStatus::unknown();
        assert_eq!(status.status, ConnectionState::Unknown);
        assert_eq!(status.uptime_seconds, 0);
        assert_eq!(status.metrics, serde_json::json!({}));
    }

    #[test]
    fn core_gates_on_initialize() {
        let core = TransportCore::new();
        assert!(matches!(
            core.ensure_initialized(),
            Err(TransportError::NotInitialized)
        ));
        core.initialize();
        assert!(core.ensure_initialized().is_ok());
        // Idempotent.
        core.initialize();
        assert!(core.ensure_initialized().is_ok());
    }
}
