//! Transport selection and connection routing.
//!
//! The [`TransportSelector`] is the single entry point callers hold. It
//! inspects each connection configuration, picks the backend kind, lazily
//! instantiates one transport per kind, and afterwards routes every
//! per-connection operation to the transport that owns the id.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::debug;

use crate::config::{ConnectionConfig, TimeoutConfig};
use crate::core::{ConnectionId, ConnectionStatus, Transport, TransportKind};
use crate::error::{TransportError, TransportResult};
use crate::http::HttpTransport;
use crate::process::ProcessTransport;
use crate::websocket::WebSocketTransport;

/// Picks the backend kind for a connection configuration.
///
/// A `command` always selects the process transport. Otherwise the `url`
/// scheme decides: `ws`/`wss` select the socket transport, `http`/`https`
/// the HTTP transport (with a push stream when the config asks for one).
pub(crate) fn select_kind(config: &ConnectionConfig) -> TransportResult<TransportKind> {
    if config.command.is_some() {
        return Ok(TransportKind::Process);
    }

    if let Some(raw_url) = config.url.as_deref() {
        let parsed = url::Url::parse(raw_url)
            .map_err(|e| TransportError::InvalidConfig(format!("invalid url '{raw_url}': {e}")))?;
        return match parsed.scheme() {
            "ws" | "wss" => Ok(TransportKind::WebSocket),
            "http" | "https" => Ok(TransportKind::Http),
            other => Err(TransportError::InvalidConfig(format!(
                "unsupported url scheme '{other}'"
            ))),
        };
    }

    Err(TransportError::InvalidConfig(
        "config must provide either a command or a url".to_string(),
    ))
}

/// Routes connections to lazily created per-kind transports.
#[derive(Debug)]
pub struct TransportSelector {
    initialized: AtomicBool,
    timeouts: TimeoutConfig,
    process: OnceCell<Arc<ProcessTransport>>,
    http: OnceCell<Arc<HttpTransport>>,
    websocket: OnceCell<Arc<WebSocketTransport>>,
    routes: DashMap<ConnectionId, TransportKind>,
}

impl TransportSelector {
    /// Creates a selector with the given timeout windows.
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self {
            initialized: AtomicBool::new(false),
            timeouts,
            process: OnceCell::new(),
            http: OnceCell::new(),
            websocket: OnceCell::new(),
            routes: DashMap::new(),
        }
    }

    /// Marks the selector ready for use. Idempotent.
    pub fn initialize(&self) -> TransportResult<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ensure_initialized(&self) -> TransportResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotInitialized)
        }
    }

    /// Returns the transport owning `kind`, creating and initializing it on
    /// first use.
    fn transport_for(&self, kind: TransportKind) -> Arc<dyn Transport> {
        match kind {
            TransportKind::Process => {
                let transport = self.process.get_or_init(|| {
                    let transport = Arc::new(ProcessTransport::new(self.timeouts));
                    let _ = transport.initialize();
                    transport
                });
                Arc::clone(transport) as Arc<dyn Transport>
            }
            TransportKind::Http => {
                let transport = self.http.get_or_init(|| {
                    let transport = Arc::new(HttpTransport::new(self.timeouts));
                    let _ = transport.initialize();
                    transport
                });
                Arc::clone(transport) as Arc<dyn Transport>
            }
            TransportKind::WebSocket => {
                let transport = self.websocket.get_or_init(|| {
                    let transport = Arc::new(WebSocketTransport::new(self.timeouts));
                    let _ = transport.initialize();
                    transport
                });
                Arc::clone(transport) as Arc<dyn Transport>
            }
        }
    }

    /// Selects a backend kind for the configuration, opens the connection on
    /// the owning transport, and records the route.
    pub async fn create_connection(&self, config: ConnectionConfig) -> TransportResult<ConnectionId> {
        self.ensure_initialized()?;

        let kind = select_kind(&config)?;
        debug!(%kind, "selected transport");

        let id = self.transport_for(kind).create_connection(config).await?;
        self.routes.insert(id.clone(), kind);
        Ok(id)
    }

    /// Sends a message on the transport that owns the connection id.
    pub async fn send_message(
        &self,
        connection_id: &ConnectionId,
        message: Value,
    ) -> TransportResult<Value> {
        self.ensure_initialized()?;

        let kind = self
            .routes
            .get(connection_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| TransportError::ConnectionNotFound(connection_id.to_string()))?;
        self.transport_for(kind).send_message(connection_id, message).await
    }

    /// Closes the connection and drops its route. Unknown ids succeed.
    pub async fn close_connection(&self, connection_id: &ConnectionId) -> TransportResult<()> {
        self.ensure_initialized()?;

        let Some((_, kind)) = self.routes.remove(connection_id) else {
            return Ok(());
        };
        self.transport_for(kind).close_connection(connection_id).await
    }

    /// Reports status for the connection; unknown ids yield the unknown
    /// status rather than an error.
    pub async fn get_status(&self, connection_id: &ConnectionId) -> ConnectionStatus {
        match self.routes.get(connection_id).map(|entry| *entry.value()) {
            Some(kind) => self.transport_for(kind).get_status(connection_id).await,
            None => ConnectionStatus::unknown(),
        }
    }
}

impl Default for TransportSelector {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}
