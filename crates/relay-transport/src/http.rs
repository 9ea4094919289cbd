//! HTTP transport with optional server-push stream.
//!
//! Each outbound message is one HTTP POST carrying the JSON-RPC envelope;
//! request and response pair within the single call, so this transport
//! needs no pending-request map. When the connection configuration asks for
//! push, a long-lived GET with `Accept: text/event-stream` is opened and
//! `data:`-prefixed lines are handed to the notification hook. A failed or
//! ended push stream marks the push channel disconnected but never affects
//! POST sending.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex as StdMutex, RwLock};
use reqwest::{Client as HttpClient, header};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use relay_protocol::{OutboundMessage, classify_incoming, classify_outbound};

use crate::config::{ConnectionConfig, TimeoutConfig};
use crate::core::{ConnectionId, ConnectionState, ConnectionStatus, Transport, TransportCore, TransportKind};
use crate::error::{TransportError, TransportResult};
use crate::framing::{LineBuffer, push_payload};
use crate::metrics::TransportMetrics;

/// Transport for remote HTTP endpoints.
#[derive(Debug)]
pub struct HttpTransport {
    core: TransportCore,
    timeouts: TimeoutConfig,
    client: HttpClient,
    connections: DashMap<ConnectionId, Arc<HttpConnection>>,
}

/// One logical HTTP connection: a POST target plus an optional push stream.
#[derive(Debug)]
struct HttpConnection {
    id: ConnectionId,
    url: String,
    headers: HashMap<String, String>,
    state: RwLock<ConnectionState>,
    started_at: Instant,
    sent_count: AtomicU64,
    push_connected: AtomicBool,
    push_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    counted: AtomicBool,
    metrics: Arc<TransportMetrics>,
    notifications: Option<mpsc::Sender<Value>>,
}

impl HttpConnection {
    /// Dispatches one complete line from the push stream.
    fn handle_push_line(&self, line: &str) {
        let Some(payload) = push_payload(line) else {
            return;
        };
        if payload.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(connection = %self.id, error = %e, "malformed push payload; dropping");
                return;
            }
        };

        trace!(connection = %self.id, "push event received");
        if let Some(hook) = &self.notifications {
            if hook.try_send(value).is_err() {
                warn!(connection = %self.id, "notification hook full or closed; dropping push event");
            }
        } else {
            debug!(connection = %self.id, "no notification hook; dropping push event");
        }
    }

    fn release_active(&self) {
        if self
            .counted
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.metrics.connection_closed();
        }
    }
}

impl HttpTransport {
    /// Creates an HTTP transport with the given timeout windows.
    pub fn new(timeouts: TimeoutConfig) -> Self {
        let client = HttpClient::builder()
            .timeout(timeouts.request)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            core: TransportCore::new(),
            timeouts,
            client,
            connections: DashMap::new(),
        }
    }

    /// Long-lived push subscription: a single GET whose body is consumed as
    /// a newline-delimited event stream.
    async fn run_push_stream(client: HttpClient, push_url: String, connection: Arc<HttpConnection>) {
        let mut request = client
            .get(&push_url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");
        for (key, value) in &connection.headers {
            request = request.header(key, value);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(connection = %connection.id, error = %e, "push subscription failed");
                return;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            warn!(
                connection = %connection.id,
                status = %response.status(),
                "push subscription rejected; POST sending is unaffected"
            );
            return;
        }

        info!(connection = %connection.id, url = %push_url, "push stream established");
        connection.push_connected.store(true, Ordering::SeqCst);

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    lines.extend(&bytes);
                    while let Some(line) = lines.next_line() {
                        connection.handle_push_line(&line);
                    }
                }
                Err(e) => {
                    warn!(connection = %connection.id, error = %e, "push stream error");
                    break;
                }
            }
        }

        connection.push_connected.store(false, Ordering::SeqCst);
        debug!(connection = %connection.id, "push stream ended");
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn initialize(&self) -> TransportResult<()> {
        self.core.initialize();
        Ok(())
    }

    async fn create_connection(&self, config: ConnectionConfig) -> TransportResult<ConnectionId> {
        self.core.ensure_initialized()?;

        let raw_url = config.url.as_deref().ok_or_else(|| {
            TransportError::InvalidConfig("http connection requires a url".to_string())
        })?;
        let parsed = url::Url::parse(raw_url)
            .map_err(|e| TransportError::InvalidConfig(format!("invalid url '{raw_url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TransportError::InvalidConfig(format!(
                "unsupported url scheme '{}' for http connection",
                parsed.scheme()
            )));
        }

        // No persistent link is opened for plain HTTP; the connection is
        // usable as soon as the record exists.
        let connection = Arc::new(HttpConnection {
            id: ConnectionId::generate(),
            url: raw_url.to_string(),
            headers: config.headers.clone(),
            state: RwLock::new(ConnectionState::Connected),
            started_at: Instant::now(),
            sent_count: AtomicU64::new(0),
            push_connected: AtomicBool::new(false),
            push_task: StdMutex::new(None),
            counted: AtomicBool::new(true),
            metrics: Arc::clone(&self.core.metrics),
            notifications: config.notifications.clone(),
        });

        if config.wants_push() {
            let push_url = config
                .push_endpoint
                .clone()
                .unwrap_or_else(|| raw_url.to_string());
            let task = tokio::spawn(Self::run_push_stream(
                self.client.clone(),
                push_url,
                Arc::clone(&connection),
            ));
            *connection.push_task.lock() = Some(task);
        }

        info!(connection = %connection.id, url = %raw_url, "http connection created");

        let id = connection.id.clone();
        self.connections.insert(id.clone(), connection);
        self.core.metrics.connection_opened();

        Ok(id)
    }

    async fn send_message(
        &self,
        connection_id: &ConnectionId,
        message: Value,
    ) -> TransportResult<Value> {
        self.core.ensure_initialized()?;

        let connection = self
            .connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::ConnectionNotFound(connection_id.to_string()))?;

        let state = *connection.state.read();
        if state != ConnectionState::Connected {
            return Err(TransportError::ConnectionInactive {
                id: connection_id.to_string(),
                state,
            });
        }

        let outbound = classify_outbound(&message)?;
        let frame = serde_json::to_string(&message)?;

        let mut request = self
            .client
            .post(&connection.url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(frame);
        for (key, value) in &connection.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::request_timeout(self.timeouts.request)
            } else {
                TransportError::NetworkError(format!("HTTP POST failed: {e}"))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::NetworkError(format!("failed to read response body: {e}")))?;

        // Hard failure, no retry.
        if !status.is_success() {
            return Err(TransportError::NetworkError(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        connection.sent_count.fetch_add(1, Ordering::Relaxed);
        self.core.metrics.message_sent();

        if matches!(outbound, OutboundMessage::Notification) {
            // Backends commonly answer notifications with an empty body.
            return Ok(serde_json::json!({"jsonrpc": "2.0", "result": "notification sent"}));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| TransportError::ProtocolError(format!("response is not JSON: {e}")))?;
        classify_incoming(&value).map_err(|e| {
            TransportError::ProtocolError(format!("response failed JSON-RPC validation: {e}"))
        })?;

        Ok(value)
    }

    async fn close_connection(&self, connection_id: &ConnectionId) -> TransportResult<()> {
        self.core.ensure_initialized()?;

        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return Ok(());
        };

        info!(connection = %connection_id, "closing http connection");

        if let Some(task) = connection.push_task.lock().take() {
            task.abort();
        }
        connection.push_connected.store(false, Ordering::SeqCst);
        *connection.state.write() = ConnectionState::Disconnected;
        connection.release_active();

        Ok(())
    }

    async fn get_status(&self, connection_id: &ConnectionId) -> ConnectionStatus {
        match self.connections.get(connection_id) {
            Some(connection) => ConnectionStatus::report(
                *connection.state.read(),
                connection.started_at.elapsed().as_secs(),
                &self.core.metrics.snapshot(),
            ),
            None => ConnectionStatus::unknown(),
        }
    }
}
