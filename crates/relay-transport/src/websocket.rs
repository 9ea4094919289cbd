//! Persistent WebSocket transport with automatic reconnection.
//!
//! One socket per connection, full duplex: requests are correlated with
//! responses through the shared pending-request map, and server-initiated
//! frames go to the notification hook. When the link drops, every pending
//! request is rejected and a reconnection loop runs with linearly growing
//! delays until the attempt cap is reached. Closing a connection zeroes the
//! cap and aborts the loop, so a close always wins over a scheduled
//! reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex as StdMutex, RwLock};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use relay_protocol::{IncomingFrame, JsonRpcError, OutboundMessage, classify_incoming, classify_outbound};

use crate::config::{ConnectionConfig, TimeoutConfig};
use crate::core::{ConnectionId, ConnectionState, ConnectionStatus, Transport, TransportCore, TransportKind};
use crate::error::{TransportError, TransportResult};
use crate::metrics::TransportMetrics;
use crate::pending::PendingRequests;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Transport for persistent WebSocket backends.
#[derive(Debug)]
pub struct WebSocketTransport {
    core: TransportCore,
    timeouts: TimeoutConfig,
    connections: DashMap<ConnectionId, Arc<WsConnection>>,
}

#[derive(Debug)]
struct WsConnection {
    id: ConnectionId,
    url: String,
    state: RwLock<ConnectionState>,
    started_at: Instant,
    sent_count: AtomicU64,
    pending: PendingRequests,
    writer: TokioMutex<Option<WsSink>>,
    /// Consecutive failed attempts since the link was last up.
    reconnect_attempts: AtomicU32,
    /// Attempt cap; zeroed by close so no further attempt can start.
    max_reconnect_attempts: AtomicU32,
    reconnect_delay: Duration,
    handshake_timeout: Duration,
    reader_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    reconnect_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    counted: AtomicBool,
    metrics: Arc<TransportMetrics>,
    notifications: Option<mpsc::Sender<Value>>,
}

impl WsConnection {
    /// Dispatches one text frame from the socket.
    fn handle_frame(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(connection = %self.id, error = %e, "malformed frame; dropping");
                return;
            }
        };

        match classify_incoming(&value) {
            Ok(IncomingFrame::Response { id: Some(id) }) => {
                trace!(connection = %self.id, %id, "response frame");
                if !self.pending.complete(&id, value) {
                    debug!(connection = %self.id, %id, "response for unknown request id; dropping");
                }
            }
            Ok(IncomingFrame::Response { id: None }) => {
                warn!(connection = %self.id, "response frame with null id; dropping");
            }
            Ok(IncomingFrame::ServerMessage { method }) => {
                trace!(connection = %self.id, %method, "server-initiated frame");
                if let Some(hook) = &self.notifications {
                    if hook.try_send(value).is_err() {
                        warn!(connection = %self.id, "notification hook full or closed; dropping frame");
                    }
                } else {
                    debug!(connection = %self.id, %method, "no notification hook; dropping frame");
                }
            }
            Err(e) => {
                warn!(connection = %self.id, error = %e, "unclassifiable frame; dropping");
            }
        }
    }

    /// Reacts to the socket going away: rejects all in-flight requests and
    /// hands over to the reconnection loop, which also handles the case of
    /// an exhausted or zeroed attempt cap. The cleanup and the loop run in
    /// their own task, stored so close can abort a scheduled attempt; the
    /// reader task ends here and never awaits the reconnect future itself.
    fn on_link_lost(self: &Arc<Self>) {
        let connection = Arc::clone(self);
        let task = tokio::spawn(async move {
            *connection.writer.lock().await = None;
            connection
                .pending
                .fail_all(&JsonRpcError::internal_error("WebSocket connection closed"));
            run_reconnect(connection).await;
        });
        *self.reconnect_task.lock() = Some(task);
    }

    async fn write_frame(&self, frame: String) -> TransportResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| TransportError::ConnectionInactive {
            id: self.id.to_string(),
            state: *self.state.read(),
        })?;
        writer
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::NetworkError(format!("WebSocket send failed: {e}")))
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

/// Pumps frames off the socket until it closes or errors.
async fn run_reader(connection: Arc<WsConnection>, mut reader: WsReader) {
    while let Some(item) = reader.next().await {
        match item {
            Ok(Message::Text(text)) => connection.handle_frame(&text),
            Ok(Message::Ping(data)) => {
                let mut guard = connection.writer.lock().await;
                if let Some(writer) = guard.as_mut() {
                    if let Err(e) = writer.send(Message::Pong(data)).await {
                        warn!(connection = %connection.id, error = %e, "failed to answer ping");
                    }
                }
            }
            Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(connection = %connection.id, "close frame received");
                break;
            }
            Ok(Message::Binary(_)) => {
                warn!(connection = %connection.id, "unexpected binary frame; dropping");
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                warn!(connection = %connection.id, error = %e, "socket error");
                break;
            }
        }
    }

    info!(connection = %connection.id, "websocket link lost");
    connection.on_link_lost();
}

/// Reconnection loop: attempt *n* waits *n* times the base delay, then
/// redials. Exits on success, on an exhausted cap, or when close zeroes the
/// cap mid-loop.
async fn run_reconnect(connection: Arc<WsConnection>) {
    loop {
        let attempt = connection.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > connection.max_reconnect_attempts.load(Ordering::SeqCst) {
            info!(connection = %connection.id, "reconnection attempts exhausted");
            *connection.state.write() = ConnectionState::Disconnected;
            connection.release_active();
            return;
        }

        *connection.state.write() = ConnectionState::Reconnecting;
        let delay = connection.reconnect_delay * attempt;
        info!(connection = %connection.id, attempt, ?delay, "scheduling reconnection");
        tokio::time::sleep(delay).await;

        if connection.max_reconnect_attempts.load(Ordering::SeqCst) == 0 {
            // Closed while we slept.
            return;
        }

        match timeout(connection.handshake_timeout, connect_async(&connection.url)).await {
            Ok(Ok((socket, _))) => {
                let (sink, reader) = socket.split();
                *connection.writer.lock().await = Some(sink);
                connection.reconnect_attempts.store(0, Ordering::SeqCst);
                *connection.state.write() = ConnectionState::Connected;
                info!(connection = %connection.id, "reconnected");

                let task = tokio::spawn(run_reader(Arc::clone(&connection), reader));
                *connection.reader_task.lock() = Some(task);
                return;
            }
            Ok(Err(e)) => {
                warn!(connection = %connection.id, attempt, error = %e, "reconnection attempt failed");
            }
            Err(_) => {
                warn!(connection = %connection.id, attempt, "reconnection handshake timed out");
            }
        }
    }
}

impl WebSocketTransport {
    /// Creates a WebSocket transport with the given timeout windows.
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self {
            core: TransportCore::new(),
            timeouts,
            connections: DashMap::new(),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn initialize(&self) -> TransportResult<()> {
        self.core.initialize();
        Ok(())
    }

    async fn create_connection(&self, config: ConnectionConfig) -> TransportResult<ConnectionId> {
        self.core.ensure_initialized()?;

        let raw_url = config.url.as_deref().ok_or_else(|| {
            TransportError::InvalidConfig("websocket connection requires a url".to_string())
        })?;
        let parsed = url::Url::parse(raw_url)
            .map_err(|e| TransportError::InvalidConfig(format!("invalid url '{raw_url}': {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidConfig(format!(
                "unsupported url scheme '{}' for websocket connection",
                parsed.scheme()
            )));
        }

        let socket = match timeout(self.timeouts.handshake, connect_async(raw_url)).await {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(e)) => {
                return Err(TransportError::NetworkError(format!(
                    "WebSocket handshake failed: {e}"
                )));
            }
            Err(_) => return Err(TransportError::handshake_timeout(self.timeouts.handshake)),
        };
        let (sink, reader) = socket.split();

        let connection = Arc::new(WsConnection {
            id: ConnectionId::generate(),
            url: raw_url.to_string(),
            state: RwLock::new(ConnectionState::Connected),
            started_at: Instant::now(),
            sent_count: AtomicU64::new(0),
            pending: PendingRequests::new(),
            writer: TokioMutex::new(Some(sink)),
            reconnect_attempts: AtomicU32::new(0),
            max_reconnect_attempts: AtomicU32::new(config.max_reconnect_attempts()),
            reconnect_delay: config.reconnect_delay(),
            handshake_timeout: self.timeouts.handshake,
            reader_task: StdMutex::new(None),
            reconnect_task: StdMutex::new(None),
            counted: AtomicBool::new(true),
            metrics: Arc::clone(&self.core.metrics),
            notifications: config.notifications.clone(),
        });

        let task = tokio::spawn(run_reader(Arc::clone(&connection), reader));
        *connection.reader_task.lock() = Some(task);

        info!(connection = %connection.id, url = %raw_url, "websocket connection established");

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

        match outbound {
            OutboundMessage::Notification => {
                connection.write_frame(frame).await?;
                connection.sent_count.fetch_add(1, Ordering::Relaxed);
                self.core.metrics.message_sent();
                Ok(serde_json::json!({"jsonrpc": "2.0", "result": "notification sent"}))
            }
            OutboundMessage::Request(id) => {
                // Register before writing so a response racing the write
                // still finds its entry.
                let rx = connection.pending.register(id.clone());

                if let Err(e) = connection.write_frame(frame).await {
                    connection.pending.remove(&id);
                    return Err(e);
                }
                connection.sent_count.fetch_add(1, Ordering::Relaxed);
                self.core.metrics.message_sent();

                match timeout(self.timeouts.request, rx).await {
                    Ok(Ok(Ok(response))) => Ok(response),
                    Ok(Ok(Err(error))) => Err(TransportError::BackendTerminated(error)),
                    Ok(Err(_)) => Err(TransportError::BackendTerminated(
                        JsonRpcError::internal_error("Connection closed"),
                    )),
                    Err(_) => {
                        connection.pending.remove(&id);
                        Err(TransportError::request_timeout(self.timeouts.request))
                    }
                }
            }
        }
    }

    async fn close_connection(&self, connection_id: &ConnectionId) -> TransportResult<()> {
        self.core.ensure_initialized()?;

        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return Ok(());
        };

        info!(connection = %connection_id, "closing websocket connection");

        // Zero the cap first so a reconnect loop waking up concurrently
        // bails out instead of redialing.
        connection.max_reconnect_attempts.store(0, Ordering::SeqCst);
        if let Some(task) = connection.reconnect_task.lock().take() {
            task.abort();
        }

        if let Some(writer) = connection.writer.lock().await.as_mut() {
            let _ = writer.send(Message::Close(None)).await;
        }
        if let Some(task) = connection.reader_task.lock().take() {
            task.abort();
        }
        *connection.writer.lock().await = None;

        connection
            .pending
            .fail_all(&JsonRpcError::internal_error("Connection closed"));
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
