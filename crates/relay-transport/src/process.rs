//! Child process transport.
//!
//! Spawns a subprocess per connection and exchanges JSON-RPC messages as
//! newline-delimited JSON over the child's standard streams. Outbound
//! messages are queued to a dedicated stdin writer task; a reader task
//! reassembles stdout bytes into complete lines (reads do not respect line
//! boundaries) and resolves pending requests by id. A watcher task polls the
//! child so that an exit or crash broadcasts a failure to every request
//! still in flight.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::{Mutex as StdMutex, RwLock};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio::time::{Duration, sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use relay_protocol::{IncomingFrame, JsonRpcError, OutboundMessage, classify_incoming, classify_outbound};

use crate::config::{ConnectionConfig, TimeoutConfig};
use crate::core::{ConnectionId, ConnectionState, ConnectionStatus, Transport, TransportCore, TransportKind};
use crate::error::{TransportError, TransportResult};
use crate::framing::LineBuffer;
use crate::metrics::TransportMetrics;
use crate::pending::PendingRequests;

/// Queue depth for the stdin writer task.
const STDIN_QUEUE_DEPTH: usize = 100;

/// How often the watcher polls the child for an exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Transport for backends running as spawned child processes.
#[derive(Debug)]
pub struct ProcessTransport {
    core: TransportCore,
    timeouts: TimeoutConfig,
    connections: DashMap<ConnectionId, Arc<ProcessConnection>>,
}

/// One spawned subprocess and its correlation state.
#[derive(Debug)]
struct ProcessConnection {
    id: ConnectionId,
    state: RwLock<ConnectionState>,
    started_at: Instant,
    sent_count: AtomicU64,
    pending: PendingRequests,
    stdin_tx: mpsc::Sender<String>,
    child: TokioMutex<Option<Child>>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Consumed on the first of close / exit so the active gauge is
    /// decremented exactly once per connection.
    counted: AtomicBool,
    metrics: Arc<TransportMetrics>,
    notifications: Option<mpsc::Sender<Value>>,
}

impl ProcessConnection {
    /// Dispatches one complete stdout line.
    fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!(connection = %self.id, error = %e, "discarding malformed JSON line from child");
                return;
            }
        };

        match classify_incoming(&value) {
            Ok(IncomingFrame::Response { id: Some(id) }) => {
                if self.pending.complete(&id, value) {
                    trace!(connection = %self.id, request = %id, "resolved pending request");
                } else {
                    warn!(connection = %self.id, request = %id, "response without a pending request");
                }
            }
            Ok(IncomingFrame::Response { id: None }) => {
                warn!(connection = %self.id, "null-id response from child; dropping");
            }
            Ok(IncomingFrame::ServerMessage { method }) => {
                trace!(connection = %self.id, %method, "backend-initiated message");
                if let Some(hook) = &self.notifications {
                    if hook.try_send(value).is_err() {
                        warn!(connection = %self.id, %method, "notification hook full or closed; dropping");
                    }
                } else {
                    debug!(connection = %self.id, %method, "no notification hook; dropping backend message");
                }
            }
            Err(e) => {
                warn!(connection = %self.id, error = %e, "unclassifiable frame from child");
            }
        }
    }

    /// Broadcasts the exit to all pending requests and parks the connection.
    fn handle_exit(&self, clean: bool) {
        let next = if clean {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Error
        };
        *self.state.write() = next;
        self.pending
            .fail_all(&JsonRpcError::internal_error("Process terminated"));
        self.release_active();
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

impl ProcessTransport {
    /// Creates a process transport with the given timeout windows.
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self {
            core: TransportCore::new(),
            timeouts,
            connections: DashMap::new(),
        }
    }

    fn spawn_child(config: &ConnectionConfig, command: &str) -> TransportResult<Child> {
        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        cmd.spawn().map_err(|e| {
            error!(%command, error = %e, "failed to spawn child process");
            TransportError::NetworkError(format!("Failed to spawn process: {e}"))
        })
    }
}

impl Default for ProcessTransport {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    fn initialize(&self) -> TransportResult<()> {
        self.core.initialize();
        Ok(())
    }

    async fn create_connection(&self, config: ConnectionConfig) -> TransportResult<ConnectionId> {
        self.core.ensure_initialized()?;

        let command = config
            .command
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                TransportError::InvalidConfig("process connection requires a command".to_string())
            })?;

        info!(%command, args = ?config.args, "spawning child process");
        let mut child = Self::spawn_child(&config, command)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::NetworkError("failed to capture child stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::NetworkError("failed to capture child stdout".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::NetworkError("failed to capture child stderr".to_string())
        })?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(STDIN_QUEUE_DEPTH);

        let connection = Arc::new(ProcessConnection {
            id: ConnectionId::generate(),
            state: RwLock::new(ConnectionState::Connected),
            started_at: Instant::now(),
            sent_count: AtomicU64::new(0),
            pending: PendingRequests::new(),
            stdin_tx,
            child: TokioMutex::new(Some(child)),
            tasks: StdMutex::new(Vec::new()),
            counted: AtomicBool::new(true),
            metrics: Arc::clone(&self.core.metrics),
            notifications: config.notifications.clone(),
        });

        // Stdin writer: one frame per line, flushed per message.
        let writer_task = {
            let id = connection.id.clone();
            let mut writer = BufWriter::new(stdin);
            tokio::spawn(async move {
                while let Some(frame) = stdin_rx.recv().await {
                    if let Err(e) = writer.write_all(frame.as_bytes()).await {
                        error!(connection = %id, error = %e, "failed to write to child stdin");
                        break;
                    }
                    if let Err(e) = writer.write_all(b"\n").await {
                        error!(connection = %id, error = %e, "failed to terminate frame");
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        error!(connection = %id, error = %e, "failed to flush child stdin");
                        break;
                    }
                    trace!(connection = %id, "frame written to child");
                }
                debug!(connection = %id, "stdin writer task finished");
            })
        };

        // Stdout reader: reassemble lines from arbitrary read boundaries.
        let reader_task = {
            let conn = Arc::clone(&connection);
            let mut stdout = stdout;
            tokio::spawn(async move {
                let mut chunk = BytesMut::with_capacity(8192);
                let mut lines = LineBuffer::new();
                loop {
                    chunk.clear();
                    match stdout.read_buf(&mut chunk).await {
                        Ok(0) => break,
                        Ok(_) => {
                            lines.extend(&chunk);
                            while let Some(line) = lines.next_line() {
                                conn.handle_line(&line);
                            }
                        }
                        Err(e) => {
                            warn!(connection = %conn.id, error = %e, "error reading child stdout");
                            break;
                        }
                    }
                }
                debug!(connection = %conn.id, "stdout reader task finished");
            })
        };

        // Stderr drain, for diagnostics only.
        let stderr_task = {
            let id = connection.id.clone();
            let reader = BufReader::new(stderr);
            tokio::spawn(async move {
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(connection = %id, "child stderr: {line}");
                }
            })
        };

        // Exit watcher: polls the child and broadcasts termination.
        let watcher_task = {
            let conn = Arc::clone(&connection);
            tokio::spawn(async move {
                loop {
                    sleep(EXIT_POLL_INTERVAL).await;
                    let mut guard = conn.child.lock().await;
                    let Some(child) = guard.as_mut() else {
                        // Taken by close_connection; nothing left to watch.
                        break;
                    };
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            drop(guard);
                            info!(connection = %conn.id, %status, "child process exited");
                            conn.handle_exit(status.success());
                            break;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            drop(guard);
                            error!(connection = %conn.id, error = %e, "failed to poll child status");
                            conn.handle_exit(false);
                            break;
                        }
                    }
                }
            })
        };

        *connection.tasks.lock() = vec![writer_task, reader_task, stderr_task, watcher_task];

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
                connection.stdin_tx.send(frame).await.map_err(|_| {
                    TransportError::NetworkError("child stdin is closed".to_string())
                })?;
                connection.sent_count.fetch_add(1, Ordering::Relaxed);
                self.core.metrics.message_sent();
                Ok(serde_json::json!({"jsonrpc": "2.0", "result": "notification sent"}))
            }
            OutboundMessage::Request(request_id) => {
                // Register before writing so a fast response cannot race the map.
                let rx = connection.pending.register(request_id.clone());

                if connection.stdin_tx.send(frame).await.is_err() {
                    connection.pending.remove(&request_id);
                    return Err(TransportError::NetworkError(
                        "child stdin is closed".to_string(),
                    ));
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
                        connection.pending.remove(&request_id);
                        Err(TransportError::request_timeout(self.timeouts.request))
                    }
                }
            }
        }
    }

    async fn close_connection(&self, connection_id: &ConnectionId) -> TransportResult<()> {
        self.core.ensure_initialized()?;

        // Idempotent: an unknown id is already closed.
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return Ok(());
        };

        info!(connection = %connection_id, "closing process connection");

        for task in connection.tasks.lock().drain(..) {
            task.abort();
        }

        if let Some(mut child) = connection.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                warn!(connection = %connection_id, error = %e, "failed to signal child");
            }
            let _ = child.wait().await;
        }

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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_backend() -> ConnectionConfig {
        // Reads one line, then answers with a canned pong for id 1.
        ConnectionConfig {
            command: Some("sh".to_string()),
            args: vec![
                "-c".to_string(),
                r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":"pong"}'; sleep 5"#
                    .to_string(),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn operations_require_initialize() {
        let transport = ProcessTransport::default();
        let result = transport.create_connection(echo_backend()).await;
        assert!(matches!(result, Err(TransportError::NotInitialized)));
    }

    #[tokio::test]
    async fn missing_command_is_invalid_config() {
        let transport = ProcessTransport::default();
        transport.initialize().unwrap();
        let result = transport.create_connection(ConnectionConfig::default()).await;
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn send_on_unknown_connection_fails() {
        let transport = ProcessTransport::default();
        transport.initialize().unwrap();
        let result = transport
            .send_message(&ConnectionId::from("conn-nope"), json!({"jsonrpc": "2.0", "method": "m"}))
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionNotFound(_))));
    }

    #[tokio::test]
    async fn malformed_message_is_rejected_before_dispatch() {
        let transport = ProcessTransport::default();
        transport.initialize().unwrap();
        let id = transport.create_connection(echo_backend()).await.unwrap();

        let result = transport
            .send_message(&id, json!({"method": "ping", "id": 1}))
            .await;
        assert!(matches!(result, Err(TransportError::InvalidMessage(_))));

        transport.close_connection(&id).await.unwrap();
    }

    #[tokio::test]
    async fn request_round_trip_resolves_exact_response() {
        let transport = ProcessTransport::default();
        transport.initialize().unwrap();
        let id = transport.create_connection(echo_backend()).await.unwrap();

        let response = transport
            .send_message(&id, json!({"jsonrpc": "2.0", "method": "ping", "id": 1}))
            .await
            .unwrap();
        assert_eq!(response, json!({"jsonrpc": "2.0", "id": 1, "result": "pong"}));

        transport.close_connection(&id).await.unwrap();
    }

    #[tokio::test]
    async fn notification_gets_synthetic_ack() {
        let transport = ProcessTransport::default();
        transport.initialize().unwrap();
        let id = transport
            .create_connection(ConnectionConfig {
                command: Some("cat".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let ack = transport
            .send_message(&id, json!({"jsonrpc": "2.0", "method": "log"}))
            .await
            .unwrap();
        assert_eq!(ack["result"], json!("notification sent"));

        transport.close_connection(&id).await.unwrap();
    }

    #[tokio::test]
    async fn process_exit_broadcasts_termination_to_pending_requests() {
        let transport = ProcessTransport::default();
        transport.initialize().unwrap();
        // Consumes the request and exits without answering.
        let id = transport
            .create_connection(ConnectionConfig {
                command: Some("sh".to_string()),
                args: vec!["-c".to_string(), "read line".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        let result = transport
            .send_message(&id, json!({"jsonrpc": "2.0", "method": "ping", "id": 9}))
            .await;

        match result {
            Err(TransportError::BackendTerminated(error)) => {
                assert_eq!(error.code, -32603);
                assert_eq!(error.message, "Process terminated");
            }
            other => panic!("expected BackendTerminated, got {other:?}"),
        }

        // The record survives until an explicit close; its state reflects the exit.
        let status = transport.get_status(&id).await;
        assert_eq!(status.status, ConnectionState::Disconnected);

        // Sending on a dead connection reports it as inactive.
        let result = transport
            .send_message(&id, json!({"jsonrpc": "2.0", "method": "ping", "id": 10}))
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionInactive { .. })));

        transport.close_connection(&id).await.unwrap();
    }

    #[tokio::test]
    async fn silent_backend_times_out_and_clears_the_pending_entry() {
        let transport = ProcessTransport::new(TimeoutConfig {
            request: Duration::from_millis(100),
            handshake: Duration::from_secs(10),
        });
        transport.initialize().unwrap();
        // Consumes the request, then stays alive without ever answering.
        let id = transport
            .create_connection(ConnectionConfig {
                command: Some("sh".to_string()),
                args: vec!["-c".to_string(), "read line; sleep 5".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        let err = transport
            .send_message(&id, json!({"jsonrpc": "2.0", "method": "ping", "id": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));

        // The entry is gone, so a late response would resolve nothing.
        let connection = transport
            .connections
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap();
        assert_eq!(connection.pending.len(), 0);

        transport.close_connection(&id).await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_gauge_never_goes_negative() {
        let transport = ProcessTransport::default();
        transport.initialize().unwrap();
        let id = transport
            .create_connection(ConnectionConfig {
                command: Some("cat".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(self::snapshot(&transport).active_connections, 1);

        transport.close_connection(&id).await.unwrap();
        transport.close_connection(&id).await.unwrap();
        transport
            .close_connection(&ConnectionId::from("conn-never-existed"))
            .await
            .unwrap();

        let snapshot = self::snapshot(&transport);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.total_connections, 1);

        assert_eq!(transport.get_status(&id).await, ConnectionStatus::unknown());
    }

    #[tokio::test]
    async fn backend_notifications_reach_the_hook() {
        let (tx, mut rx) = mpsc::channel(8);
        let transport = ProcessTransport::default();
        transport.initialize().unwrap();
        let id = transport
            .create_connection(ConnectionConfig {
                command: Some("sh".to_string()),
                args: vec![
                    "-c".to_string(),
                    r#"printf '%s\n' '{"jsonrpc":"2.0","method":"progress","params":{"pct":40}}'; sleep 5"#
                        .to_string(),
                ],
                notifications: Some(tx),
                ..Default::default()
            })
            .await
            .unwrap();

        let pushed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed["method"], json!("progress"));

        transport.close_connection(&id).await.unwrap();
    }

    fn snapshot(transport: &ProcessTransport) -> crate::metrics::MetricsSnapshot {
        transport.core.metrics.snapshot()
    }
}
