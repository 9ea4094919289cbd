//! Connection and timeout configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Default number of reconnection attempts for socket connections.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Default base delay between socket reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Configuration for one logical connection.
///
/// Field names follow the wire convention used by callers (camelCase);
/// unrecognized fields are ignored. Which fields are required depends on the
/// transport kind: `command` for process connections, `url` for HTTP and
/// socket connections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    /// Opaque identifier supplied by the caller; not interpreted.
    #[serde(alias = "serverId")]
    pub backend_id: Option<String>,

    /// Command to spawn (process transport).
    pub command: Option<String>,

    /// Arguments for the spawned command.
    pub args: Vec<String>,

    /// Environment variables for the spawned command.
    pub env: HashMap<String, String>,

    /// Backend URL (HTTP and socket transports).
    pub url: Option<String>,

    /// Extra HTTP headers, applied to POST and push-stream requests alike.
    pub headers: HashMap<String, String>,

    /// Push-subscription endpoint. Presence selects the HTTP transport with
    /// a long-lived server-push stream in addition to per-call POSTs.
    pub push_endpoint: Option<String>,

    /// Requests a push stream on the connection's own `url` when no
    /// dedicated `pushEndpoint` is given.
    pub subscribe: bool,

    /// Reconnection attempt cap for socket connections.
    pub max_reconnect_attempts: Option<u32>,

    /// Base reconnection delay in milliseconds; attempt *n* waits `n` times
    /// this long.
    pub reconnect_delay_ms: Option<u64>,

    /// Where backend-initiated messages (push events, server requests) are
    /// delivered. Not part of the wire config.
    #[serde(skip)]
    pub notifications: Option<mpsc::Sender<Value>>,
}

impl ConnectionConfig {
    /// Resolved reconnection attempt cap.
    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS)
    }

    /// Resolved base reconnection delay.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.unwrap_or(DEFAULT_RECONNECT_DELAY_MS))
    }

    /// Whether the caller asked for a server-push stream.
    pub fn wants_push(&self) -> bool {
        self.push_endpoint.is_some() || self.subscribe
    }
}

/// Timeout windows shared by the transports.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// How long an id-bearing request may wait for its response.
    pub request: Duration,

    /// How long a socket handshake may take before the connection attempt
    /// is rejected.
    pub handshake: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            handshake: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_reconnect_attempts(), 3);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(1000));
        assert!(!config.wants_push());

        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.request, Duration::from_secs(30));
        assert_eq!(timeouts.handshake, Duration::from_secs(10));
    }

    #[test]
    fn deserializes_wire_names_and_ignores_unknown_fields() {
        let config: ConnectionConfig = serde_json::from_value(serde_json::json!({
            "serverId": "backend-7",
            "url": "wss://example.com/rpc",
            "maxReconnectAttempts": 5,
            "reconnectDelayMs": 250,
            "someFutureKnob": true,
        }))
        .unwrap();

        assert_eq!(config.backend_id.as_deref(), Some("backend-7"));
        assert_eq!(config.url.as_deref(), Some("wss://example.com/rpc"));
        assert_eq!(config.max_reconnect_attempts(), 5);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
    }

    #[test]
    fn push_selection() {
        let config: ConnectionConfig = serde_json::from_value(serde_json::json!({
            "url": "https://example.com/rpc",
            "pushEndpoint": "https://example.com/events",
        }))
        .unwrap();
        assert!(config.wants_push());

        let config: ConnectionConfig = serde_json::from_value(serde_json::json!({
            "url": "https://example.com/rpc",
            "subscribe": true,
        }))
        .unwrap();
        assert!(config.wants_push());
    }
}
