//! # Relay Transport
//!
//! Client-side transport layer for JSON-RPC 2.0 backends.
//!
//! Three backend kinds hide behind one four-operation contract (create,
//! send, close, status):
//!
//! - **Process**: a spawned child process speaking newline-delimited JSON
//!   over stdin/stdout ([`ProcessTransport`])
//! - **HTTP**: one POST per message, optionally paired with a long-lived
//!   server-push stream ([`HttpTransport`])
//! - **WebSocket**: a persistent full-duplex socket with automatic
//!   reconnection ([`WebSocketTransport`])
//!
//! Callers normally hold a [`TransportSelector`], which picks the kind from
//! each connection configuration and routes every subsequent operation by
//! connection id:
//!
//! ```no_run
//! use relay_transport::{ConnectionConfig, TransportSelector};
//! use serde_json::json;
//!
//! # async fn run() -> relay_transport::TransportResult<()> {
//! let selector = TransportSelector::default();
//! selector.initialize()?;
//!
//! let config: ConnectionConfig = serde_json::from_value(json!({
//!     "command": "my-backend",
//!     "args": ["--stdio"],
//! }))?;
//! let id = selector.create_connection(config).await?;
//!
//! let response = selector
//!     .send_message(&id, json!({"jsonrpc": "2.0", "method": "ping", "id": 1}))
//!     .await?;
//! println!("backend said: {response}");
//!
//! selector.close_connection(&id).await?;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod config;
mod core;
mod error;
mod framing;
mod http;
mod metrics;
mod pending;
mod process;
mod selector;
mod websocket;

pub use config::{
    ConnectionConfig, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY_MS, TimeoutConfig,
};
pub use crate::core::{ConnectionId, ConnectionState, ConnectionStatus, Transport, TransportKind};
pub use error::{TransportError, TransportResult};
pub use http::HttpTransport;
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use process::ProcessTransport;
pub use selector::TransportSelector;
pub use websocket::WebSocketTransport;
