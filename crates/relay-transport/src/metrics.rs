//! Per-transport-instance metrics counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free counters maintained by each transport instance.
///
/// `active_connections` is floored at zero on decrement: a close observed
/// after a terminal failure must never drive the gauge negative.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    /// Connections opened over the lifetime of the instance.
    total_connections: AtomicU64,

    /// Connections currently open (or, for sockets, connecting/reconnecting).
    active_connections: AtomicU64,

    /// Messages successfully dispatched across all connections.
    total_messages: AtomicU64,
}

impl TransportMetrics {
    /// Creates a fresh set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly opened connection.
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a closed connection, never dropping the gauge below zero.
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Records a successfully dispatched message.
    pub fn message_sent(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a serializable snapshot of the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
        }
    }
}

/// A serializable snapshot of a transport instance's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Connections opened over the lifetime of the instance.
    pub total_connections: u64,

    /// Connections currently active.
    pub active_connections: u64,

    /// Messages successfully dispatched.
    pub total_messages: u64,
}
