//! Local notification bus.
//!
//! Components never reach into each other's maps; they announce what changed
//! on the [`LocalBus`] and interested parties (registry metrics, the shard
//! strategy ring, dashboards, tests) subscribe. Publishing is fire-and-forget:
//! it never blocks and succeeds even with no subscriber.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::registry::NodeId;

/// Default buffered notifications per subscriber before it starts lagging.
const DEFAULT_CAPACITY: usize = 1024;

/// Notification emitted by the coordination layer.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    /// A node was seen for the first time, or came back after being offline.
    NodeConnected {
        /// Connected node.
        node_id: NodeId,
        /// True when the node was known and offline before.
        reconnected: bool,
    },
    /// A known node advertised a new service list.
    NodeUpdated {
        /// Updated node.
        node_id: NodeId,
    },
    /// A node left or stopped sending heartbeats.
    NodeDisconnected {
        /// Lost node.
        node_id: NodeId,
        /// True when the node did not announce its departure.
        unexpected: bool,
    },
    /// A PONG arrived.
    NodePong {
        /// Answering node.
        node_id: NodeId,
        /// Round-trip time.
        elapsed: Duration,
        /// Estimated clock difference in milliseconds (remote minus local).
        time_diff_ms: i64,
    },
    /// The local service list changed.
    LocalServicesChanged,
    /// A circuit breaker tripped.
    CircuitBreakerOpened {
        /// Endpoint node.
        node_id: NodeId,
        /// Action name.
        action: String,
        /// Failures in the current window.
        failures: u32,
        /// Calls in the current window.
        count: u32,
        /// `failures / count`.
        rate: f64,
    },
    /// A circuit breaker lets a trial call through.
    CircuitBreakerHalfOpened {
        /// Endpoint node.
        node_id: NodeId,
        /// Action name.
        action: String,
    },
    /// A circuit breaker closed after a successful trial.
    CircuitBreakerClosed {
        /// Endpoint node.
        node_id: NodeId,
        /// Action name.
        action: String,
    },
}

impl LocalEvent {
    /// Dotted notification name, e.g. `$node.connected`.
    pub fn name(&self) -> &'static str {
        match self {
            LocalEvent::NodeConnected { .. } => "$node.connected",
            LocalEvent::NodeUpdated { .. } => "$node.updated",
            LocalEvent::NodeDisconnected { .. } => "$node.disconnected",
            LocalEvent::NodePong { .. } => "$node.pong",
            LocalEvent::LocalServicesChanged => "$services.changed",
            LocalEvent::CircuitBreakerOpened { .. } => "$circuit-breaker.opened",
            LocalEvent::CircuitBreakerHalfOpened { .. } => "$circuit-breaker.half-opened",
            LocalEvent::CircuitBreakerClosed { .. } => "$circuit-breaker.closed",
        }
    }

    /// Whether this is a node topology change (`$node.*` except pong).
    pub fn is_topology_change(&self) -> bool {
        matches!(
            self,
            LocalEvent::NodeConnected { .. }
                | LocalEvent::NodeUpdated { .. }
                | LocalEvent::NodeDisconnected { .. }
        )
    }
}

/// Fire-and-forget broadcast of [`LocalEvent`]s.
///
/// Cloning the bus yields another handle on the same channel.
#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<LocalEvent>,
}

impl LocalBus {
    /// Create a bus with the default per-subscriber buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with a custom per-subscriber buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a notification.
    pub fn emit(&self, event: LocalEvent) {
        tracing::trace!(event = event.name(), "local notification");
        // No subscriber is not an error.
        let _ = self.sender.send(event);
    }

    /// Subscribe to notifications emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LocalEvent> {
        self.sender.subscribe()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}
