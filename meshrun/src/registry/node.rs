//! A single cluster member as seen from this process.

use std::collections::VecDeque;
use std::time::Duration;

use crate::packet::{ClientInfo, HeartbeatPayload, InfoPayload, Meta, ServiceDescriptor};

use super::NodeId;

/// Number of samples kept for rolling load/latency averages.
pub const DEFAULT_SAMPLE_WINDOW: usize = 5;

/// Fixed-size window of recent samples.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    /// Create an empty window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Push a sample, evicting the oldest one when full.
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean of the retained samples, `None` if empty.
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Most recent sample.
    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window holds no sample.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// One cluster member.
///
/// # Invariants
///
/// - `seq` never decreases for a given `instance_id`.
/// - `offline_since` is `Some` exactly when `available` is false (for remote
///   nodes that have been seen at least once).
#[derive(Debug, Clone)]
pub struct Node {
    /// Node identifier.
    pub id: NodeId,
    /// Process lifetime identifier, changes on restart.
    pub instance_id: Option<String>,
    /// True for the node hosting this process.
    pub local: bool,
    /// Liveness as decided by heartbeats and DISCONNECT packets.
    pub available: bool,
    /// Monotonic time of the last heartbeat (or INFO).
    pub last_heartbeat_time: Duration,
    /// Monotonic time the node went offline.
    pub offline_since: Option<Duration>,
    /// Info version counter.
    pub seq: u64,
    /// Advertised services.
    pub services: Vec<ServiceDescriptor>,
    /// IP addresses.
    pub ip_list: Vec<String>,
    /// Hostname.
    pub hostname: String,
    /// Client library information.
    pub client: ClientInfo,
    /// Node metadata.
    pub metadata: Meta,
    /// Last reported CPU usage.
    pub cpu: Option<f64>,
    cpu_samples: RollingWindow,
    latency_samples: RollingWindow,
}

impl Node {
    /// Create an unknown-yet remote node.
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            instance_id: None,
            local: false,
            available: true,
            last_heartbeat_time: Duration::ZERO,
            offline_since: None,
            seq: 0,
            services: Vec::new(),
            ip_list: Vec::new(),
            hostname: String::new(),
            client: ClientInfo::default(),
            metadata: Meta::new(),
            cpu: None,
            cpu_samples: RollingWindow::new(DEFAULT_SAMPLE_WINDOW),
            latency_samples: RollingWindow::new(DEFAULT_SAMPLE_WINDOW),
        }
    }

    /// Create the node representing this process.
    pub fn new_local(id: impl Into<NodeId>, instance_id: impl Into<String>) -> Self {
        let mut node = Self::new(id);
        node.local = true;
        node.instance_id = Some(instance_id.into());
        node.seq = 1;
        node
    }

    /// Apply an INFO payload.
    ///
    /// Returns true when the service list must be re-registered: the seq
    /// increased, the node reconnected, or it restarted with a new instance id.
    /// An INFO with a seq not greater than the stored one (same instance) only
    /// refreshes liveness.
    pub fn update(&mut self, payload: &InfoPayload, is_reconnected: bool, now: Duration) -> bool {
        self.last_heartbeat_time = now;
        let restarted = self
            .instance_id
            .as_ref()
            .is_some_and(|id| id != &payload.instance_id);
        if !(payload.seq > self.seq || is_reconnected || restarted) {
            return false;
        }

        self.instance_id = Some(payload.instance_id.clone());
        self.seq = payload.seq;
        self.services = payload.services.clone();
        self.ip_list = payload.ip_list.clone();
        self.hostname = payload.hostname.clone();
        self.client = payload.client.clone();
        self.metadata = payload.metadata.clone();
        true
    }

    /// Apply a heartbeat: refresh liveness and record load.
    pub fn heartbeat(&mut self, payload: &HeartbeatPayload, now: Duration) {
        if !self.available {
            self.available = true;
            self.offline_since = None;
        }
        self.last_heartbeat_time = now;
        if let Some(cpu) = payload.cpu {
            self.cpu = Some(cpu);
            self.cpu_samples.push(cpu);
        }
    }

    /// Mark the node offline.
    ///
    /// The local seq is bumped so a later INFO from the same instance is still
    /// treated as a change.
    pub fn disconnected(&mut self, now: Duration) {
        if self.available {
            self.offline_since = Some(now);
            self.seq += 1;
        }
        self.available = false;
    }

    /// Record one round-trip time sample.
    pub fn record_latency(&mut self, latency: Duration) {
        self.latency_samples.push(latency.as_secs_f64() * 1000.0);
    }

    /// Mean round-trip latency in milliseconds over the recent window.
    pub fn avg_latency_ms(&self) -> Option<f64> {
        self.latency_samples.average()
    }

    /// Mean CPU usage over the recent window.
    pub fn avg_cpu(&self) -> Option<f64> {
        self.cpu_samples.average()
    }

    /// Number of actions advertised by this node.
    pub fn action_count(&self) -> usize {
        self.services.iter().map(|s| s.actions.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(seq: u64, instance: &str) -> InfoPayload {
        InfoPayload {
            ver: crate::packet::PROTOCOL_VERSION.to_string(),
            sender: "node-b".into(),
            services: vec![],
            ip_list: vec!["10.0.0.2".into()],
            hostname: "b".into(),
            seq,
            instance_id: instance.into(),
            metadata: Meta::new(),
            client: ClientInfo::default(),
        }
    }

    #[test]
    fn test_update_only_on_higher_seq() {
        let mut node = Node::new("node-b");
        assert!(node.update(&info(2, "i1"), false, Duration::ZERO));
        assert_eq!(node.seq, 2);
        assert!(!node.update(&info(2, "i1"), false, Duration::ZERO));
        assert!(!node.update(&info(1, "i1"), false, Duration::ZERO));
        assert_eq!(node.seq, 2);
        assert!(node.update(&info(3, "i1"), false, Duration::ZERO));
    }

    #[test]
    fn test_update_on_reconnect_or_restart() {
        let mut node = Node::new("node-b");
        node.update(&info(5, "i1"), false, Duration::ZERO);
        assert!(node.update(&info(5, "i1"), true, Duration::ZERO));
        assert!(node.update(&info(1, "i2"), false, Duration::ZERO));
        assert_eq!(node.seq, 1);
        assert_eq!(node.instance_id.as_deref(), Some("i2"));
    }

    #[test]
    fn test_disconnect_and_heartbeat() {
        let mut node = Node::new("node-b");
        node.update(&info(1, "i1"), false, Duration::ZERO);
        node.disconnected(Duration::from_secs(10));
        assert!(!node.available);
        assert_eq!(node.offline_since, Some(Duration::from_secs(10)));
        assert_eq!(node.seq, 2);

        // A second disconnect does not bump seq again.
        node.disconnected(Duration::from_secs(11));
        assert_eq!(node.seq, 2);

        node.heartbeat(
            &HeartbeatPayload::new("node-b", Some(40.0), 2),
            Duration::from_secs(12),
        );
        assert!(node.available);
        assert_eq!(node.offline_since, None);
        assert_eq!(node.cpu, Some(40.0));
    }

    #[test]
    fn test_rolling_window_average() {
        let mut window = RollingWindow::new(3);
        assert_eq!(window.average(), None);
        for v in [1.0, 2.0, 3.0, 10.0] {
            window.push(v);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), Some(5.0));
        assert_eq!(window.last(), Some(10.0));
    }
}
