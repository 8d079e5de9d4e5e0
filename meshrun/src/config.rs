//! Configuration structures for brokers, the registry and the circuit breaker.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::error::MeshError;
use crate::registry::NodeId;
use crate::strategy::{StrategyKind, StrategyOptions};

/// Registry behavior.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Strategy for lists whose action does not name one.
    pub strategy: StrategyKind,

    /// Per-strategy options.
    pub strategy_options: StrategyOptions,

    /// An available local endpoint wins over remote ones.
    pub prefer_local: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::RoundRobin,
            strategy_options: StrategyOptions::default(),
            prefer_local: true,
        }
    }
}

/// Predicate deciding whether an error counts as a breaker failure.
pub type FailurePredicate = Rc<dyn Fn(&MeshError) -> bool>;

/// Circuit breaker behavior.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Whether breakers are tracked at all.
    pub enabled: bool,

    /// Failure rate (0..1) that trips the breaker.
    pub threshold: f64,

    /// Calls needed in a window before the rate is evaluated.
    pub min_request_count: u32,

    /// Length of the counting window.
    pub window_time: Duration,

    /// Time spent OPEN before a trial call is allowed.
    pub half_open_time: Duration,

    /// Which errors count as failures. Defaults to codes >= 500.
    pub check: FailurePredicate,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.5,
            min_request_count: 20,
            window_time: Duration::from_secs(60),
            half_open_time: Duration::from_secs(10),
            check: Rc::new(|err: &MeshError| err.code() >= 500),
        }
    }
}

impl CircuitBreakerConfig {
    /// Enabled breaker with the given threshold and minimum request count.
    pub fn enabled(threshold: f64, min_request_count: u32) -> Self {
        Self {
            enabled: true,
            threshold,
            min_request_count,
            ..Self::default()
        }
    }

    /// Set window and half-open durations.
    pub fn with_timing(mut self, window_time: Duration, half_open_time: Duration) -> Self {
        self.window_time = window_time;
        self.half_open_time = half_open_time;
        self
    }

    /// Replace the failure predicate.
    pub fn with_check(mut self, check: impl Fn(&MeshError) -> bool + 'static) -> Self {
        self.check = Rc::new(check);
        self
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("enabled", &self.enabled)
            .field("threshold", &self.threshold)
            .field("min_request_count", &self.min_request_count)
            .field("window_time", &self.window_time)
            .field("half_open_time", &self.half_open_time)
            .finish_non_exhaustive()
    }
}

/// Broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Node identifier, unique in the namespace.
    pub node_id: NodeId,

    /// Cluster namespace; nodes only see peers in the same namespace.
    pub namespace: String,

    /// Default per-attempt request timeout. `None` waits forever.
    pub request_timeout: Option<Duration>,

    /// Default number of retries for retryable errors.
    pub retries: u32,

    /// Interval between HEARTBEAT broadcasts.
    pub heartbeat_interval: Duration,

    /// Silence after which a node is considered lost.
    pub heartbeat_timeout: Duration,

    /// Offline time after which a node is forgotten.
    ///
    /// Set to `Duration::ZERO` to keep offline nodes forever.
    pub clean_offline_nodes_timeout: Duration,

    /// Interval between gossip exchanges.
    ///
    /// Set to `Duration::ZERO` to disable gossip.
    pub gossip_interval: Duration,

    /// Interval between latency PINGs to every node.
    ///
    /// Set to `Duration::ZERO` to disable latency sampling.
    pub latency_ping_interval: Duration,

    /// Maximum unacknowledged stream chunks in flight.
    pub stream_window: usize,

    /// Registry configuration.
    pub registry: RegistryConfig,

    /// Circuit breaker configuration.
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            namespace: String::new(),
            request_timeout: None,
            retries: 0,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            clean_offline_nodes_timeout: Duration::from_secs(600),
            gossip_interval: Duration::ZERO,
            latency_ping_interval: Duration::ZERO,
            stream_window: 16,
            registry: RegistryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Default configuration for `node_id`.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Configuration with short timers, for in-process clusters.
    pub fn local_cluster(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            clean_offline_nodes_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the default request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the default number of retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set heartbeat interval and timeout.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Enable gossip with the given interval.
    pub fn with_gossip(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Enable latency sampling with the given interval.
    pub fn with_latency_pings(mut self, interval: Duration) -> Self {
        self.latency_ping_interval = interval;
        self
    }

    /// Set the stream flow-control window.
    pub fn with_stream_window(mut self, window: usize) -> Self {
        self.stream_window = window.max(1);
        self
    }

    /// Set the default strategy.
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.registry.strategy = strategy;
        self
    }

    /// Set strategy options.
    pub fn with_strategy_options(mut self, options: StrategyOptions) -> Self {
        self.registry.strategy_options = options;
        self
    }

    /// Toggle local endpoint preference.
    pub fn with_prefer_local(mut self, prefer_local: bool) -> Self {
        self.registry.prefer_local = prefer_local;
        self
    }

    /// Set the circuit breaker configuration.
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }
}

/// `hostname-pid`, falling back to `node-pid`.
fn default_node_id() -> NodeId {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "node".to_string());
    format!("{}-{}", host.to_lowercase(), std::process::id())
}
