//! # meshrun
//!
//! Peer-to-peer service mesh coordination for single-threaded async nodes.
//!
//! Every node runs a [`ServiceBroker`] which:
//! - **Registry**: keeps the catalogs of nodes, services, actions and events
//!   learned from INFO packets, heartbeats and gossip
//! - **Strategies**: pick one endpoint per call (round-robin, random,
//!   CPU usage, latency, shard)
//! - **Transit**: correlates requests with responses, streams bytes with
//!   flow control and tracks node liveness
//! - **Circuit breaker**: takes failing endpoints out of rotation and
//!   probes them back in
//!
//! The mesh is transport agnostic: any [`Transporter`] moving topic-addressed
//! byte messages will do. [`InMemoryHub`] connects brokers of one process.
//!
//! ```rust
//! use meshrun::{BrokerConfig, CallOptions, Context, InMemoryHub, Reply, ServiceBroker, ServiceSchema};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), meshrun::MeshError> {
//! # let local = tokio::task::LocalSet::new();
//! # local.run_until(async {
//! let hub = InMemoryHub::new();
//! let broker = ServiceBroker::with_transporter(
//!     BrokerConfig::local_cluster("node-a"),
//!     hub.transporter("node-a"),
//! );
//! broker
//!     .register_service(ServiceSchema::new("greeter").action("hello", |ctx: Context| async move {
//!         let name = ctx.param("name").and_then(|v| v.as_str()).unwrap_or("world").to_string();
//!         Ok(Reply::from(json!(format!("hello {name}"))))
//!     }))
//!     .await?;
//! broker.start().await?;
//!
//! let response = broker
//!     .call("greeter.hello", json!({ "name": "mesh" }), CallOptions::new())
//!     .await?;
//! assert_eq!(response.data, json!("hello mesh"));
//! broker.stop().await?;
//! # Ok::<(), meshrun::MeshError>(())
//! # }).await
//! # }
//! ```

#![warn(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Service broker, the public entry point.
pub mod broker;

/// Local notification bus.
pub mod bus;

/// Per-endpoint circuit breaker.
pub mod circuit_breaker;

/// Packet serialization.
pub mod codec;

/// Broker, registry and circuit breaker configuration.
pub mod config;

/// Call context and call options.
pub mod context;

/// Error types and their wire form.
pub mod error;

/// Wire packets.
pub mod packet;

/// Time and task providers.
pub mod provider;

/// Node, service, action and event catalogs.
pub mod registry;

/// Service definitions and handler traits.
pub mod service;

/// Load-balancing strategies.
pub mod strategy;

/// Request correlation, streams and node liveness.
pub mod transit;

/// Transport abstraction and the in-memory transport.
pub mod transport;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Broker exports
pub use broker::ServiceBroker;
pub use config::{BrokerConfig, CircuitBreakerConfig, RegistryConfig};
pub use context::{CallOptions, Context};
pub use error::{ErrorPayload, MeshError};

// Service exports
pub use service::{ActionHandler, EventHandler, Reply, ServiceSchema};

// Registry and strategy exports
pub use registry::{Endpoint, NodeId, Registry};
pub use strategy::{StrategyKind, StrategyOptions};

// Transit exports
pub use transit::{chunk_channel, ByteStream, ChunkSource, PongInfo, Response};

// Observability exports
pub use bus::{LocalBus, LocalEvent};
pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};

// Wire exports
pub use codec::{JsonCodec, PacketCodec};
pub use packet::{Packet, PacketType, PROTOCOL_VERSION};
pub use provider::{Providers, TokioProviders};
pub use transport::{InMemoryHub, Transporter};
