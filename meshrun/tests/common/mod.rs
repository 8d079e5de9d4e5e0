//! Shared helpers for in-process cluster tests.

#![allow(dead_code)]

use std::future::Future;
use std::rc::Rc;

use meshrun::{BrokerConfig, InMemoryHub, ServiceBroker, ServiceSchema};

/// Install a test subscriber once; `RUST_LOG` overrides the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Run `f` inside a `LocalSet`, where every broker task lives.
pub async fn run_local<F: Future<Output = ()>>(f: F) {
    init_tracing();
    tokio::task::LocalSet::new().run_until(f).await;
}

/// Let spawned tasks drain their queues.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Start a broker on `hub` with `config` and `services`.
pub async fn start_node(
    hub: &InMemoryHub,
    config: BrokerConfig,
    services: Vec<ServiceSchema>,
) -> Rc<ServiceBroker> {
    let transporter = hub.transporter(config.node_id.clone());
    let broker = Rc::new(ServiceBroker::with_transporter(config, transporter));
    for schema in services {
        broker.register_service(schema).await.expect("register service");
    }
    broker.start().await.expect("start broker");
    broker
}

/// Start a broker with the in-process defaults.
pub async fn node(hub: &InMemoryHub, id: &str, services: Vec<ServiceSchema>) -> Rc<ServiceBroker> {
    start_node(hub, BrokerConfig::local_cluster(id), services).await
}
