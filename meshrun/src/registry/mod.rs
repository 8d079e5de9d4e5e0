//! Service registry.
//!
//! The [`Registry`] owns the node, service, action and event catalogs of one
//! broker and is the only component that mutates them. Transit feeds it the
//! packets it receives; callers ask it for endpoints.
//!
//! ```text
//!   INFO ──► process_node_info ──► NodeCatalog (seq check)
//!                                     │ changed?
//!                                     ▼
//!              ServiceCatalog / ActionCatalog / EventCatalog (upsert, prune)
//!                                     │
//!                                     ▼
//!                     LocalBus: $node.connected | $node.updated
//! ```
//!
//! Re-registration is diff based: endpoints of actions still advertised are
//! updated in place (their circuit breaker state and strategy position
//! survive), the rest are pruned.

pub mod action_catalog;
pub mod endpoint;
pub mod event_catalog;
pub mod node;
pub mod node_catalog;
pub mod service_catalog;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use crate::bus::{LocalBus, LocalEvent};
use crate::config::RegistryConfig;
use crate::context::Context;
use crate::error::MeshError;
use crate::packet::{
    GossipRequestPayload, GossipResponsePayload, HeartbeatPayload, InfoPayload, ServiceDescriptor,
    PROTOCOL_VERSION,
};
use crate::service::{full_service_name, ActionDefinition, EventDefinition, ServiceSchema};

pub use action_catalog::{ActionCatalog, ActionSummary};
pub use endpoint::{Endpoint, EndpointKind, EndpointList};
pub use event_catalog::{match_event, EventCatalog};
pub use node::Node;
pub use node_catalog::{ListOptions, NodeCatalog, NodeInfoUpdate};
pub use service_catalog::{ServiceCatalog, ServiceItem};

/// Node identifier.
pub type NodeId = String;

/// What applying an INFO payload did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeInfoChange {
    /// The payload was ignored (our own id).
    Ignored,
    /// Nothing changed beyond liveness.
    Refreshed,
    /// The node is new or came back.
    Connected {
        /// True when it came back from offline.
        reconnected: bool,
    },
    /// The node advertised a new service list.
    Updated,
}

/// What a received heartbeat means for the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Our own heartbeat.
    Ignored,
    /// Never seen this node: ask it for INFO.
    UnknownNode,
    /// The node is marked offline: ask it for INFO.
    OfflineNode,
    /// The node advertises a higher seq than we hold: we missed an INFO.
    MissedInfo,
    /// Liveness refreshed.
    Refreshed,
}

/// Registry counts for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryMetrics {
    /// Known nodes, local included.
    pub nodes_total: usize,
    /// Online nodes.
    pub nodes_online: usize,
    /// Offline nodes still remembered.
    pub nodes_offline: usize,
    /// Distinct services.
    pub services: usize,
    /// Distinct actions.
    pub actions: usize,
    /// Event subscriptions.
    pub events: usize,
}

/// Catalogs of one broker plus the local node.
#[derive(Debug)]
pub struct Registry {
    node_id: NodeId,
    instance_id: String,
    config: RegistryConfig,
    bus: LocalBus,
    local: Rc<RefCell<Node>>,
    nodes: NodeCatalog,
    services: ServiceCatalog,
    actions: ActionCatalog,
    events: EventCatalog,
    metrics: Cell<RegistryMetrics>,
}

impl Registry {
    /// Create a registry whose local node is `node_id`.
    pub fn new(node_id: impl Into<NodeId>, config: RegistryConfig, bus: LocalBus) -> Self {
        let node_id = node_id.into();
        let instance_id = uuid::Uuid::new_v4().to_string();
        let local = Rc::new(RefCell::new(Node::new_local(
            node_id.clone(),
            instance_id.clone(),
        )));
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            local.borrow_mut().hostname = hostname;
        }

        let registry = Self {
            nodes: NodeCatalog::new(local.clone()),
            services: ServiceCatalog::new(),
            actions: ActionCatalog::new(
                config.strategy,
                config.strategy_options.clone(),
                bus.clone(),
            ),
            events: EventCatalog::new(
                config.strategy,
                config.strategy_options.clone(),
                bus.clone(),
            ),
            node_id,
            instance_id,
            config,
            bus,
            local,
            metrics: Cell::new(RegistryMetrics::default()),
        };
        registry.update_metrics();
        registry
    }

    /// Local node id.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Local process instance id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Notification bus the registry publishes on.
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    /// Node catalog.
    pub fn nodes(&self) -> &NodeCatalog {
        &self.nodes
    }

    /// Service catalog.
    pub fn services(&self) -> &ServiceCatalog {
        &self.services
    }

    /// Action catalog.
    pub fn actions(&self) -> &ActionCatalog {
        &self.actions
    }

    /// Event catalog.
    pub fn events(&self) -> &EventCatalog {
        &self.events
    }

    /// Current info seq of the local node.
    pub fn local_seq(&self) -> u64 {
        self.local.borrow().seq
    }

    /// Whether an available local endpoint should win over remote ones.
    pub fn prefer_local(&self) -> bool {
        self.config.prefer_local
    }

    // -- local services -------------------------------------------------

    /// Register a local service and bump the local seq.
    ///
    /// Registering a service with the same full name replaces it.
    pub fn register_local_service(&self, schema: ServiceSchema) {
        let (descriptor, actions, events) = schema.into_parts();
        let full_name = descriptor.full_name.clone();
        let descriptors = {
            let mut local = self.local.borrow_mut();
            local.services.retain(|s| s.full_name != full_name);
            local.services.push(descriptor);
            local.seq += 1;
            local.services.clone()
        };

        self.sync_node_services(&self.local, &descriptors, actions, events, true);
        tracing::info!(
            node_id = %self.node_id,
            service = %full_name,
            seq = self.local_seq(),
            "local service registered"
        );
        self.bus.emit(LocalEvent::LocalServicesChanged);
        self.update_metrics();
    }

    /// Unregister a local service by full name. Returns whether it existed.
    pub fn unregister_local_service(&self, full_name: &str) -> bool {
        let descriptors = {
            let mut local = self.local.borrow_mut();
            let before = local.services.len();
            local.services.retain(|s| s.full_name != full_name);
            if local.services.len() == before {
                return false;
            }
            local.seq += 1;
            local.services.clone()
        };

        self.sync_node_services(&self.local, &descriptors, Vec::new(), Vec::new(), true);
        tracing::info!(node_id = %self.node_id, service = %full_name, "local service unregistered");
        self.bus.emit(LocalEvent::LocalServicesChanged);
        self.update_metrics();
        true
    }

    /// INFO payload describing the local node.
    ///
    /// Protected actions stay private to this process and are left out.
    pub fn local_info(&self) -> InfoPayload {
        info_of(&self.local.borrow())
    }

    /// INFO payload of any known node.
    pub fn node_info(&self, node_id: &str) -> Option<InfoPayload> {
        self.nodes.get(node_id).map(|n| info_of(&n.borrow()))
    }

    // -- remote nodes ---------------------------------------------------

    /// Apply an INFO payload received from a peer.
    pub fn process_node_info(&self, payload: &InfoPayload, now: Duration) -> NodeInfoChange {
        if payload.sender == self.node_id {
            if payload.instance_id != self.instance_id {
                tracing::error!(
                    node_id = %self.node_id,
                    remote_instance = %payload.instance_id,
                    "another process uses this node id"
                );
            }
            return NodeInfoChange::Ignored;
        }

        let update = self.nodes.process_node_info(payload, now);
        if update.changed {
            let (actions, events) = remote_definitions(&payload.services);
            self.sync_node_services(&update.node, &payload.services, actions, events, false);
        }

        let change = if update.is_new || update.reconnected {
            tracing::info!(
                node_id = %payload.sender,
                reconnected = update.reconnected,
                seq = payload.seq,
                "node connected"
            );
            self.bus.emit(LocalEvent::NodeConnected {
                node_id: payload.sender.clone(),
                reconnected: update.reconnected,
            });
            NodeInfoChange::Connected {
                reconnected: update.reconnected,
            }
        } else if update.changed {
            tracing::info!(node_id = %payload.sender, seq = payload.seq, "node updated");
            self.bus.emit(LocalEvent::NodeUpdated {
                node_id: payload.sender.clone(),
            });
            NodeInfoChange::Updated
        } else {
            tracing::trace!(node_id = %payload.sender, seq = payload.seq, "stale or duplicate INFO");
            NodeInfoChange::Refreshed
        };
        self.update_metrics();
        change
    }

    /// Mark a node offline and drop its endpoints.
    ///
    /// Returns false when the node was unknown or already offline.
    pub fn node_disconnected(&self, node_id: &str, unexpected: bool, now: Duration) -> bool {
        if self.nodes.disconnected(node_id, now).is_none() {
            return false;
        }
        self.remove_node_entries(node_id);

        if unexpected {
            tracing::warn!(node_id = %node_id, "node disconnected unexpectedly");
        } else {
            tracing::info!(node_id = %node_id, "node disconnected");
        }
        self.bus.emit(LocalEvent::NodeDisconnected {
            node_id: node_id.to_string(),
            unexpected,
        });
        self.update_metrics();
        true
    }

    /// Apply a heartbeat.
    pub fn heartbeat_received(&self, payload: &HeartbeatPayload, now: Duration) -> HeartbeatOutcome {
        if payload.sender == self.node_id {
            return HeartbeatOutcome::Ignored;
        }
        let Some(node) = self.nodes.get(&payload.sender) else {
            return HeartbeatOutcome::UnknownNode;
        };
        let mut node = node.borrow_mut();
        if !node.available {
            return HeartbeatOutcome::OfflineNode;
        }
        node.heartbeat(payload, now);
        if payload.seq > node.seq {
            HeartbeatOutcome::MissedInfo
        } else {
            HeartbeatOutcome::Refreshed
        }
    }

    /// Record a PING round-trip sample for `node_id`.
    pub fn record_latency(&self, node_id: &str, latency: Duration) {
        if let Some(node) = self.nodes.get(node_id) {
            node.borrow_mut().record_latency(latency);
        }
    }

    /// Disconnect every node silent for longer than `timeout`.
    pub fn check_remote_nodes(&self, now: Duration, timeout: Duration) -> Vec<NodeId> {
        self.nodes
            .stale(now, timeout)
            .into_iter()
            .filter(|id| self.node_disconnected(id, true, now))
            .collect()
    }

    /// Forget nodes offline for longer than `timeout`.
    pub fn check_offline_nodes(&self, now: Duration, timeout: Duration) -> Vec<NodeId> {
        let expired = self.nodes.expired(now, timeout);
        for id in &expired {
            self.remove_node_entries(id);
            self.nodes.delete(id);
            tracing::info!(node_id = %id, "forgetting offline node");
        }
        if !expired.is_empty() {
            self.update_metrics();
        }
        expired
    }

    // -- gossip ---------------------------------------------------------

    /// Digest of our view: seq per online and offline node.
    pub fn gossip_request(&self) -> GossipRequestPayload {
        let mut request = GossipRequestPayload {
            ver: PROTOCOL_VERSION.to_string(),
            sender: self.node_id.clone(),
            online: Default::default(),
            offline: Default::default(),
        };
        for node in self.nodes.to_array() {
            if node.available {
                request.online.insert(node.id, node.seq);
            } else {
                request.offline.insert(node.id, node.seq);
            }
        }
        request
    }

    /// Everything we know better than the requester.
    pub fn gossip_response(&self, request: &GossipRequestPayload) -> GossipResponsePayload {
        let mut response = GossipResponsePayload {
            ver: PROTOCOL_VERSION.to_string(),
            sender: self.node_id.clone(),
            online: Vec::new(),
            offline: Default::default(),
        };
        for node in self.nodes.to_array() {
            if node.id == request.sender {
                continue;
            }
            let theirs_online = request.online.get(&node.id).copied();
            let theirs_offline = request.offline.get(&node.id).copied();
            if node.available {
                let known = theirs_online.or(theirs_offline).unwrap_or(0);
                if theirs_online.is_none() || known < node.seq {
                    response.online.push(info_of(&node));
                }
            } else if theirs_online.is_some_and(|seq| seq <= node.seq) {
                response.offline.insert(node.id, node.seq);
            }
        }
        response
    }

    /// Apply a gossip response. Returns the nodes it disconnected.
    pub fn apply_gossip_response(&self, response: &GossipResponsePayload, now: Duration) -> Vec<NodeId> {
        for info in &response.online {
            self.process_node_info(info, now);
        }
        response
            .offline
            .iter()
            .filter(|(id, seq)| {
                self.nodes
                    .get(id)
                    .is_some_and(|n| n.borrow().seq <= **seq)
            })
            .filter(|(id, _)| self.node_disconnected(id, false, now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    // -- lookups --------------------------------------------------------

    /// Pick an endpoint for `action`.
    ///
    /// With `node_id` the call is pinned to that node. Fails with
    /// [`MeshError::ServiceNotFound`] when no endpoint is available, which
    /// includes every endpoint being circuit-broken.
    pub fn get_endpoint(
        &self,
        action: &str,
        ctx: &Context,
        node_id: Option<&str>,
    ) -> Result<Rc<Endpoint>, MeshError> {
        let not_found = || MeshError::ServiceNotFound {
            action: action.to_string(),
            node_id: node_id.map(str::to_string),
        };
        let list = self.actions.get(action).ok_or_else(not_found)?;
        match node_id {
            Some(id) => list
                .endpoint_by_node(id)
                .filter(|ep| ep.is_available())
                .ok_or_else(not_found),
            None => list.select(ctx, self.config.prefer_local).ok_or_else(not_found),
        }
    }

    /// Local definition of `action`, if this process serves it.
    pub fn local_action(&self, action: &str) -> Option<Rc<ActionDefinition>> {
        self.actions.get(action)?.local_endpoint()?.action()
    }

    /// Counts computed by the last [`Registry::update_metrics`].
    pub fn metrics(&self) -> RegistryMetrics {
        self.metrics.get()
    }

    /// Recompute node and catalog counts.
    pub fn update_metrics(&self) {
        let total = self.nodes.count();
        let online = self.nodes.online_count();
        self.metrics.set(RegistryMetrics {
            nodes_total: total,
            nodes_online: online,
            nodes_offline: total - online,
            services: self.services.count(),
            actions: self.actions.count(),
            events: self.events.count(),
        });
    }

    // -- internals ------------------------------------------------------

    fn sync_node_services(
        &self,
        node: &Rc<RefCell<Node>>,
        descriptors: &[ServiceDescriptor],
        actions: Vec<ActionDefinition>,
        events: Vec<EventDefinition>,
        local: bool,
    ) {
        let node_id = node.borrow().id.clone();

        let mut keep_services = HashSet::new();
        let mut keep_actions = HashSet::new();
        let mut keep_events = HashSet::new();
        for descriptor in descriptors {
            let full_name = service_full_name(descriptor);
            keep_actions.extend(descriptor.actions.keys().cloned());
            for event in descriptor.events.values() {
                let group = event.group.clone().unwrap_or_else(|| descriptor.name.clone());
                keep_events.insert((event.name.clone(), group));
            }
            self.services.register(&node_id, descriptor, local);
            keep_services.insert(full_name);
        }

        for action in actions {
            self.actions.add(node, action);
        }
        for event in events {
            self.events.add(node, event);
        }

        self.services.retain_for_node(&node_id, &keep_services);
        self.actions.retain_for_node(&node_id, &keep_actions);
        self.events.retain_for_node(&node_id, &keep_events);
    }

    fn remove_node_entries(&self, node_id: &str) {
        self.services.remove_by_node(node_id);
        self.actions.remove_by_node(node_id);
        self.events.remove_by_node(node_id);
    }
}

fn service_full_name(descriptor: &ServiceDescriptor) -> String {
    if descriptor.full_name.is_empty() {
        full_service_name(&descriptor.name, descriptor.version.as_deref())
    } else {
        descriptor.full_name.clone()
    }
}

/// Handler-less definitions for services advertised by a peer.
fn remote_definitions(services: &[ServiceDescriptor]) -> (Vec<ActionDefinition>, Vec<EventDefinition>) {
    let mut actions = Vec::new();
    let mut events = Vec::new();
    for service in services {
        let full_name = service_full_name(service);
        for descriptor in service.actions.values() {
            actions.push(ActionDefinition {
                descriptor: descriptor.clone(),
                service: full_name.clone(),
                handler: None,
            });
        }
        for descriptor in service.events.values() {
            events.push(EventDefinition {
                group: descriptor.group.clone().unwrap_or_else(|| service.name.clone()),
                descriptor: descriptor.clone(),
                service: full_name.clone(),
                handler: None,
            });
        }
    }
    (actions, events)
}

/// INFO of `node`, without protected actions.
fn info_of(node: &Node) -> InfoPayload {
    let mut services = node.services.clone();
    for service in &mut services {
        service.actions.retain(|_, action| !action.protected);
    }
    InfoPayload {
        ver: PROTOCOL_VERSION.to_string(),
        sender: node.id.clone(),
        services,
        ip_list: node.ip_list.clone(),
        hostname: node.hostname.clone(),
        seq: node.seq,
        instance_id: node.instance_id.clone().unwrap_or_default(),
        metadata: node.metadata.clone(),
        client: node.client.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ActionDescriptor, ClientInfo, Meta};
    use crate::service::Reply;
    use serde_json::json;
    use std::collections::HashMap;

    fn registry(id: &str) -> Registry {
        Registry::new(id, RegistryConfig::default(), LocalBus::new())
    }

    fn service(name: &str, actions: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.into(),
            version: None,
            full_name: name.into(),
            settings: Meta::new(),
            metadata: Meta::new(),
            actions: actions
                .iter()
                .map(|a| (format!("{name}.{a}"), ActionDescriptor::new(format!("{name}.{a}"))))
                .collect(),
            events: HashMap::new(),
        }
    }

    fn info(sender: &str, seq: u64, services: Vec<ServiceDescriptor>) -> InfoPayload {
        InfoPayload {
            ver: PROTOCOL_VERSION.to_string(),
            sender: sender.into(),
            services,
            ip_list: vec![],
            hostname: String::new(),
            seq,
            instance_id: format!("{sender}-i1"),
            metadata: Meta::new(),
            client: ClientInfo::default(),
        }
    }

    #[test]
    fn test_local_registration_bumps_seq_and_resolves_locally() {
        let registry = registry("self");
        let mut rx = registry.bus().subscribe();
        let seq = registry.local_seq();
        registry.register_local_service(
            ServiceSchema::new("math").action("add", |_ctx: Context| async { Ok(Reply::from(json!(3))) }),
        );
        assert_eq!(registry.local_seq(), seq + 1);
        assert_eq!(rx.try_recv().ok(), Some(LocalEvent::LocalServicesChanged));
        assert!(registry.local_action("math.add").is_some());
        assert_eq!(registry.local_info().services.len(), 1);

        assert!(registry.unregister_local_service("math"));
        assert!(registry.local_action("math.add").is_none());
        assert!(!registry.unregister_local_service("math"));
    }

    #[test]
    fn test_protected_actions_are_not_advertised() {
        let registry = registry("self");
        let secret = ActionDescriptor {
            protected: true,
            ..ActionDescriptor::new("rotate")
        };
        registry.register_local_service(
            ServiceSchema::new("vault")
                .action("read", |_ctx: Context| async { Ok(Reply::default()) })
                .action_with(secret, |_ctx: Context| async { Ok(Reply::default()) }),
        );

        assert!(registry.local_action("vault.rotate").is_some());
        let info = registry.local_info();
        let actions: Vec<&String> = info.services[0].actions.keys().collect();
        assert_eq!(actions, vec!["vault.read"]);
    }

    #[test]
    fn test_info_reordering_converges_to_highest_seq() {
        let packets = vec![
            info("b", 1, vec![service("math", &["add"])]),
            info("b", 2, vec![service("math", &["add", "sub"])]),
            info("b", 3, vec![service("math", &["mul"])]),
        ];
        let orders = [[0, 1, 2], [2, 1, 0], [1, 2, 0], [2, 0, 1]];
        for order in orders {
            let registry = registry("self");
            for i in order {
                registry.process_node_info(&packets[i], Duration::ZERO);
            }
            assert!(registry.actions().has("math.mul"));
            assert!(!registry.actions().has("math.add"));
            assert!(!registry.actions().has("math.sub"));
            assert_eq!(registry.nodes().get("b").map(|n| n.borrow().seq), Some(3));
        }
    }

    #[test]
    fn test_info_from_own_id_is_ignored() {
        let registry = registry("self");
        let change = registry.process_node_info(&info("self", 9, vec![]), Duration::ZERO);
        assert_eq!(change, NodeInfoChange::Ignored);
        assert_eq!(registry.nodes().count(), 1);
    }

    #[test]
    fn test_disconnect_removes_endpoints_and_notifies() {
        let registry = registry("self");
        let mut rx = registry.bus().subscribe();
        registry.process_node_info(&info("b", 1, vec![service("math", &["add"])]), Duration::ZERO);
        assert!(matches!(
            rx.try_recv(),
            Ok(LocalEvent::NodeConnected { reconnected: false, .. })
        ));

        assert!(registry.node_disconnected("b", true, Duration::from_secs(1)));
        assert!(!registry.node_disconnected("b", true, Duration::from_secs(2)));
        assert!(!registry.actions().has("math.add"));
        assert_eq!(
            rx.try_recv().ok(),
            Some(LocalEvent::NodeDisconnected {
                node_id: "b".into(),
                unexpected: true
            })
        );
        assert_eq!(registry.metrics().nodes_offline, 1);

        let change =
            registry.process_node_info(&info("b", 1, vec![service("math", &["add"])]), Duration::from_secs(3));
        assert_eq!(change, NodeInfoChange::Connected { reconnected: true });
        assert!(registry.actions().has("math.add"));
    }

    #[test]
    fn test_endpoint_survives_reregistration() {
        let registry = registry("self");
        registry.process_node_info(&info("b", 1, vec![service("math", &["add"])]), Duration::ZERO);
        let ctx = Context::default();
        let before = registry.get_endpoint("math.add", &ctx, None).expect("endpoint");
        before.set_state(false);

        registry.process_node_info(&info("b", 2, vec![service("math", &["add", "sub"])]), Duration::ZERO);
        let list = registry.actions().get("math.add").expect("list");
        let after = list.endpoint_by_node("b").expect("endpoint");
        assert!(Rc::ptr_eq(&before, &after));
        assert!(!after.state());
        assert!(registry.get_endpoint("math.add", &ctx, None).is_err());
    }

    #[test]
    fn test_directed_lookup() {
        let registry = registry("self");
        registry.process_node_info(&info("b", 1, vec![service("math", &["add"])]), Duration::ZERO);
        registry.process_node_info(&info("c", 1, vec![service("math", &["add"])]), Duration::ZERO);
        let ctx = Context::default();
        let ep = registry.get_endpoint("math.add", &ctx, Some("c")).expect("endpoint");
        assert_eq!(ep.id, "c");
        match registry.get_endpoint("math.add", &ctx, Some("z")) {
            Err(MeshError::ServiceNotFound { node_id, .. }) => assert_eq!(node_id.as_deref(), Some("z")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_outcomes() {
        let registry = registry("self");
        let hb = |seq| HeartbeatPayload::new("b", Some(12.0), seq);
        assert_eq!(registry.heartbeat_received(&hb(1), Duration::ZERO), HeartbeatOutcome::UnknownNode);

        registry.process_node_info(&info("b", 1, vec![]), Duration::ZERO);
        assert_eq!(registry.heartbeat_received(&hb(1), Duration::ZERO), HeartbeatOutcome::Refreshed);
        assert_eq!(registry.heartbeat_received(&hb(4), Duration::ZERO), HeartbeatOutcome::MissedInfo);

        registry.node_disconnected("b", false, Duration::ZERO);
        assert_eq!(registry.heartbeat_received(&hb(1), Duration::ZERO), HeartbeatOutcome::OfflineNode);
    }

    #[test]
    fn test_liveness_sweeps() {
        let registry = registry("self");
        registry.process_node_info(&info("b", 1, vec![service("math", &["add"])]), Duration::ZERO);
        assert!(registry
            .check_remote_nodes(Duration::from_secs(10), Duration::from_secs(30))
            .is_empty());
        assert_eq!(
            registry.check_remote_nodes(Duration::from_secs(31), Duration::from_secs(30)),
            vec!["b".to_string()]
        );
        assert_eq!(
            registry.check_offline_nodes(Duration::from_secs(700), Duration::from_secs(600)),
            vec!["b".to_string()]
        );
        assert!(!registry.nodes().has("b"));
    }

    #[test]
    fn test_gossip_exchange_fills_gaps() {
        let a = registry("a");
        let b = registry("b");
        a.process_node_info(&info("c", 2, vec![service("math", &["add"])]), Duration::ZERO);
        a.process_node_info(&info("d", 1, vec![]), Duration::ZERO);
        a.node_disconnected("d", true, Duration::ZERO);
        b.process_node_info(&info("d", 1, vec![]), Duration::ZERO);

        let response = a.gossip_response(&b.gossip_request());
        let offline = b.apply_gossip_response(&response, Duration::ZERO);

        assert!(b.actions().has("math.add"));
        assert!(b.nodes().has("a"));
        assert_eq!(offline, vec!["d".to_string()]);
    }
}
