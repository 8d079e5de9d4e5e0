//! Endpoints and per-name endpoint lists.

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::context::Context;
use crate::service::{ActionDefinition, EventDefinition};
use crate::strategy::Strategy;

use super::node::Node;
use super::NodeId;

/// What an endpoint gives access to.
#[derive(Debug, Clone)]
pub enum EndpointKind {
    /// An action.
    Action(Rc<ActionDefinition>),
    /// An event subscription.
    Event(Rc<EventDefinition>),
}

/// A node's ability to serve one action or event.
///
/// `state` is owned by the circuit breaker. Node availability is read through
/// the shared node handle, so a node going offline hides all of its endpoints
/// at once without touching them.
pub struct Endpoint {
    /// Owning node id.
    pub id: NodeId,
    /// `node:action` name, used as the circuit breaker key.
    pub name: String,
    /// True when the owning node is this process.
    pub local: bool,
    state: Cell<bool>,
    node: Rc<RefCell<Node>>,
    kind: RefCell<EndpointKind>,
}

impl Endpoint {
    /// Create an endpoint on `node`.
    pub fn new(node: Rc<RefCell<Node>>, kind: EndpointKind) -> Self {
        let (id, local) = {
            let n = node.borrow();
            (n.id.clone(), n.local)
        };
        let item = match &kind {
            EndpointKind::Action(action) => action.descriptor.name.clone(),
            EndpointKind::Event(event) => event.descriptor.name.clone(),
        };
        Self {
            name: format!("{}:{}", id, item),
            id,
            local,
            state: Cell::new(true),
            node,
            kind: RefCell::new(kind),
        }
    }

    /// Circuit breaker state and node liveness combined.
    pub fn is_available(&self) -> bool {
        self.state.get() && self.node.borrow().available
    }

    /// Circuit breaker state alone.
    pub fn state(&self) -> bool {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: bool) {
        self.state.set(state);
    }

    /// Owning node.
    pub fn node(&self) -> Ref<'_, Node> {
        self.node.borrow()
    }

    /// Action definition, for action endpoints.
    pub fn action(&self) -> Option<Rc<ActionDefinition>> {
        match &*self.kind.borrow() {
            EndpointKind::Action(action) => Some(action.clone()),
            EndpointKind::Event(_) => None,
        }
    }

    /// Event definition, for event endpoints.
    pub fn event(&self) -> Option<Rc<EventDefinition>> {
        match &*self.kind.borrow() {
            EndpointKind::Event(event) => Some(event.clone()),
            EndpointKind::Action(_) => None,
        }
    }

    /// Replace the definition in place (re-registration of the same pair).
    pub(crate) fn update(&self, kind: EndpointKind) {
        *self.kind.borrow_mut() = kind;
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("local", &self.local)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Every endpoint registered under one action or event name.
///
/// Holds at most one endpoint per node. The strategy lives with the list so
/// stateful strategies (round-robin index, shard ring) are scoped to it.
pub struct EndpointList {
    name: String,
    group: Option<String>,
    endpoints: RefCell<Vec<Rc<Endpoint>>>,
    strategy: Box<dyn Strategy>,
}

impl EndpointList {
    /// Create an empty list.
    pub fn new(name: impl Into<String>, group: Option<String>, strategy: Box<dyn Strategy>) -> Self {
        Self {
            name: name.into(),
            group,
            endpoints: RefCell::new(Vec::new()),
            strategy,
        }
    }

    /// Action or event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consumer group, for event lists.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Add the endpoint of `node`, or update the existing one in place.
    ///
    /// Returns the endpoint now registered for that node.
    pub(crate) fn add(&self, node: &Rc<RefCell<Node>>, kind: EndpointKind) -> Rc<Endpoint> {
        let node_id = node.borrow().id.clone();
        if let Some(existing) = self.endpoint_by_node(&node_id) {
            existing.update(kind);
            return existing;
        }
        let endpoint = Rc::new(Endpoint::new(node.clone(), kind));
        self.endpoints.borrow_mut().push(endpoint.clone());
        endpoint
    }

    /// Remove the endpoint of `node_id`. Returns whether one was removed.
    pub(crate) fn remove_by_node(&self, node_id: &str) -> bool {
        let mut endpoints = self.endpoints.borrow_mut();
        let before = endpoints.len();
        endpoints.retain(|ep| ep.id != node_id);
        endpoints.len() != before
    }

    /// Endpoint registered for `node_id`.
    pub fn endpoint_by_node(&self, node_id: &str) -> Option<Rc<Endpoint>> {
        self.endpoints
            .borrow()
            .iter()
            .find(|ep| ep.id == node_id)
            .cloned()
    }

    /// Local endpoint, if this process serves the name.
    pub fn local_endpoint(&self) -> Option<Rc<Endpoint>> {
        self.endpoints.borrow().iter().find(|ep| ep.local).cloned()
    }

    /// Snapshot of every endpoint, in registration order.
    pub fn endpoints(&self) -> Vec<Rc<Endpoint>> {
        self.endpoints.borrow().clone()
    }

    /// Snapshot of the endpoints a strategy may pick.
    pub fn available(&self) -> Vec<Rc<Endpoint>> {
        self.endpoints
            .borrow()
            .iter()
            .filter(|ep| ep.is_available())
            .cloned()
            .collect()
    }

    /// Whether any endpoint is available.
    pub fn has_available(&self) -> bool {
        self.endpoints.borrow().iter().any(|ep| ep.is_available())
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.borrow().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.endpoints.borrow().is_empty()
    }

    /// Pick one available endpoint.
    ///
    /// With `prefer_local` an available local endpoint wins outright. A
    /// single candidate is returned without consulting the strategy.
    pub fn select(&self, ctx: &Context, prefer_local: bool) -> Option<Rc<Endpoint>> {
        let candidates = self.available();
        if candidates.is_empty() {
            return None;
        }
        if prefer_local {
            if let Some(local) = candidates.iter().find(|ep| ep.local) {
                return Some(local.clone());
            }
        }
        if candidates.len() == 1 {
            return candidates.into_iter().next();
        }
        self.strategy.select(&candidates, ctx)
    }
}

impl fmt::Debug for EndpointList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointList")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("endpoints", &self.endpoints.borrow())
            .field("strategy", &self.strategy)
            .finish()
    }
}
