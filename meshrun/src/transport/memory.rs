//! In-process transport.
//!
//! [`InMemoryHub`] is a shared switchboard; every broker in the process gets
//! its own [`InMemoryTransporter`] attached to the same hub. Delivery is
//! immediate (pushed into the receiver's inbox during `send`), ordered per
//! sender, and can be cut for a node to simulate a crash or partition.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use async_trait::async_trait;

use super::{Inbox, IncomingMessage, Topic, TransportError, Transporter};
use crate::registry::NodeId;

#[derive(Debug, Default)]
struct HubInner {
    /// (namespace, node) -> inbox.
    subscribers: HashMap<(String, NodeId), Inbox>,
    /// Nodes whose traffic is silently dropped in both directions.
    partitioned: HashSet<NodeId>,
    /// Nodes whose sends fail with an error.
    failing: HashSet<NodeId>,
    /// Number of messages delivered so far.
    delivered: u64,
}

/// Shared switchboard connecting in-memory transporters.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHub {
    inner: Rc<RefCell<HubInner>>,
}

impl InMemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transporter for `node_id` in the default namespace.
    pub fn transporter(&self, node_id: impl Into<NodeId>) -> InMemoryTransporter {
        self.transporter_in("", node_id)
    }

    /// Create a transporter for `node_id` in `namespace`.
    pub fn transporter_in(
        &self,
        namespace: impl Into<String>,
        node_id: impl Into<NodeId>,
    ) -> InMemoryTransporter {
        InMemoryTransporter {
            hub: self.clone(),
            namespace: namespace.into(),
            node_id: node_id.into(),
        }
    }

    /// Drop all traffic to and from `node_id` (or restore it).
    ///
    /// A partitioned node looks crashed to its peers: no DISCONNECT, no
    /// heartbeats, no responses.
    pub fn set_partitioned(&self, node_id: &str, partitioned: bool) {
        let mut inner = self.inner.borrow_mut();
        if partitioned {
            inner.partitioned.insert(node_id.to_string());
        } else {
            inner.partitioned.remove(node_id);
        }
    }

    /// Make every send from `node_id` fail (or succeed again).
    pub fn set_failing(&self, node_id: &str, failing: bool) {
        let mut inner = self.inner.borrow_mut();
        if failing {
            inner.failing.insert(node_id.to_string());
        } else {
            inner.failing.remove(node_id);
        }
    }

    /// Total number of messages delivered through the hub.
    pub fn delivered(&self) -> u64 {
        self.inner.borrow().delivered
    }

    fn publish(&self, sender: &str, topic: &Topic, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        if !inner
            .subscribers
            .contains_key(&(topic.namespace.clone(), sender.to_string()))
        {
            return Err(TransportError::NotConnected);
        }
        if inner.failing.contains(sender) {
            return Err(TransportError::SendFailed {
                topic: topic.to_string(),
                reason: "medium unreachable".to_string(),
            });
        }
        if inner.partitioned.contains(sender) {
            return Ok(());
        }

        let message = IncomingMessage {
            kind: topic.kind,
            bytes,
        };
        let recipients: Vec<Inbox> = inner
            .subscribers
            .iter()
            .filter(|((ns, node), _)| {
                ns == &topic.namespace
                    && node.as_str() != sender
                    && !inner.partitioned.contains(node)
                    && topic.target.as_ref().map_or(true, |t| t == node)
            })
            .map(|(_, inbox)| inbox.clone())
            .collect();

        let mut delivered = 0;
        for inbox in recipients {
            if inbox.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        inner.delivered += delivered;
        Ok(())
    }
}

/// Transporter attached to an [`InMemoryHub`].
#[derive(Debug, Clone)]
pub struct InMemoryTransporter {
    hub: InMemoryHub,
    namespace: String,
    node_id: NodeId,
}

#[async_trait(?Send)]
impl Transporter for InMemoryTransporter {
    async fn connect(&self, inbox: Inbox) -> Result<(), TransportError> {
        tracing::debug!(node_id = %self.node_id, "in-memory transporter connected");
        self.hub
            .inner
            .borrow_mut()
            .subscribers
            .insert((self.namespace.clone(), self.node_id.clone()), inbox);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        tracing::debug!(node_id = %self.node_id, "in-memory transporter disconnected");
        self.hub
            .inner
            .borrow_mut()
            .subscribers
            .remove(&(self.namespace.clone(), self.node_id.clone()));
        Ok(())
    }

    async fn send(&self, topic: &Topic, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.hub.publish(&self.node_id, topic, bytes)
    }
}
