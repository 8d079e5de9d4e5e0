//! Node catalog: the source of truth for cluster membership and liveness.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::packet::InfoPayload;

use super::node::Node;
use super::NodeId;

/// Filters for [`NodeCatalog::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Skip offline nodes.
    pub only_available: bool,
    /// Keep the service descriptors in the returned snapshots.
    pub with_services: bool,
}

/// Result of applying an INFO payload to the catalog.
#[derive(Debug, Clone)]
pub struct NodeInfoUpdate {
    /// Catalog entry for the node.
    pub node: Rc<RefCell<Node>>,
    /// First time this node is seen.
    pub is_new: bool,
    /// The node was known and offline.
    pub reconnected: bool,
    /// Services must be re-registered.
    pub changed: bool,
}

/// All known nodes, keyed by id. Exactly one of them is local.
#[derive(Debug)]
pub struct NodeCatalog {
    local_id: NodeId,
    nodes: RefCell<HashMap<NodeId, Rc<RefCell<Node>>>>,
}

impl NodeCatalog {
    /// Create a catalog holding only the local node.
    pub fn new(local: Rc<RefCell<Node>>) -> Self {
        let local_id = local.borrow().id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(local_id.clone(), local);
        Self {
            local_id,
            nodes: RefCell::new(nodes),
        }
    }

    /// The local node.
    pub fn local_node(&self) -> Option<Rc<RefCell<Node>>> {
        self.get(&self.local_id)
    }

    pub(crate) fn add(&self, node: Node) -> Rc<RefCell<Node>> {
        let handle = Rc::new(RefCell::new(node));
        let id = handle.borrow().id.clone();
        self.nodes.borrow_mut().insert(id, handle.clone());
        handle
    }

    /// Whether `id` is known.
    pub fn has(&self, id: &str) -> bool {
        self.nodes.borrow().contains_key(id)
    }

    /// Catalog entry for `id`.
    pub fn get(&self, id: &str) -> Option<Rc<RefCell<Node>>> {
        self.nodes.borrow().get(id).cloned()
    }

    pub(crate) fn delete(&self, id: &str) -> Option<Rc<RefCell<Node>>> {
        if id == self.local_id {
            return None;
        }
        self.nodes.borrow_mut().remove(id)
    }

    /// Upsert a node from an INFO payload.
    pub(crate) fn process_node_info(&self, payload: &InfoPayload, now: Duration) -> NodeInfoUpdate {
        let (node, is_new) = match self.get(&payload.sender) {
            Some(node) => (node, false),
            None => (self.add(Node::new(payload.sender.clone())), true),
        };

        let reconnected = {
            let mut n = node.borrow_mut();
            let was_offline = !is_new && !n.available;
            if was_offline {
                n.available = true;
                n.offline_since = None;
            }
            was_offline
        };

        let changed = node.borrow_mut().update(payload, reconnected, now) || is_new;
        NodeInfoUpdate {
            node,
            is_new,
            reconnected,
            changed,
        }
    }

    /// Mark `id` offline. Returns the node if it was online.
    pub(crate) fn disconnected(&self, id: &str, now: Duration) -> Option<Rc<RefCell<Node>>> {
        let node = self.get(id)?;
        {
            let mut n = node.borrow_mut();
            if n.local || !n.available {
                return None;
            }
            n.disconnected(now);
        }
        Some(node)
    }

    /// Snapshot of nodes matching `options`.
    pub fn list(&self, options: ListOptions) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .borrow()
            .values()
            .filter(|n| !options.only_available || n.borrow().available)
            .map(|n| {
                let mut node = n.borrow().clone();
                if !options.with_services {
                    node.services.clear();
                }
                node
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Snapshot of every node with its services.
    pub fn to_array(&self) -> Vec<Node> {
        self.list(ListOptions {
            only_available: false,
            with_services: true,
        })
    }

    /// Ids of remote nodes, optionally only online ones.
    pub fn remote_ids(&self, only_available: bool) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .borrow()
            .values()
            .filter(|n| {
                let n = n.borrow();
                !n.local && (!only_available || n.available)
            })
            .map(|n| n.borrow().id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Online remote nodes whose last heartbeat is older than `timeout`.
    pub fn stale(&self, now: Duration, timeout: Duration) -> Vec<NodeId> {
        self.nodes
            .borrow()
            .values()
            .filter(|n| {
                let n = n.borrow();
                !n.local && n.available && now.saturating_sub(n.last_heartbeat_time) > timeout
            })
            .map(|n| n.borrow().id.clone())
            .collect()
    }

    /// Offline nodes that have been offline longer than `timeout`.
    pub fn expired(&self, now: Duration, timeout: Duration) -> Vec<NodeId> {
        self.nodes
            .borrow()
            .values()
            .filter(|n| {
                let n = n.borrow();
                n.offline_since
                    .is_some_and(|since| !n.available && now.saturating_sub(since) > timeout)
            })
            .map(|n| n.borrow().id.clone())
            .collect()
    }

    /// Number of known nodes, local included.
    pub fn count(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Number of online nodes, local included.
    pub fn online_count(&self) -> usize {
        self.nodes
            .borrow()
            .values()
            .filter(|n| n.borrow().available)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ClientInfo, Meta, PROTOCOL_VERSION};

    fn info(sender: &str, seq: u64) -> InfoPayload {
        InfoPayload {
            ver: PROTOCOL_VERSION.to_string(),
            sender: sender.into(),
            services: vec![],
            ip_list: vec![],
            hostname: String::new(),
            seq,
            instance_id: "i1".into(),
            metadata: Meta::new(),
            client: ClientInfo::default(),
        }
    }

    fn catalog() -> NodeCatalog {
        NodeCatalog::new(Rc::new(RefCell::new(Node::new_local("self", "local-instance"))))
    }

    #[test]
    fn test_new_then_routine_update() {
        let catalog = catalog();
        let first = catalog.process_node_info(&info("b", 1), Duration::ZERO);
        assert!(first.is_new && first.changed && !first.reconnected);

        let same = catalog.process_node_info(&info("b", 1), Duration::ZERO);
        assert!(!same.is_new && !same.changed);

        let newer = catalog.process_node_info(&info("b", 2), Duration::ZERO);
        assert!(newer.changed);
        assert_eq!(catalog.count(), 2);
    }

    #[test]
    fn test_reconnect_clears_offline_since() {
        let catalog = catalog();
        catalog.process_node_info(&info("b", 1), Duration::ZERO);
        assert!(catalog.disconnected("b", Duration::from_secs(5)).is_some());
        assert!(catalog.disconnected("b", Duration::from_secs(6)).is_none());
        assert_eq!(catalog.online_count(), 1);

        let update = catalog.process_node_info(&info("b", 1), Duration::from_secs(7));
        assert!(update.reconnected && update.changed);
        let node = catalog.get("b").expect("node");
        assert!(node.borrow().available);
        assert_eq!(node.borrow().offline_since, None);
    }

    #[test]
    fn test_local_node_cannot_be_disconnected_or_deleted() {
        let catalog = catalog();
        assert!(catalog.disconnected("self", Duration::ZERO).is_none());
        assert!(catalog.delete("self").is_none());
        assert!(catalog.local_node().is_some());
    }

    #[test]
    fn test_stale_and_expired() {
        let catalog = catalog();
        catalog.process_node_info(&info("b", 1), Duration::from_secs(0));
        catalog.process_node_info(&info("c", 1), Duration::from_secs(20));

        let stale = catalog.stale(Duration::from_secs(35), Duration::from_secs(30));
        assert_eq!(stale, vec!["b".to_string()]);

        catalog.disconnected("b", Duration::from_secs(35));
        assert!(catalog.expired(Duration::from_secs(100), Duration::from_secs(600)).is_empty());
        assert_eq!(
            catalog.expired(Duration::from_secs(700), Duration::from_secs(600)),
            vec!["b".to_string()]
        );
    }

    #[test]
    fn test_list_options() {
        let catalog = catalog();
        catalog.process_node_info(&info("b", 1), Duration::ZERO);
        catalog.disconnected("b", Duration::ZERO);
        assert_eq!(catalog.list(ListOptions::default()).len(), 2);
        let online = catalog.list(ListOptions {
            only_available: true,
            with_services: false,
        });
        assert_eq!(online.len(), 1);
        assert!(online[0].local);
        assert_eq!(catalog.remote_ids(false), vec!["b".to_string()]);
        assert!(catalog.remote_ids(true).is_empty());
    }
}
