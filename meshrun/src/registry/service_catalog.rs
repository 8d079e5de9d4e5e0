//! Services as seen per node.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use crate::packet::{ActionDescriptor, EventDescriptor, Meta, ServiceDescriptor};

use super::NodeId;

/// One service hosted by one node.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceItem {
    /// Service name.
    pub name: String,
    /// Name with version prefix.
    pub full_name: String,
    /// Optional version.
    pub version: Option<String>,
    /// Settings.
    pub settings: Meta,
    /// Metadata.
    pub metadata: Meta,
    /// Actions keyed by fully qualified name.
    pub actions: HashMap<String, ActionDescriptor>,
    /// Events keyed by name.
    pub events: HashMap<String, EventDescriptor>,
    /// Hosting node.
    pub node_id: NodeId,
    /// True when hosted by this process.
    pub local: bool,
}

impl ServiceItem {
    fn from_descriptor(node_id: &str, descriptor: &ServiceDescriptor, local: bool) -> Self {
        Self {
            name: descriptor.name.clone(),
            full_name: descriptor.full_name.clone(),
            version: descriptor.version.clone(),
            settings: descriptor.settings.clone(),
            metadata: descriptor.metadata.clone(),
            actions: descriptor.actions.clone(),
            events: descriptor.events.clone(),
            node_id: node_id.to_string(),
            local,
        }
    }
}

/// Every (service, node) pair in the cluster.
#[derive(Debug, Default)]
pub struct ServiceCatalog {
    services: RefCell<Vec<ServiceItem>>,
}

impl ServiceCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a service for `node_id`.
    pub(crate) fn register(&self, node_id: &str, descriptor: &ServiceDescriptor, local: bool) {
        let item = ServiceItem::from_descriptor(node_id, descriptor, local);
        let mut services = self.services.borrow_mut();
        match services
            .iter_mut()
            .find(|s| s.node_id == node_id && s.full_name == item.full_name)
        {
            Some(existing) => *existing = item,
            None => services.push(item),
        }
    }

    /// Drop the services of `node_id` whose full name is not in `keep`.
    pub(crate) fn retain_for_node(&self, node_id: &str, keep: &HashSet<String>) {
        self.services
            .borrow_mut()
            .retain(|s| s.node_id != node_id || keep.contains(&s.full_name));
    }

    /// Drop every service of `node_id`.
    pub(crate) fn remove_by_node(&self, node_id: &str) {
        self.services.borrow_mut().retain(|s| s.node_id != node_id);
    }

    /// Whether `node_id` hosts `full_name` (any node when `None`).
    pub fn has(&self, full_name: &str, node_id: Option<&str>) -> bool {
        self.services
            .borrow()
            .iter()
            .any(|s| s.full_name == full_name && node_id.map_or(true, |id| s.node_id == id))
    }

    /// Snapshot of the services, optionally only local ones.
    pub fn list(&self, only_local: bool) -> Vec<ServiceItem> {
        self.services
            .borrow()
            .iter()
            .filter(|s| !only_local || s.local)
            .cloned()
            .collect()
    }

    /// Number of distinct service full names.
    pub fn count(&self) -> usize {
        self.services
            .borrow()
            .iter()
            .map(|s| s.full_name.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.into(),
            version: None,
            full_name: name.into(),
            settings: Meta::new(),
            metadata: Meta::new(),
            actions: HashMap::new(),
            events: HashMap::new(),
        }
    }

    #[test]
    fn test_register_is_idempotent_per_node() {
        let catalog = ServiceCatalog::new();
        catalog.register("a", &descriptor("math"), false);
        catalog.register("a", &descriptor("math"), false);
        catalog.register("b", &descriptor("math"), false);
        assert_eq!(catalog.list(false).len(), 2);
        assert_eq!(catalog.count(), 1);
        assert!(catalog.has("math", Some("b")));
        assert!(!catalog.has("math", Some("c")));
    }

    #[test]
    fn test_retain_and_remove_by_node() {
        let catalog = ServiceCatalog::new();
        catalog.register("a", &descriptor("math"), false);
        catalog.register("a", &descriptor("users"), false);
        catalog.register("b", &descriptor("users"), false);
        catalog.retain_for_node("a", &HashSet::from(["users".to_string()]));
        assert!(!catalog.has("math", None));
        catalog.remove_by_node("a");
        assert!(!catalog.has("users", Some("a")));
        assert!(catalog.has("users", Some("b")));
    }
}
