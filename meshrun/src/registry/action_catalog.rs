//! Action name -> endpoint list.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::bus::LocalBus;
use crate::service::ActionDefinition;
use crate::strategy::{build_strategy, StrategyKind, StrategyOptions};

use super::endpoint::{Endpoint, EndpointKind, EndpointList};
use super::node::Node;

/// Summary of one registered action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSummary {
    /// Action name.
    pub name: String,
    /// Number of endpoints.
    pub endpoints: usize,
    /// Number of available endpoints.
    pub available: usize,
    /// Whether this process serves the action.
    pub has_local: bool,
}

/// Every action in the cluster.
#[derive(Debug)]
pub struct ActionCatalog {
    lists: RefCell<HashMap<String, Rc<EndpointList>>>,
    default_strategy: StrategyKind,
    options: StrategyOptions,
    bus: LocalBus,
}

impl ActionCatalog {
    /// Create an empty catalog.
    pub fn new(default_strategy: StrategyKind, options: StrategyOptions, bus: LocalBus) -> Self {
        Self {
            lists: RefCell::new(HashMap::new()),
            default_strategy,
            options,
            bus,
        }
    }

    /// Register `action` on `node`, reusing the list and endpoint when present.
    pub(crate) fn add(&self, node: &Rc<RefCell<Node>>, action: ActionDefinition) -> Rc<Endpoint> {
        let name = action.descriptor.name.clone();
        let list = {
            let mut lists = self.lists.borrow_mut();
            lists
                .entry(name.clone())
                .or_insert_with(|| {
                    let kind = action.descriptor.strategy.unwrap_or(self.default_strategy);
                    Rc::new(EndpointList::new(
                        name,
                        None,
                        build_strategy(kind, &self.options, &self.bus),
                    ))
                })
                .clone()
        };
        list.add(node, EndpointKind::Action(Rc::new(action)))
    }

    /// Endpoint list for `name`.
    pub fn get(&self, name: &str) -> Option<Rc<EndpointList>> {
        self.lists.borrow().get(name).cloned()
    }

    /// Whether `name` has at least one endpoint.
    pub fn has(&self, name: &str) -> bool {
        self.lists.borrow().contains_key(name)
    }

    /// Remove every endpoint of `node_id` whose action is not in `keep`.
    pub(crate) fn retain_for_node(&self, node_id: &str, keep: &HashSet<String>) {
        let mut lists = self.lists.borrow_mut();
        for (name, list) in lists.iter() {
            if !keep.contains(name) {
                list.remove_by_node(node_id);
            }
        }
        lists.retain(|_, list| !list.is_empty());
    }

    /// Remove every endpoint of `node_id`.
    pub(crate) fn remove_by_node(&self, node_id: &str) {
        self.retain_for_node(node_id, &HashSet::new());
    }

    /// Snapshot summaries, sorted by name.
    pub fn list(&self, only_local: bool, only_available: bool) -> Vec<ActionSummary> {
        let mut out: Vec<ActionSummary> = self
            .lists
            .borrow()
            .values()
            .map(|list| ActionSummary {
                name: list.name().to_string(),
                endpoints: list.len(),
                available: list.available().len(),
                has_local: list.local_endpoint().is_some(),
            })
            .filter(|s| (!only_local || s.has_local) && (!only_available || s.available > 0))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Number of action names.
    pub fn count(&self) -> usize {
        self.lists.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ActionDescriptor;
    use crate::registry::endpoint::tests::node;

    fn def(name: &str) -> ActionDefinition {
        ActionDefinition {
            descriptor: ActionDescriptor::new(name),
            service: "math".into(),
            handler: None,
        }
    }

    fn catalog() -> ActionCatalog {
        ActionCatalog::new(StrategyKind::RoundRobin, StrategyOptions::default(), LocalBus::new())
    }

    #[test]
    fn test_one_endpoint_per_node_and_name() {
        let catalog = catalog();
        let a = node("a", false);
        catalog.add(&a, def("math.add"));
        catalog.add(&a, def("math.add"));
        catalog.add(&node("b", false), def("math.add"));
        let list = catalog.get("math.add").expect("list");
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_remove_by_node_prunes_only_empty_lists() {
        let catalog = catalog();
        catalog.add(&node("a", false), def("math.add"));
        catalog.add(&node("b", false), def("math.add"));
        catalog.add(&node("a", false), def("math.sub"));

        catalog.remove_by_node("a");
        assert!(catalog.has("math.add"));
        assert!(!catalog.has("math.sub"));
        assert_eq!(catalog.count(), 1);
    }

    #[test]
    fn test_list_summaries() {
        let catalog = catalog();
        catalog.add(&node("self", true), def("math.add"));
        catalog.add(&node("b", false), def("math.sub"));
        let local = catalog.list(true, false);
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].name, "math.add");
        assert_eq!(catalog.list(false, true).len(), 2);
    }
}
