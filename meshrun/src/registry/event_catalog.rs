//! Event subscriptions, keyed by (pattern, group).
//!
//! Subscriptions may use wildcards:
//!
//! ```text
//! user.created   exact
//! user.*         one segment:   user.created, not user.profile.updated
//! user.**        any suffix:    user.created, user.profile.updated
//! user.?reated   one character, never a dot
//! ```

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::bus::LocalBus;
use crate::context::Context;
use crate::service::EventDefinition;
use crate::strategy::{build_strategy, StrategyKind, StrategyOptions};

use super::endpoint::{Endpoint, EndpointKind, EndpointList};
use super::node::Node;

/// Whether `event` matches the subscription `pattern`.
pub fn match_event(event: &str, pattern: &str) -> bool {
    if !pattern.contains(|c| c == '*' || c == '?') {
        return event == pattern;
    }
    match_bytes(event.as_bytes(), pattern.as_bytes())
}

fn match_bytes(text: &[u8], pattern: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') if pattern.get(1) == Some(&b'*') => {
            let rest = &pattern[2..];
            (0..=text.len()).any(|i| match_bytes(&text[i..], rest))
        }
        Some(b'*') => {
            let rest = &pattern[1..];
            for i in 0..=text.len() {
                if match_bytes(&text[i..], rest) {
                    return true;
                }
                if text.get(i) == Some(&b'.') {
                    return false;
                }
            }
            false
        }
        Some(b'?') => {
            matches!(text.first(), Some(c) if *c != b'.') && match_bytes(&text[1..], &pattern[1..])
        }
        Some(c) => text.first() == Some(c) && match_bytes(&text[1..], &pattern[1..]),
    }
}

fn group_selected(groups: Option<&[String]>, group: &str) -> bool {
    groups.map_or(true, |gs| gs.iter().any(|g| g == group))
}

/// Every event subscription in the cluster.
#[derive(Debug)]
pub struct EventCatalog {
    lists: RefCell<Vec<Rc<EndpointList>>>,
    default_strategy: StrategyKind,
    options: StrategyOptions,
    bus: LocalBus,
}

impl EventCatalog {
    /// Create an empty catalog.
    pub fn new(default_strategy: StrategyKind, options: StrategyOptions, bus: LocalBus) -> Self {
        Self {
            lists: RefCell::new(Vec::new()),
            default_strategy,
            options,
            bus,
        }
    }

    fn list_for(&self, name: &str, group: &str) -> Option<Rc<EndpointList>> {
        self.lists
            .borrow()
            .iter()
            .find(|l| l.name() == name && l.group() == Some(group))
            .cloned()
    }

    /// Register `event` on `node`.
    pub(crate) fn add(&self, node: &Rc<RefCell<Node>>, event: EventDefinition) -> Rc<Endpoint> {
        let name = event.descriptor.name.clone();
        let group = event.group.clone();
        let list = match self.list_for(&name, &group) {
            Some(list) => list,
            None => {
                let list = Rc::new(EndpointList::new(
                    name,
                    Some(group),
                    build_strategy(self.default_strategy, &self.options, &self.bus),
                ));
                self.lists.borrow_mut().push(list.clone());
                list
            }
        };
        list.add(node, EndpointKind::Event(Rc::new(event)))
    }

    /// Remove every subscription of `node_id` whose (pattern, group) is not in `keep`.
    pub(crate) fn retain_for_node(&self, node_id: &str, keep: &HashSet<(String, String)>) {
        let mut lists = self.lists.borrow_mut();
        for list in lists.iter() {
            let key = (
                list.name().to_string(),
                list.group().unwrap_or_default().to_string(),
            );
            if !keep.contains(&key) {
                list.remove_by_node(node_id);
            }
        }
        lists.retain(|list| !list.is_empty());
    }

    /// Remove every subscription of `node_id`.
    pub(crate) fn remove_by_node(&self, node_id: &str) {
        self.retain_for_node(node_id, &HashSet::new());
    }

    fn matching(&self, event: &str, groups: Option<&[String]>) -> Vec<Rc<EndpointList>> {
        self.lists
            .borrow()
            .iter()
            .filter(|l| match_event(event, l.name()))
            .filter(|l| group_selected(groups, l.group().unwrap_or_default()))
            .cloned()
            .collect()
    }

    /// Consumer groups subscribed to `event`.
    pub fn groups(&self, event: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .matching(event, None)
            .iter()
            .filter_map(|l| l.group().map(str::to_string))
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    /// One endpoint per consumer group, chosen by each list's strategy.
    ///
    /// When several patterns of the same group match, the group still gets a
    /// single delivery.
    pub fn balanced_endpoints(
        &self,
        event: &str,
        groups: Option<&[String]>,
        ctx: &Context,
        prefer_local: bool,
    ) -> Vec<(Rc<Endpoint>, String)> {
        let mut served = HashSet::new();
        let mut out = Vec::new();
        for list in self.matching(event, groups) {
            let group = list.group().unwrap_or_default().to_string();
            if served.contains(&group) {
                continue;
            }
            if let Some(endpoint) = list.select(ctx, prefer_local) {
                served.insert(group.clone());
                out.push((endpoint, group));
            }
        }
        out
    }

    /// Every available endpoint subscribed to `event`, one per node.
    pub fn all_endpoints(&self, event: &str, groups: Option<&[String]>) -> Vec<Rc<Endpoint>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for list in self.matching(event, groups) {
            for endpoint in list.available() {
                if seen.insert(endpoint.id.clone()) {
                    out.push(endpoint);
                }
            }
        }
        out
    }

    /// Local subscriptions matching `event` in `groups` (every group when `None`).
    pub fn local_handlers(&self, event: &str, groups: Option<&[String]>) -> Vec<Rc<EventDefinition>> {
        self.matching(event, groups)
            .iter()
            .filter_map(|list| list.local_endpoint())
            .filter_map(|ep| ep.event())
            .filter(|def| def.handler.is_some())
            .collect()
    }

    /// Number of (pattern, group) subscriptions.
    pub fn count(&self) -> usize {
        self.lists.borrow().len()
    }
}
