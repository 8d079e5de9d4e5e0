//! Consistent-hash (shard) strategy.
//!
//! ```text
//!   ring (sorted by hash)            key "user-42"
//!   ┌──────┬──────┬──────┬──────┐    md5 -> 0x5a1c..
//!   │ 0x12 │ 0x4f │ 0x7e │ 0xc3 │    first slot >= hash: 0x7e
//!   │  b   │  a   │  c   │  a   │    -> node c
//!   └──────┴──────┴──────┴──────┘    (past the end: last slot)
//! ```
//!
//! The ring is rebuilt lazily: node topology notifications only mark it
//! dirty, and the next selection (on the same task) rebuilds it from the
//! endpoints it is handed.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::num::NonZeroUsize;
use std::rc::Rc;

use lru::LruCache;
use rand::prelude::IndexedRandom;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::TryRecvError};

use super::Strategy;
use crate::bus::LocalEvent;
use crate::context::Context;
use crate::registry::{Endpoint, NodeId};

const DEFAULT_CACHE_SIZE: usize = 1000;

/// Where the shard key comes from.
#[derive(Clone)]
pub enum ShardKey {
    /// Dotted path in the call params.
    Param(String),
    /// Dotted path in the call metadata.
    Meta(String),
    /// Custom extractor.
    Custom(Rc<dyn Fn(&Context) -> Option<String>>),
}

impl ShardKey {
    /// Parse a configured key: `#path` reads metadata, anything else params.
    pub fn parse(key: &str) -> Self {
        match key.strip_prefix('#') {
            Some(path) => ShardKey::Meta(path.to_string()),
            None => ShardKey::Param(key.to_string()),
        }
    }

    fn extract(&self, ctx: &Context) -> Option<String> {
        let value = match self {
            ShardKey::Param(path) => ctx.param(path),
            ShardKey::Meta(path) => ctx.meta_value(path),
            ShardKey::Custom(extract) => return extract(ctx),
        }?;
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Debug for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Param(path) => f.debug_tuple("Param").field(path).finish(),
            ShardKey::Meta(path) => f.debug_tuple("Meta").field(path).finish(),
            ShardKey::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Shard strategy options.
#[derive(Debug, Clone)]
pub struct ShardOptions {
    /// Key extractor; without one every call falls back to a random pick.
    pub key: Option<ShardKey>,
    /// Virtual ring positions per node.
    pub vnodes: u32,
    /// Ring size; hashes are reduced modulo this when set.
    pub ring_size: Option<u32>,
    /// Capacity of the key -> node cache.
    pub cache_size: usize,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            key: None,
            vnodes: 10,
            ring_size: None,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

impl ShardOptions {
    /// Set the key extractor.
    pub fn with_key(mut self, key: ShardKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Set the number of virtual nodes.
    pub fn with_vnodes(mut self, vnodes: u32) -> Self {
        self.vnodes = vnodes;
        self
    }
}

/// Hash of a key: the first 32 bits of its MD5 digest, optionally reduced
/// modulo `ring_size`.
pub fn shard_hash(key: &str, ring_size: Option<u32>) -> u32 {
    let digest = md5::compute(key.as_bytes());
    let hash = u32::from_be_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]]);
    match ring_size {
        Some(size) if size > 0 => hash % size,
        _ => hash,
    }
}

/// Consistent-hashing strategy.
pub struct ShardStrategy {
    options: ShardOptions,
    ring: RefCell<Vec<(u32, NodeId)>>,
    cache: RefCell<LruCache<String, NodeId>>,
    topology: RefCell<broadcast::Receiver<LocalEvent>>,
    need_rebuild: Cell<bool>,
}

impl ShardStrategy {
    /// Create the strategy; `topology` feeds ring invalidation.
    pub fn new(options: ShardOptions, topology: broadcast::Receiver<LocalEvent>) -> Self {
        let capacity = NonZeroUsize::new(options.cache_size)
            .or(NonZeroUsize::new(DEFAULT_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            options,
            ring: RefCell::new(Vec::new()),
            cache: RefCell::new(LruCache::new(capacity)),
            topology: RefCell::new(topology),
            need_rebuild: Cell::new(true),
        }
    }

    /// Drain pending notifications and mark the ring dirty on topology change.
    fn observe_topology(&self) {
        let mut rx = self.topology.borrow_mut();
        loop {
            match rx.try_recv() {
                Ok(event) if event.is_topology_change() => self.need_rebuild.set(true),
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => self.need_rebuild.set(true),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn rebuild(&self, endpoints: &[Rc<Endpoint>]) {
        let mut ids: Vec<&str> = endpoints.iter().map(|ep| ep.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();

        let mut ring = Vec::with_capacity(ids.len() * self.options.vnodes as usize);
        for id in ids {
            for i in 0..self.options.vnodes {
                let hash = shard_hash(&format!("{}{}", id, i), self.options.ring_size);
                ring.push((hash, id.to_string()));
            }
        }
        ring.sort();

        tracing::debug!(positions = ring.len(), "shard ring rebuilt");
        *self.ring.borrow_mut() = ring;
        self.cache.borrow_mut().clear();
        self.need_rebuild.set(false);
    }

    fn node_for_key(&self, key: &str) -> Option<NodeId> {
        if let Some(node_id) = self.cache.borrow_mut().get(key) {
            return Some(node_id.clone());
        }
        let hash = shard_hash(key, self.options.ring_size);
        let ring = self.ring.borrow();
        let slot = ring
            .iter()
            .find(|(position, _)| *position >= hash)
            .or_else(|| ring.last())?;
        let node_id = slot.1.clone();
        self.cache.borrow_mut().put(key.to_string(), node_id.clone());
        Some(node_id)
    }
}

impl Strategy for ShardStrategy {
    fn select(&self, endpoints: &[Rc<Endpoint>], ctx: &Context) -> Option<Rc<Endpoint>> {
        let key = self.options.key.as_ref().and_then(|k| k.extract(ctx));
        let Some(key) = key else {
            return endpoints.choose(&mut rand::rng()).cloned();
        };

        self.observe_topology();
        if self.need_rebuild.get() {
            self.rebuild(endpoints);
        }

        let owner = self
            .node_for_key(&key)
            .and_then(|node_id| endpoints.iter().find(|ep| ep.id == node_id).cloned());
        match owner {
            Some(endpoint) => Some(endpoint),
            None => {
                tracing::trace!(key = %key, "shard owner unavailable, picking randomly");
                endpoints.choose(&mut rand::rng()).cloned()
            }
        }
    }
}

impl fmt::Debug for ShardStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardStrategy")
            .field("options", &self.options)
            .field("ring_positions", &self.ring.borrow().len())
            .field("need_rebuild", &self.need_rebuild.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::registry::endpoint::tests::{action, node};
    use serde_json::json;

    fn endpoints(ids: &[&str]) -> Vec<Rc<Endpoint>> {
        ids.iter()
            .map(|id| Rc::new(Endpoint::new(node(id, false), action("users.get"))))
            .collect()
    }

    fn ctx_for(user: &str) -> Context {
        Context::for_action("users.get", json!({ "userId": user }))
    }

    fn strategy(bus: &LocalBus) -> ShardStrategy {
        ShardStrategy::new(
            ShardOptions::default().with_key(ShardKey::parse("userId")),
            bus.subscribe(),
        )
    }

    #[test]
    fn test_hash_uses_first_32_bits_of_md5() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(shard_hash("", None), 0xd41d8cd9);
        assert_eq!(shard_hash("", Some(1000)), 0xd41d8cd9 % 1000);
    }

    #[test]
    fn test_same_key_maps_to_same_node() {
        let bus = LocalBus::new();
        let list = endpoints(&["a", "b", "c"]);
        let first = strategy(&bus);
        let second = strategy(&bus);
        for i in 0..50 {
            let ctx = ctx_for(&format!("user-{i}"));
            let x = first.select(&list, &ctx).map(|ep| ep.id.clone());
            let y = first.select(&list, &ctx).map(|ep| ep.id.clone());
            let z = second.select(&list, &ctx).map(|ep| ep.id.clone());
            assert_eq!(x, y);
            assert_eq!(x, z);
        }
    }

    #[test]
    fn test_removing_a_node_only_moves_its_keys() {
        let bus = LocalBus::new();
        let shard = strategy(&bus);
        let full = endpoints(&["a", "b", "c"]);
        let keys: Vec<String> = (0..300).map(|i| format!("user-{i}")).collect();
        let before: Vec<String> = keys
            .iter()
            .filter_map(|k| shard.select(&full, &ctx_for(k)))
            .map(|ep| ep.id.clone())
            .collect();
        assert_eq!(before.len(), keys.len());

        bus.emit(LocalEvent::NodeDisconnected {
            node_id: "c".into(),
            unexpected: true,
        });
        let reduced: Vec<Rc<Endpoint>> = full.iter().filter(|ep| ep.id != "c").cloned().collect();
        for (key, owner) in keys.iter().zip(&before) {
            let after = shard
                .select(&reduced, &ctx_for(key))
                .map(|ep| ep.id.clone())
                .unwrap_or_default();
            if owner != "c" {
                assert_eq!(&after, owner, "key {key} moved off a surviving node");
            } else {
                assert_ne!(after, "c");
            }
        }
    }

    #[test]
    fn test_ring_is_not_rebuilt_without_topology_change() {
        let bus = LocalBus::new();
        let shard = strategy(&bus);
        let full = endpoints(&["a", "b"]);
        shard.select(&full, &ctx_for("k"));
        assert!(!shard.need_rebuild.get());

        bus.emit(LocalEvent::LocalServicesChanged);
        shard.observe_topology();
        assert!(!shard.need_rebuild.get());

        bus.emit(LocalEvent::NodeConnected {
            node_id: "z".into(),
            reconnected: false,
        });
        shard.observe_topology();
        assert!(shard.need_rebuild.get());
    }

    #[test]
    fn test_missing_key_falls_back_to_random() {
        let bus = LocalBus::new();
        let shard = strategy(&bus);
        let list = endpoints(&["a", "b"]);
        let ctx = Context::for_action("users.get", json!({}));
        assert!(shard.select(&list, &ctx).is_some());
    }
}
