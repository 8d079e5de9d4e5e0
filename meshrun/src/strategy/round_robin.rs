use std::cell::Cell;
use std::rc::Rc;

use super::Strategy;
use crate::context::Context;
use crate::registry::Endpoint;

/// Cycles through the endpoints in list order.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: Cell<usize>,
}

impl RoundRobinStrategy {
    /// Start at the first endpoint.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobinStrategy {
    fn select(&self, endpoints: &[Rc<Endpoint>], _ctx: &Context) -> Option<Rc<Endpoint>> {
        if endpoints.is_empty() {
            return None;
        }
        // The list may have shrunk since the last call.
        let mut index = self.counter.get();
        if index >= endpoints.len() {
            index = 0;
        }
        self.counter.set(index + 1);
        endpoints.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::endpoint::tests::{action, node};

    #[test]
    fn test_rotation_order_over_three_endpoints() {
        let endpoints: Vec<_> = ["n0", "n1", "n2"]
            .iter()
            .map(|id| Rc::new(Endpoint::new(node(id, false), action("math.add"))))
            .collect();
        let strategy = RoundRobinStrategy::new();
        let ctx = Context::default();

        let order: Vec<String> = (0..7)
            .filter_map(|_| strategy.select(&endpoints, &ctx))
            .map(|ep| ep.id.clone())
            .collect();
        assert_eq!(order, vec!["n0", "n1", "n2", "n0", "n1", "n2", "n0"]);
    }

    #[test]
    fn test_shrinking_list_restarts_rotation() {
        let endpoints: Vec<_> = ["n0", "n1", "n2"]
            .iter()
            .map(|id| Rc::new(Endpoint::new(node(id, false), action("a"))))
            .collect();
        let strategy = RoundRobinStrategy::new();
        let ctx = Context::default();
        strategy.select(&endpoints, &ctx);
        strategy.select(&endpoints, &ctx);
        let picked = strategy.select(&endpoints[..2], &ctx).map(|ep| ep.id.clone());
        assert_eq!(picked.as_deref(), Some("n0"));
    }
}
