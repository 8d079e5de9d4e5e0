use std::rc::Rc;

use rand::prelude::IndexedRandom;

use super::Strategy;
use crate::context::Context;
use crate::registry::Endpoint;

/// CPU usage strategy options.
#[derive(Debug, Clone)]
pub struct CpuUsageOptions {
    /// Number of random candidates compared per selection.
    pub sample_count: usize,
    /// A candidate below this CPU usage is taken immediately.
    pub low_cpu_usage: f64,
}

impl Default for CpuUsageOptions {
    fn default() -> Self {
        Self {
            sample_count: 3,
            low_cpu_usage: 10.0,
        }
    }
}

/// Power-of-k choice over the nodes' recent CPU usage.
///
/// Comparing a small random subset instead of the whole list keeps every
/// caller from piling onto the same idle node between two heartbeats.
#[derive(Debug, Clone, Default)]
pub struct CpuUsageStrategy {
    options: CpuUsageOptions,
}

impl CpuUsageStrategy {
    /// Create the strategy.
    pub fn new(options: CpuUsageOptions) -> Self {
        Self { options }
    }
}

impl Strategy for CpuUsageStrategy {
    fn select(&self, endpoints: &[Rc<Endpoint>], _ctx: &Context) -> Option<Rc<Endpoint>> {
        let mut rng = rand::rng();
        let count = match self.options.sample_count {
            0 => endpoints.len(),
            n => n.min(endpoints.len()),
        };

        let mut best: Option<(f64, &Rc<Endpoint>)> = None;
        for endpoint in endpoints.choose_multiple(&mut rng, count) {
            let Some(cpu) = endpoint.node().avg_cpu() else {
                continue;
            };
            if cpu < self.options.low_cpu_usage {
                return Some(endpoint.clone());
            }
            if best.map_or(true, |(lowest, _)| cpu < lowest) {
                best = Some((cpu, endpoint));
            }
        }

        match best {
            Some((_, endpoint)) => Some(endpoint.clone()),
            None => endpoints.choose(&mut rng).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::HeartbeatPayload;
    use crate::registry::endpoint::tests::{action, node};
    use std::time::Duration;

    fn endpoint_with_cpu(id: &str, cpu: Option<f64>) -> Rc<Endpoint> {
        let n = node(id, false);
        if cpu.is_some() {
            n.borrow_mut()
                .heartbeat(&HeartbeatPayload::new(id, cpu, 1), Duration::ZERO);
        }
        Rc::new(Endpoint::new(n, action("a")))
    }

    #[test]
    fn test_picks_least_loaded_when_sampling_everything() {
        let endpoints = vec![
            endpoint_with_cpu("busy", Some(90.0)),
            endpoint_with_cpu("idle", Some(30.0)),
            endpoint_with_cpu("mid", Some(60.0)),
        ];
        let strategy = CpuUsageStrategy::new(CpuUsageOptions {
            sample_count: 0,
            low_cpu_usage: 10.0,
        });
        let ctx = Context::default();
        for _ in 0..10 {
            assert_eq!(strategy.select(&endpoints, &ctx).map(|ep| ep.id.clone()).as_deref(), Some("idle"));
        }
    }

    #[test]
    fn test_falls_back_to_random_without_samples() {
        let endpoints = vec![endpoint_with_cpu("a", None), endpoint_with_cpu("b", None)];
        let strategy = CpuUsageStrategy::default();
        assert!(strategy.select(&endpoints, &Context::default()).is_some());
    }
}
