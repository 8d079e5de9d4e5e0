use std::rc::Rc;
use std::time::Duration;

use rand::prelude::IndexedRandom;

use super::Strategy;
use crate::context::Context;
use crate::registry::Endpoint;

/// Latency strategy options.
#[derive(Debug, Clone)]
pub struct LatencyOptions {
    /// Number of random candidates compared per selection.
    pub sample_count: usize,
    /// A candidate faster than this is taken immediately.
    pub low_latency: Duration,
}

impl Default for LatencyOptions {
    fn default() -> Self {
        Self {
            sample_count: 5,
            low_latency: Duration::from_millis(10),
        }
    }
}

/// Power-of-k choice over measured PING round-trip times.
///
/// Samples are recorded on the node by the transit when PONGs arrive; nodes
/// never pinged are only chosen when no candidate has a sample.
#[derive(Debug, Clone, Default)]
pub struct LatencyStrategy {
    options: LatencyOptions,
}

impl LatencyStrategy {
    /// Create the strategy.
    pub fn new(options: LatencyOptions) -> Self {
        Self { options }
    }
}

impl Strategy for LatencyStrategy {
    fn select(&self, endpoints: &[Rc<Endpoint>], _ctx: &Context) -> Option<Rc<Endpoint>> {
        let mut rng = rand::rng();
        let count = match self.options.sample_count {
            0 => endpoints.len(),
            n => n.min(endpoints.len()),
        };
        let low_ms = self.options.low_latency.as_secs_f64() * 1000.0;

        let mut best: Option<(f64, &Rc<Endpoint>)> = None;
        for endpoint in endpoints.choose_multiple(&mut rng, count) {
            let Some(latency) = endpoint.node().avg_latency_ms() else {
                continue;
            };
            if latency < low_ms {
                return Some(endpoint.clone());
            }
            if best.map_or(true, |(fastest, _)| latency < fastest) {
                best = Some((latency, endpoint));
            }
        }

        match best {
            Some((_, endpoint)) => Some(endpoint.clone()),
            None => endpoints.choose(&mut rng).cloned(),
        }
    }
}
