//! Endpoint selection strategies.
//!
//! A strategy picks one endpoint out of the *available* endpoints of a list
//! (circuit breaker closed and node online). The [`EndpointList`] does the
//! filtering; strategies only rank what they are given.
//!
//! ```text
//! RoundRobin   per-list rotating index
//! Random       uniform pick
//! CpuUsage     power-of-k over self-reported CPU
//! Latency      power-of-k over measured round-trip time
//! Shard        consistent hashing of a key from params/meta
//! ```
//!
//! [`EndpointList`]: crate::registry::EndpointList

mod cpu_usage;
mod latency;
mod random;
mod round_robin;
mod shard;

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::bus::LocalBus;
use crate::context::Context;
use crate::registry::Endpoint;

pub use cpu_usage::{CpuUsageOptions, CpuUsageStrategy};
pub use latency::{LatencyOptions, LatencyStrategy};
pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;
pub use shard::{shard_hash, ShardKey, ShardOptions, ShardStrategy};

/// Selection algorithm over a snapshot of available endpoints.
pub trait Strategy: fmt::Debug {
    /// Pick one of `endpoints`, or `None` to report "no endpoint".
    ///
    /// `endpoints` is never empty when called by an endpoint list.
    fn select(&self, endpoints: &[Rc<Endpoint>], ctx: &Context) -> Option<Rc<Endpoint>>;
}

/// Strategy names, as configured and as advertised by actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyKind {
    /// Rotate through endpoints.
    #[default]
    RoundRobin,
    /// Uniform random pick.
    Random,
    /// Prefer lightly loaded nodes.
    CpuUsage,
    /// Prefer nodes with low round-trip time.
    Latency,
    /// Consistent hashing.
    Shard,
}

/// Options for every strategy kind; each strategy reads its own part.
#[derive(Debug, Clone, Default)]
pub struct StrategyOptions {
    /// Shard strategy options.
    pub shard: ShardOptions,
    /// CPU usage strategy options.
    pub cpu_usage: CpuUsageOptions,
    /// Latency strategy options.
    pub latency: LatencyOptions,
}

/// Build a fresh strategy instance for one endpoint list.
pub fn build_strategy(
    kind: StrategyKind,
    options: &StrategyOptions,
    bus: &LocalBus,
) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::RoundRobin => Box::new(RoundRobinStrategy::new()),
        StrategyKind::Random => Box::new(RandomStrategy),
        StrategyKind::CpuUsage => Box::new(CpuUsageStrategy::new(options.cpu_usage.clone())),
        StrategyKind::Latency => Box::new(LatencyStrategy::new(options.latency.clone())),
        StrategyKind::Shard => Box::new(ShardStrategy::new(options.shard.clone(), bus.subscribe())),
    }
}
