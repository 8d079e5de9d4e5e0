use std::rc::Rc;

use rand::prelude::IndexedRandom;

use super::Strategy;
use crate::context::Context;
use crate::registry::Endpoint;

/// Uniform random pick.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomStrategy;

impl Strategy for RandomStrategy {
    fn select(&self, endpoints: &[Rc<Endpoint>], _ctx: &Context) -> Option<Rc<Endpoint>> {
        endpoints.choose(&mut rand::rng()).cloned()
    }
}
