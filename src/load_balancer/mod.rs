mod algorithm;
mod random;
mod round_robin;
mod rule;

pub use algorithm::{BackendSelector, Strategy};
pub use random::RandomSelector;
pub use round_robin::RoundRobinSelector;
pub use rule::{LoadBalancerRule, MAX_BACKENDS};

use std::sync::Arc;

pub fn create_selector(strategy: Strategy) -> Arc<dyn BackendSelector> {
    match strategy {
        Strategy::RoundRobin => Arc::new(RoundRobinSelector::new()),
        Strategy::Random => Arc::new(RandomSelector::new()),
    }
}
