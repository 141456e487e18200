// src/load_balancer/round_robin.rs
use crate::load_balancer::BackendSelector;

#[derive(Debug, Default)]
pub struct RoundRobinSelector;

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self
    }
}

impl BackendSelector for RoundRobinSelector {
    fn select(&self, request_counter: usize, backend_count: usize) -> usize {
        request_counter % backend_count
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_through_backends_in_order() {
        let selector = RoundRobinSelector::new();
        let picks: Vec<usize> = (0..9).map(|counter| selector.select(counter, 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }
}
