// src/load_balancer/random.rs
use crate::load_balancer::BackendSelector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Uniform random choice; the request counter is ignored.
#[derive(Debug, Default)]
pub struct RandomSelector {
    seeded: Option<Mutex<StdRng>>,
}

impl RandomSelector {
    pub fn new() -> Self {
        Self { seeded: None }
    }

    /// Deterministic sequence, for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seeded: Some(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl BackendSelector for RandomSelector {
    fn select(&self, _request_counter: usize, backend_count: usize) -> usize {
        match &self.seeded {
            Some(rng) => match rng.lock() {
                Ok(mut rng) => rng.gen_range(0..backend_count),
                Err(poisoned) => poisoned.into_inner().gen_range(0..backend_count),
            },
            None => rand::thread_rng().gen_range(0..backend_count),
        }
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
