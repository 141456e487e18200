// src/load_balancer/algorithm.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// Picks which backend serves the current request.
pub trait BackendSelector: Send + Sync {
    /// `request_counter` is the balancer's count before this request;
    /// the result is an index in `0..backend_count`.
    fn select(&self, request_counter: usize, backend_count: usize) -> usize;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
}

impl Strategy {
    /// Resolves a configured strategy name. Unknown and empty names fall
    /// back to round-robin.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "roundrobin" | "round-robin" | "round_robin" | "rr" => Strategy::RoundRobin,
            "random" | "rand" => Strategy::Random,
            other => {
                tracing::warn!(
                    "Unknown load balancing strategy {:?}, falling back to round robin",
                    other
                );
                Strategy::RoundRobin
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::Random => "random",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
