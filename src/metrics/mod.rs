// src/metrics/mod.rs
mod collector;
mod stats;

pub use collector::{MetricsCollector, MetricsRegistry, Timer};
pub use stats::{spawn_flush, RouteStatistics, StatsRegistry};
