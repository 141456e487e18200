// src/metrics/stats.rs
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Default)]
struct RouteCounters {
    requests: AtomicU64,
    no_route: AtomicU64,
}

/// Per-route counters for one window, as drained.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteStatistics {
    pub route: String,
    pub request_count: u64,
    pub no_route_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Best-effort request accounting, drained on a fixed interval.
///
/// Counts racing a drain may land in either window.
pub struct StatsRegistry {
    routes: DashMap<String, Arc<RouteCounters>>,
    window_start: Mutex<DateTime<Utc>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            window_start: Mutex::new(Utc::now()),
        }
    }

    fn counters(&self, route: &str) -> Arc<RouteCounters> {
        if let Some(counters) = self.routes.get(route) {
            return counters.clone();
        }
        self.routes.entry(route.to_string()).or_default().clone()
    }

    pub fn record_request(&self, route: &str) {
        self.counters(route).requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Charged to the root accounting route.
    pub fn record_no_route(&self, root: &str) {
        self.counters(root).no_route.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the counts since the previous drain and resets them.
    pub fn drain(&self) -> Vec<RouteStatistics> {
        let window_end = Utc::now();
        let window_start = match self.window_start.lock() {
            Ok(mut start) => std::mem::replace(&mut *start, window_end),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), window_end),
        };

        let mut stats: Vec<RouteStatistics> = self
            .routes
            .iter()
            .map(|entry| RouteStatistics {
                route: entry.key().clone(),
                request_count: entry.requests.swap(0, Ordering::Relaxed),
                no_route_count: entry.no_route.swap(0, Ordering::Relaxed),
                window_start,
                window_end,
            })
            .collect();
        stats.sort_by(|a, b| a.route.cmp(&b.route));
        stats
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs and resets the statistics every `every` until shutdown.
pub fn spawn_flush(
    stats: Arc<StatsRegistry>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for entry in stats.drain() {
                        if entry.request_count == 0 && entry.no_route_count == 0 {
                            continue;
                        }
                        info!(
                            route = %entry.route,
                            requests = entry.request_count,
                            no_route = entry.no_route_count,
                            window_start = %entry.window_start.to_rfc3339(),
                            window_end = %entry.window_end.to_rfc3339(),
                            "Route statistics"
                        );
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
