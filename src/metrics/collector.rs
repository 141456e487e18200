// src/metrics/collector.rs
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::routing::RouteTable;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    /// Text exposition of every registered metric.
    pub fn gather(&self) -> Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub no_route_total: IntCounter,
    pub cache_hits_total: IntCounterVec,

    // Route metrics
    pub route_backends: IntGaugeVec,
    pub routes_active: IntGauge,
    pub health_check_failures_total: IntCounterVec,

    // Control plane
    pub reloads_total: IntCounterVec,

    pub active_connections: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new("lb_requests_total", "Total number of requests"),
            &["route", "status_code"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "lb_request_duration_seconds",
                "Request duration in seconds",
            ),
            &["route"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let no_route_total =
            IntCounter::new("lb_no_route_total", "Requests that matched no route")?;
        registry.register(Box::new(no_route_total.clone()))?;

        let cache_hits_total = IntCounterVec::new(
            Opts::new("lb_cache_hits_total", "Responses served from a cache rule"),
            &["route"],
        )?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let route_backends = IntGaugeVec::new(
            Opts::new("lb_route_backends", "Backends behind each balanced route"),
            &["route"],
        )?;
        registry.register(Box::new(route_backends.clone()))?;

        let routes_active = IntGauge::new("lb_routes_active", "Routes in the active table")?;
        registry.register(Box::new(routes_active.clone()))?;

        let health_check_failures_total = IntCounterVec::new(
            Opts::new(
                "lb_health_check_failures_total",
                "Failed health checks per backend",
            ),
            &["route", "backend"],
        )?;
        registry.register(Box::new(health_check_failures_total.clone()))?;

        let reloads_total = IntCounterVec::new(
            Opts::new("lb_reloads_total", "Configuration reloads by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(reloads_total.clone()))?;

        let active_connections =
            IntGauge::new("lb_active_connections", "Total active connections")?;
        registry.register(Box::new(active_connections.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            no_route_total,
            cache_hits_total,
            route_backends,
            routes_active,
            health_check_failures_total,
            reloads_total,
            active_connections,
        })
    }

    pub fn record_request(&self, route: &str, status_code: u16, duration: Duration) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[route, &status])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[route])
            .observe(duration.as_secs_f64());
    }

    pub fn record_no_route(&self) {
        self.no_route_total.inc();
    }

    pub fn record_cache_hit(&self, route: &str) {
        self.cache_hits_total.with_label_values(&[route]).inc();
    }

    pub fn record_health_failure(&self, route: &str, backend: &str) {
        self.health_check_failures_total
            .with_label_values(&[route, backend])
            .inc();
    }

    pub fn record_reload(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.reloads_total.with_label_values(&[outcome]).inc();
    }

    /// Refreshes the per-route gauges from a table.
    pub fn observe_table(&self, table: &RouteTable) {
        self.route_backends.reset();
        for route in table.iter() {
            if let Some(lb) = route.load_balancer() {
                self.route_backends
                    .with_label_values(&[&route.path_prefix])
                    .set(lb.len() as i64);
            }
        }
        self.routes_active.set(table.len() as i64);
    }

    pub fn increment_active_connections(&self) {
        self.active_connections.inc();
    }

    pub fn decrement_active_connections(&self) {
        self.active_connections.dec();
    }
}

// Helper for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
