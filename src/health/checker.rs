// src/health/checker.rs
use dashmap::DashMap;
use hyper::header::{HeaderValue, HOST};
use hyper::{Method, StatusCode};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::HealthCheckSettings;
use crate::metrics::MetricsCollector;
use crate::routing::{Route, RouteTable};
use crate::rules::{ResponseSink, RuleRequest};

/// A backend that answered a health check with the wrong status, or not
/// at all.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthFailure {
    pub route_id: Uuid,
    pub route: String,
    pub application: String,
    pub backend: String,
    pub detail: String,
    /// The route asked for failing backends to be removed.
    pub remove: bool,
}

#[derive(Debug)]
pub struct HealthCheckResult {
    pub backend: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub status: Option<StatusCode>,
    pub error: Option<String>,
}

/// Owns one ticker task per health-checked route.
///
/// Tickers are keyed by route id, so a reload (which builds routes with
/// fresh ids) stops every ticker of the previous table.
pub struct HealthMonitor {
    tickers: DashMap<Uuid, watch::Sender<bool>>,
    failure_tx: UnboundedSender<HealthFailure>,
    metrics: Option<Arc<MetricsCollector>>,
    scheme: String,
}

impl HealthMonitor {
    pub fn new(failure_tx: UnboundedSender<HealthFailure>) -> Self {
        Self {
            tickers: DashMap::new(),
            failure_tx,
            metrics: None,
            scheme: "http".to_string(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Scheme used for the synthetic request identity.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Runs tickers for exactly the health-checked routes of `table`.
    pub fn sync(&self, table: &RouteTable) {
        let wanted: HashSet<Uuid> = table
            .iter()
            .filter(|route| is_checked(route))
            .map(|route| route.id)
            .collect();

        let stale: Vec<Uuid> = self
            .tickers
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| !wanted.contains(id))
            .collect();
        for id in stale {
            self.stop(&id);
        }

        for route in table.iter().filter(|route| is_checked(route)) {
            if !self.tickers.contains_key(&route.id) {
                self.start(route.clone());
            }
        }
    }

    pub fn start(&self, route: Arc<Route>) {
        let Some(settings) = route.healthcheck.clone() else {
            return;
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Some(previous) = self.tickers.insert(route.id, shutdown_tx) {
            let _ = previous.send(true);
        }

        let probe = RouteProbe {
            route,
            settings,
            scheme: self.scheme.clone(),
            failure_tx: self.failure_tx.clone(),
            metrics: self.metrics.clone(),
        };
        tokio::spawn(probe.run(shutdown_rx));
    }

    pub fn stop(&self, id: &Uuid) -> bool {
        match self.tickers.remove(id) {
            Some((_, shutdown_tx)) => {
                let _ = shutdown_tx.send(true);
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        let ids: Vec<Uuid> = self.tickers.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.stop(&id);
        }
    }

    pub fn active(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_running(&self, id: &Uuid) -> bool {
        self.tickers.contains_key(id)
    }
}

fn is_checked(route: &Route) -> bool {
    route.load_balancer().is_some()
        && route.healthcheck.as_ref().map_or(false, |h| h.enabled)
}

struct RouteProbe {
    route: Arc<Route>,
    settings: HealthCheckSettings,
    scheme: String,
    failure_tx: UnboundedSender<HealthFailure>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RouteProbe {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; give backends one interval.
        ticker.tick().await;

        info!(
            "Starting health checks for {} every {:?}",
            self.route.path_prefix,
            self.settings.interval()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_round().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Health checks for {} stopped", self.route.path_prefix);
                        break;
                    }
                }
            }
        }
    }

    /// Sends one synthetic request per backend through the route's own
    /// balancer and reports every backend that failed.
    async fn check_round(&self) {
        let Some(lb) = self.route.load_balancer() else {
            return;
        };

        let mut reported = HashSet::new();
        let mut healthy_count = 0;
        for _ in 0..lb.len() {
            let result = self.check_once().await;
            if result.healthy {
                debug!(
                    route = %self.route.path_prefix,
                    backend = %result.backend,
                    "Health check passed in {}ms",
                    result.response_time_ms
                );
                healthy_count += 1;
                continue;
            }

            let detail = result
                .error
                .clone()
                .unwrap_or_else(|| "unexpected status".to_string());
            warn!(
                route = %self.route.path_prefix,
                backend = %result.backend,
                status = ?result.status.map(|s| s.as_u16()),
                elapsed_ms = result.response_time_ms,
                "Health check failed: {}",
                detail
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_health_failure(&self.route.path_prefix, &result.backend);
            }

            if reported.insert(result.backend.clone()) {
                let _ = self.failure_tx.send(HealthFailure {
                    route_id: self.route.id,
                    route: self.route.path_prefix.clone(),
                    application: self.route.application.clone(),
                    backend: result.backend,
                    detail,
                    remove: self.settings.remove_on_failure,
                });
            }
        }

        debug!(
            "Health check round for {}: {} healthy, {} failing",
            self.route.path_prefix,
            healthy_count,
            reported.len()
        );
    }

    async fn check_once(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let deadline = Instant::now() + self.settings.timeout();
        let req = self.synthetic_request(deadline);
        let mut sink = ResponseSink::new();

        let served = match self.route.load_balancer() {
            Some(lb) => timeout(self.settings.timeout(), lb.dispatch(&req, &mut sink)).await,
            None => Ok(None),
        };
        let response_time_ms = start.elapsed().as_millis() as u64;

        let (backend, status, error) = match served {
            Ok(Some(node)) => {
                let backend = node.target().unwrap_or(node.kind()).to_string();
                let status = sink.status();
                let error = sink
                    .headers()
                    .get(crate::proxy::X_UPSTREAM_ERROR)
                    .and_then(|v| v.to_str().ok())
                    .map(|category| format!("upstream {} error", category))
                    .or_else(|| {
                        (status.as_u16() != self.settings.expected).then(|| {
                            format!("expected {}, got {}", self.settings.expected, status.as_u16())
                        })
                    });
                (backend, Some(status), error)
            }
            Ok(None) => (String::new(), None, Some("no backends".to_string())),
            Err(_) => (String::new(), None, Some("health check timed out".to_string())),
        };

        HealthCheckResult {
            healthy: error.is_none(),
            backend,
            response_time_ms,
            status,
            error,
        }
    }

    fn synthetic_request(&self, deadline: Instant) -> RuleRequest {
        let mut req = RuleRequest::new(Method::GET, health_uri(&self.settings.path))
            .with_scheme(self.scheme.clone())
            .with_deadline(deadline);

        if let Some(host) = Url::parse(&self.route.path_prefix)
            .ok()
            .and_then(|url| url.host_str().map(|h| match url.port() {
                Some(port) => format!("{}:{}", h, port),
                None => h.to_string(),
            }))
            .and_then(|host| HeaderValue::from_str(&host).ok())
        {
            req = req.with_header(HOST, host);
        }
        req
    }
}

fn health_uri(path: &str) -> hyper::Uri {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    path.parse().unwrap_or_else(|_| hyper::Uri::from_static("/"))
}
