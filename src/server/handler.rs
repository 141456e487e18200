// src/server/handler.rs
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::Service;
use tracing::{debug, info};

use crate::cache::X_CACHE_HIT;
use crate::metrics::{MetricsCollector, StatsRegistry, Timer};
use crate::proxy::ProxyError;
use crate::routing::SharedRouteTable;
use crate::rules::{ResponseSink, RuleRequest};

/// Services that want to know which peer a connection belongs to.
pub trait PeerAware {
    fn with_peer(&self, peer: SocketAddr) -> Self;

    /// Collector whose connection gauge tracks open inbound connections.
    fn connection_metrics(&self) -> Option<Arc<MetricsCollector>> {
        None
    }
}

#[derive(Clone)]
struct HandlerState {
    table: SharedRouteTable,
    scheme: String,
    static_headers: HeaderMap,
    log_requests: bool,
    request_timeout: Option<Duration>,
    metrics: Option<Arc<MetricsCollector>>,
    stats: Arc<StatsRegistry>,
}

/// Root handler: matches every request against the active table and runs
/// the matched chain.
#[derive(Clone)]
pub struct RequestHandler {
    state: Arc<HandlerState>,
    peer: Option<SocketAddr>,
}

impl RequestHandler {
    pub fn new(table: SharedRouteTable, scheme: impl Into<String>) -> Self {
        Self {
            state: Arc::new(HandlerState {
                table,
                scheme: scheme.into(),
                static_headers: HeaderMap::new(),
                log_requests: false,
                request_timeout: None,
                metrics: None,
                stats: Arc::new(StatsRegistry::new()),
            }),
            peer: None,
        }
    }

    fn state_mut(&mut self) -> &mut HandlerState {
        Arc::make_mut(&mut self.state)
    }

    pub fn with_static_headers(mut self, headers: HeaderMap) -> Self {
        self.state_mut().static_headers = headers;
        self
    }

    pub fn with_access_log(mut self, enabled: bool) -> Self {
        self.state_mut().log_requests = enabled;
        self
    }

    /// Deadline handed to the chain for each request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.state_mut().request_timeout = Some(timeout);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.state_mut().metrics = Some(metrics);
        self
    }

    pub fn with_stats(mut self, stats: Arc<StatsRegistry>) -> Self {
        self.state_mut().stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<StatsRegistry> {
        self.state.stats.clone()
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let timer = Timer::new();
        let state = &self.state;

        let (parts, body) = req.into_parts();
        let body = match hyper::body::to_bytes(body).await {
            Ok(body) => body,
            Err(e) => {
                debug!("Failed to read request body: {}", e);
                return bad_request();
            }
        };

        let mut rule_req = RuleRequest::new(parts.method, parts.uri)
            .with_scheme(state.scheme.clone())
            .with_body(body);
        rule_req.version = parts.version;
        rule_req.headers = parts.headers;
        rule_req.remote_addr = self.peer;
        if let Some(timeout) = state.request_timeout {
            rule_req = rule_req.with_deadline(tokio::time::Instant::now() + timeout);
        }

        // One snapshot for the whole request; a concurrent swap does not
        // affect it.
        let table = state.table.load_full();
        let mut sink = ResponseSink::with_headers(state.static_headers.clone());

        let route_label = match table.match_request(&rule_req) {
            Some(route) => {
                route.chain.serve(&rule_req, &mut sink).await;
                state.stats.record_request(&route.path_prefix);
                route.path_prefix.clone()
            }
            None => {
                ProxyError::RouteNotFound {
                    path: rule_req.uri.path().trim_start_matches('/').to_string(),
                }
                .write_to(&mut sink);
                if let Some(root) = table.root() {
                    state.stats.record_no_route(&root.path_prefix);
                }
                if let Some(metrics) = &state.metrics {
                    metrics.record_no_route();
                }
                String::new()
            }
        };

        let status = sink.status();
        if let Some(metrics) = &state.metrics {
            if !route_label.is_empty() {
                metrics.record_request(&route_label, status.as_u16(), timer.elapsed());
                if sink.headers().contains_key(X_CACHE_HIT) {
                    metrics.record_cache_hit(&route_label);
                }
            }
        }

        if state.log_requests {
            info!(
                remote = %self.peer.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                scheme = %rule_req.scheme,
                method = %rule_req.method,
                path = %rule_req.uri.path(),
                version = ?rule_req.version,
                status = status.as_u16(),
                size = sink.body().len(),
                user_agent = %rule_req
                    .headers
                    .get(USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-"),
                elapsed_us = timer.elapsed().as_micros() as u64,
                "request"
            );
        }

        sink.into_response()
    }
}

fn bad_request() -> Response<Body> {
    let mut response = Response::new(Body::from("Bad request."));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

impl PeerAware for RequestHandler {
    fn with_peer(&self, peer: SocketAddr) -> Self {
        Self {
            state: self.state.clone(),
            peer: Some(peer),
        }
    }

    fn connection_metrics(&self) -> Option<Arc<MetricsCollector>> {
        self.state.metrics.clone()
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { Ok(handler.handle(req).await) })
    }
}
