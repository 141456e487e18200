// ────────────────────────────────
// src/proxy/proxy.rs
// Proxy rule: forwards a request to one backend target
// ────────────────────────────────

use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Body, Request, Response, StatusCode};
use std::fmt;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use url::{Position, Url};

use super::pool::ConnectionPool;
use crate::config::ConfigError;
use crate::rules::{ResponseSink, RuleNode, RuleRequest};

pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_UPSTREAM_ERROR: &str = "x-upstream-error";

/// Credential headers the control plane's own API expects to see on proxied calls.
pub const CREDENTIAL_HEADERS: [&str; 2] = ["accesskey", "secret"];

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

// Connection-scoped headers never copied across the proxy boundary.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::CONTENT_LENGTH,
];

pub struct ProxyRule {
    target: String,
    base: Url,
    pool: ConnectionPool,
    timeout: Duration,
    successor: Option<Box<RuleNode>>,
}

impl ProxyRule {
    pub fn new(target: &str, max_backend_connections: usize) -> Result<Self, ConfigError> {
        let base = Url::parse(target).map_err(|e| ConfigError::InvalidTarget {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

        if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
            return Err(ConfigError::InvalidTarget {
                target: target.to_string(),
                reason: "expected an http(s) URL with a host".to_string(),
            });
        }

        Ok(Self {
            target: target.to_string(),
            base,
            pool: ConnectionPool::new(max_backend_connections),
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
            successor: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn add_target_rule(&mut self, rule: RuleNode) {
        self.successor = Some(Box::new(rule));
    }

    /// The backend URL exactly as configured; join/leave match on this string.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub async fn serve(&self, req: &RuleRequest, res: &mut ResponseSink) {
        match self.forward(req).await {
            Ok((status, headers, body)) => {
                res.replace_headers(&headers);
                res.set_status(status);
                res.write(&body);
            }
            Err(err) => {
                warn!(target = %self.target, %err, "upstream call failed");
                err.write_to(res);
                return;
            }
        }

        if let Some(next) = &self.successor {
            next.serve(req, res).await;
        }
    }

    async fn forward(
        &self,
        req: &RuleRequest,
    ) -> Result<(StatusCode, HeaderMap, Bytes), ProxyError> {
        let outbound = self.build_request(req)?;
        let slot = self.pool.next_slot();
        let client = self.pool.client(slot);

        let mut deadline = Instant::now() + self.timeout;
        if let Some(inbound) = req.deadline {
            deadline = deadline.min(inbound);
        }

        debug!(
            "Proxying {} {} to {} (slot {})",
            req.method,
            req.uri.path(),
            self.target,
            slot
        );

        let exchange = async {
            let response = client.request(outbound).await?;
            let (parts, body) = response.into_parts();
            let body = hyper::body::to_bytes(body).await?;
            Ok::<_, hyper::Error>((parts, body))
        };

        let (parts, body) = match timeout_at(deadline, exchange).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(ProxyError::from_transport(&e)),
            Err(_) => {
                return Err(ProxyError::Upstream {
                    category: UpstreamCategory::Timeout,
                    message: format!("no response from {} before deadline", self.target),
                })
            }
        };

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        Ok((parts.status, headers, body))
    }

    fn build_request(&self, req: &RuleRequest) -> Result<Request<Body>, ProxyError> {
        let path_and_query = req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("{}{}", &self.base[..Position::BeforePath], path_and_query);

        let mut headers = req.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        if let Some(host) = req.headers.get(header::HOST) {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }
        if let Some(forwarded_for) = forwarded_for(req) {
            headers.insert(X_FORWARDED_FOR, forwarded_for);
        }
        if let Ok(proto) = HeaderValue::from_str(&req.scheme) {
            headers.insert(X_FORWARDED_PROTO, proto);
        }
        for name in CREDENTIAL_HEADERS {
            if let Some(value) = req.headers.get(name) {
                headers.insert(name, value.clone());
            }
        }

        let mut outbound = Request::builder()
            .method(req.method.clone())
            .uri(uri)
            .body(Body::from(req.body.clone()))
            .map_err(|e| ProxyError::Upstream {
                category: UpstreamCategory::Request,
                message: e.to_string(),
            })?;
        *outbound.headers_mut() = headers;
        Ok(outbound)
    }
}

impl fmt::Debug for ProxyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRule")
            .field("target", &self.target)
            .field("pool", &self.pool)
            .field("timeout", &self.timeout)
            .field("successor", &self.successor.is_some())
            .finish()
    }
}

/// Existing `X-Forwarded-For` values with the caller's address appended.
fn forwarded_for(req: &RuleRequest) -> Option<HeaderValue> {
    let mut hops: Vec<String> = req
        .headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();

    if let Some(addr) = req.remote_addr {
        hops.push(addr.ip().to_string());
    }

    if hops.is_empty() {
        return None;
    }
    HeaderValue::from_str(&hops.join(", ")).ok()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamCategory {
    Connect,
    Timeout,
    Protocol,
    Request,
}

impl UpstreamCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamCategory::Connect => "connect",
            UpstreamCategory::Timeout => "timeout",
            UpstreamCategory::Protocol => "protocol",
            UpstreamCategory::Request => "request",
        }
    }
}

impl fmt::Display for UpstreamCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Request-path failures; each one renders into a response where it is detected.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No route matches {path}")]
    RouteNotFound { path: String },

    #[error("No backends available for {prefix}")]
    NoBackendsAvailable { prefix: String },

    #[error("Upstream {category} error: {message}")]
    Upstream {
        category: UpstreamCategory,
        message: String,
    },

    #[error("Cache population failed: {0}")]
    CachePopulation(String),
}

impl ProxyError {
    fn from_transport(err: &hyper::Error) -> Self {
        let category = if err.is_connect() {
            UpstreamCategory::Connect
        } else if err.is_timeout() {
            UpstreamCategory::Timeout
        } else {
            UpstreamCategory::Protocol
        };
        ProxyError::Upstream {
            category,
            message: err.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::NoBackendsAvailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Upstream {
                category: UpstreamCategory::Timeout,
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream { .. } | ProxyError::CachePopulation(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Templated body shown to the caller.
    pub fn body(&self) -> String {
        match self {
            ProxyError::RouteNotFound { path } => format!("Not found ({}).", path),
            ProxyError::NoBackendsAvailable { prefix } => {
                format!("No backends available for {}.", prefix)
            }
            ProxyError::Upstream { category, .. } => format!("Upstream {} error.", category),
            ProxyError::CachePopulation(_) => "Upstream cache error.".to_string(),
        }
    }

    pub fn write_to(&self, res: &mut ResponseSink) {
        res.set_status(self.status());
        let headers = res.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let ProxyError::Upstream { category, .. } = self {
            headers.insert(X_UPSTREAM_ERROR, HeaderValue::from_static(category.as_str()));
        }
        res.write(self.body().as_bytes());
    }
}

impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let mut sink = ResponseSink::new();
        err.write_to(&mut sink);
        sink.into_response()
    }
}
