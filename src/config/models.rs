// src/config/models.rs
use hyper::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use super::ConfigError;
use crate::load_balancer::Strategy;
use crate::rules::parse_header_lines;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub listen: ListenSettings,
    /// One access-log line per request.
    pub log_requests: bool,
    pub api: ApiSettings,
    /// Local descriptor file; takes precedence over the REST endpoint.
    pub routes_file: Option<PathBuf>,
    pub default_strategy: String,
    pub max_backend_connections: usize,
    pub upstream_timeout_secs: u64,
    /// `"Name: value"` lines added to every response.
    pub static_headers: Vec<String>,
    pub stats_interval_secs: u64,
    pub refresh_interval_secs: Option<u64>,
    pub metrics: MetricsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: ListenSettings::default(),
            log_requests: false,
            api: ApiSettings::default(),
            routes_file: None,
            default_strategy: Strategy::RoundRobin.as_str().to_string(),
            max_backend_connections: 10,
            upstream_timeout_secs: 30,
            static_headers: Vec::new(),
            stats_interval_secs: 60,
            refresh_interval_secs: None,
            metrics: MetricsSettings::default(),
        }
    }
}

impl Settings {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.addr()
    }

    pub fn strategy(&self) -> Strategy {
        Strategy::from_name(&self.default_strategy)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn static_header_map(&self) -> Result<HeaderMap, ConfigError> {
        parse_header_lines(&self.static_headers)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenSettings {
    pub host: String,
    pub port: u16,
    /// Scheme used when building the request identity for route matching.
    pub scheme: String,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            scheme: "http".to_string(),
        }
    }
}

impl ListenSettings {
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::ListenAddress(format!("{}:{}", self.host, self.port)))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiSettings {
    pub backend: String,
    pub domain: String,
    pub access_key: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

/// Route kinds understood by the chain builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    ProxyTarget,
    /// Proxy whose successful mutations trigger a reload.
    ApiTarget,
    ContentTarget,
    RedirectTarget,
    CacheTarget,
}

impl RouteKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "proxy-target" => Some(Self::ProxyTarget),
            "api-target" => Some(Self::ApiTarget),
            "content-target" => Some(Self::ContentTarget),
            "redirect-target" => Some(Self::RedirectTarget),
            "cache-target" => Some(Self::CacheTarget),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProxyTarget => "proxy-target",
            Self::ApiTarget => "api-target",
            Self::ContentTarget => "content-target",
            Self::RedirectTarget => "redirect-target",
            Self::CacheTarget => "cache-target",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct BackendDescriptor {
    pub backend: String,
}

/// One route entry as delivered by a configuration source.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RouteDescriptor {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub path: String,
    /// Strategy name for load-balanced kinds.
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,
    #[serde(default)]
    pub healthcheck: Option<HealthCheckSettings>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub destination: Option<String>,
}

impl RouteDescriptor {
    pub fn route_kind(&self) -> Result<RouteKind, ConfigError> {
        RouteKind::parse(&self.kind).ok_or_else(|| ConfigError::InvalidDescriptor {
            path: self.path.clone(),
            reason: format!("unknown route type {:?}", self.kind),
        })
    }

    /// Application name, defaulting to the path prefix.
    pub fn application_name(&self) -> &str {
        self.application.as_deref().unwrap_or(&self.path)
    }

    pub fn backend_urls(&self) -> impl Iterator<Item = &str> {
        self.backends.iter().map(|b| b.backend.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct HealthCheckSettings {
    pub enabled: bool,
    pub path: String,
    #[serde(rename = "Interval")]
    pub interval_secs: u64,
    #[serde(rename = "Timeout")]
    pub timeout_secs: u64,
    /// Status a healthy backend answers with.
    pub expected: u16,
    pub remove_on_failure: bool,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/".to_string(),
            interval_secs: 10,
            timeout_secs: 5,
            expected: 200,
            remove_on_failure: false,
        }
    }
}

impl HealthCheckSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}
