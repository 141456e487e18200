// src/control/builder.rs
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::{MembershipBody, ReloadTrigger};
use crate::config::{api_base_url, BackendDescriptor, ConfigError, RouteDescriptor, RouteKind, Settings};
use crate::load_balancer::{LoadBalancerRule, Strategy};
use crate::proxy::ProxyRule;
use crate::routing::{Route, RouteTable};
use crate::rules::{CacheRule, ContentRule, MutationWatchRule, RuleNode};

/// Turns route descriptors and join messages into rule chains.
#[derive(Clone)]
pub struct ChainBuilder {
    max_backend_connections: usize,
    upstream_timeout: Duration,
    default_strategy: Strategy,
    reload_tx: Option<UnboundedSender<ReloadTrigger>>,
    /// `http://api.<domain>` watched route to the API backend.
    api_route: Option<RouteDescriptor>,
}

impl ChainBuilder {
    pub fn new(settings: &Settings) -> Self {
        Self {
            max_backend_connections: settings.max_backend_connections,
            upstream_timeout: settings.upstream_timeout(),
            default_strategy: settings.strategy(),
            reload_tx: None,
            api_route: api_route(settings),
        }
    }

    /// api-target routes report successful mutations on `reload_tx`.
    pub fn with_reload_sender(mut self, reload_tx: UnboundedSender<ReloadTrigger>) -> Self {
        self.reload_tx = Some(reload_tx);
        self
    }

    pub fn strategy(&self, name: &str) -> Strategy {
        if name.trim().is_empty() {
            self.default_strategy
        } else {
            Strategy::from_name(name)
        }
    }

    pub fn proxy_node(&self, target: &str) -> Result<RuleNode, ConfigError> {
        let rule = ProxyRule::new(target, self.max_backend_connections)?
            .with_timeout(self.upstream_timeout);
        Ok(rule.into())
    }

    pub fn load_balancer<'a>(
        &self,
        name: &str,
        strategy: Strategy,
        targets: impl IntoIterator<Item = &'a str>,
    ) -> Result<LoadBalancerRule, ConfigError> {
        let lb = LoadBalancerRule::new(name, strategy);
        for target in targets {
            lb.add_target_rule(self.proxy_node(target)?)?;
        }
        Ok(lb)
    }

    /// Builds a table in recency order: a later descriptor shadows an
    /// earlier one, lower `Order` values are checked first. Broken
    /// descriptors are skipped.
    pub fn build_table(&self, descriptors: &[RouteDescriptor]) -> RouteTable {
        let mut ordered: Vec<&RouteDescriptor> = descriptors.iter().collect();
        ordered.sort_by(|a, b| b.order.cmp(&a.order));

        let mut table = RouteTable::new();
        for descriptor in ordered {
            match self.build_route(descriptor) {
                Ok(route) => {
                    debug!(
                        "Built {} route {} for {}",
                        descriptor.kind, route.path_prefix, route.application
                    );
                    table.insert(Arc::new(route));
                }
                Err(e) => warn!("Skipping route {:?}: {}", descriptor.path, e),
            }
        }

        if let Some(api) = &self.api_route {
            match self.build_route(api) {
                Ok(route) => table.insert(Arc::new(route)),
                Err(e) => warn!("Skipping API route {}: {}", api.path, e),
            }
        }
        table
    }

    pub fn build_route(&self, descriptor: &RouteDescriptor) -> Result<Route, ConfigError> {
        if descriptor.path.is_empty() {
            return Err(ConfigError::InvalidDescriptor {
                path: String::new(),
                reason: "missing Path".to_string(),
            });
        }

        let chain = match descriptor.route_kind()? {
            RouteKind::ProxyTarget => self
                .load_balancer(
                    &descriptor.path,
                    self.strategy(&descriptor.method),
                    descriptor.backend_urls(),
                )?
                .into(),
            RouteKind::ApiTarget => {
                let lb: RuleNode = self
                    .load_balancer(
                        &descriptor.path,
                        self.strategy(&descriptor.method),
                        descriptor.backend_urls(),
                    )?
                    .into();
                match &self.reload_tx {
                    Some(tx) => MutationWatchRule::new(&descriptor.path, lb, tx.clone()).into(),
                    None => lb,
                }
            }
            RouteKind::ContentTarget => ContentRule::complete(
                descriptor.content.clone().unwrap_or_default(),
                &descriptor.headers,
                descriptor.status.unwrap_or(200),
            )?
            .into(),
            RouteKind::RedirectTarget => {
                let destination = descriptor.destination.as_deref().ok_or_else(|| {
                    ConfigError::InvalidDescriptor {
                        path: descriptor.path.clone(),
                        reason: "redirect without Destination".to_string(),
                    }
                })?;
                ContentRule::redirect(destination, descriptor.status.unwrap_or(301))?.into()
            }
            RouteKind::CacheTarget => {
                let target = descriptor.backend_urls().next().ok_or_else(|| {
                    ConfigError::InvalidDescriptor {
                        path: descriptor.path.clone(),
                        reason: "cache without Backends".to_string(),
                    }
                })?;
                CacheRule::new(self.proxy_node(target)?).into()
            }
        };

        Ok(Route::new(&descriptor.path, chain)
            .with_application(descriptor.application_name())
            .with_order(descriptor.order)
            .with_healthcheck(descriptor.healthcheck.clone().filter(|h| h.enabled)))
    }

    /// Routes for an application that does not exist yet: one balanced
    /// route per declared prefix, each starting with the joining backend.
    pub fn build_join_routes(&self, body: &MembershipBody) -> Result<Vec<Route>, ConfigError> {
        let prefixes: Vec<&str> = if body.routes.is_empty() {
            vec![body.application.as_str()]
        } else {
            body.routes.iter().map(String::as_str).collect()
        };
        let strategy = self.strategy(&body.method);

        prefixes
            .into_iter()
            .map(|prefix| -> Result<Route, ConfigError> {
                let lb = self.load_balancer(prefix, strategy, [body.target.as_str()])?;
                Ok(Route::new(prefix, lb.into())
                    .with_application(&body.application)
                    .with_order(body.order)
                    .with_healthcheck(body.healthcheck.clone().filter(|h| h.enabled)))
            })
            .collect()
    }
}

fn api_route(settings: &Settings) -> Option<RouteDescriptor> {
    let domain = settings.api.domain.trim();
    let backend = settings.api.backend.trim();
    if domain.is_empty() || backend.is_empty() {
        return None;
    }

    Some(RouteDescriptor {
        kind: RouteKind::ApiTarget.as_str().to_string(),
        path: format!("{}://api.{}", settings.listen.scheme, domain),
        method: String::new(),
        backends: vec![BackendDescriptor {
            backend: api_base_url(backend),
        }],
        healthcheck: None,
        order: 0,
        application: Some("api".to_string()),
        content: None,
        status: None,
        headers: Vec::new(),
        destination: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_json_descriptors;
    use crate::rules::{ResponseSink, RuleRequest};
    use hyper::{Method, StatusCode};
    use tokio::sync::mpsc;

    fn descriptor(kind: &str, path: &str) -> RouteDescriptor {
        RouteDescriptor {
            kind: kind.to_string(),
            path: path.to_string(),
            method: String::new(),
            backends: Vec::new(),
            healthcheck: None,
            order: 0,
            application: None,
            content: None,
            status: None,
            headers: Vec::new(),
            destination: None,
        }
    }

    fn builder() -> ChainBuilder {
        ChainBuilder::new(&Settings::default())
    }

    #[test]
    fn proxy_target_becomes_balancer() {
        let mut d = descriptor("proxy-target", "http://a.test/");
        d.method = "random".to_string();
        d.backends = vec![
            BackendDescriptor { backend: "http://10.0.0.1".to_string() },
            BackendDescriptor { backend: "http://10.0.0.2".to_string() },
        ];

        let route = builder().build_route(&d).unwrap();
        let lb = route.load_balancer().unwrap();
        assert_eq!(lb.strategy(), Strategy::Random);
        assert_eq!(lb.targets(), vec!["http://10.0.0.1", "http://10.0.0.2"]);
        assert_eq!(route.application, "http://a.test/");
    }

    #[test]
    fn empty_method_uses_default_strategy() {
        let mut settings = Settings::default();
        settings.default_strategy = "random".to_string();
        let mut d = descriptor("proxy-target", "http://a.test/");
        d.backends = vec![BackendDescriptor { backend: "http://10.0.0.1".to_string() }];

        let route = ChainBuilder::new(&settings).build_route(&d).unwrap();
        assert_eq!(route.load_balancer().unwrap().strategy(), Strategy::Random);

        d.method = "weighted".to_string();
        let route = ChainBuilder::new(&settings).build_route(&d).unwrap();
        assert_eq!(route.load_balancer().unwrap().strategy(), Strategy::RoundRobin);
    }

    #[test]
    fn api_target_is_watched_when_reloads_are_wired() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut d = descriptor("api-target", "http://api.test/");
        d.backends = vec![BackendDescriptor { backend: "http://10.0.0.9".to_string() }];

        let route = builder().with_reload_sender(tx).build_route(&d).unwrap();
        assert_eq!(route.chain.kind(), "watch");
        assert!(route.load_balancer().is_some());
    }

    #[tokio::test]
    async fn redirect_defaults_to_301() {
        let mut d = descriptor("redirect-target", "/old");
        d.destination = Some("https://new.test/".to_string());
        let route = builder().build_route(&d).unwrap();

        let mut sink = ResponseSink::new();
        route
            .chain
            .serve(&RuleRequest::new(Method::GET, "/old".parse().unwrap()), &mut sink)
            .await;
        assert_eq!(sink.status(), StatusCode::MOVED_PERMANENTLY);
    }

    #[test]
    fn table_skips_broken_descriptors_and_keeps_recency() {
        let descriptors = parse_json_descriptors(
            r#"[
                {"Type": "content-target", "Path": "/a", "Content": "first"},
                {"Type": "unknown-target", "Path": "/b"},
                {"Type": "proxy-target", "Path": "/c", "Backends": [{"Backend": "not a url"}]},
                {"Type": "content-target", "Path": "/a/b", "Content": "second"},
                {"Type": "content-target", "Path": "/z", "Order": 7}
            ]"#,
        )
        .unwrap();

        let table = builder().build_table(&descriptors);
        assert_eq!(table.prefixes(), vec!["/a/b", "/a", "/z"]);
    }

    #[test]
    fn api_domain_adds_watched_api_route() {
        let mut settings = Settings::default();
        settings.api.domain = "example.test".to_string();
        settings.api.backend = "10.90.10.80".to_string();
        let (tx, _rx) = mpsc::unbounded_channel();

        let table = ChainBuilder::new(&settings)
            .with_reload_sender(tx)
            .build_table(&[descriptor("content-target", "/a")]);
        assert_eq!(table.prefixes(), vec!["http://api.example.test", "/a"]);

        let api = table.find("http://api.example.test/loadbalancer").unwrap();
        assert_eq!(api.chain.kind(), "watch");
        assert_eq!(api.chain.load_balancer().unwrap().targets(), vec!["http://10.90.10.80"]);
    }

    #[test]
    fn join_routes_default_to_application_prefix() {
        let body = MembershipBody {
            application: "http://shop.test/".to_string(),
            target: "http://10.0.0.7".to_string(),
            order: 4,
            ..MembershipBody::default()
        };

        let routes = builder().build_join_routes(&body).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].path_prefix, "http://shop.test/");
        assert_eq!(routes[0].order, 4);
        assert!(routes[0].load_balancer().unwrap().contains_target("http://10.0.0.7"));
    }
}
