// src/load_balancer/rule.rs
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{create_selector, BackendSelector, Strategy};
use crate::config::ConfigError;
use crate::proxy::ProxyError;
use crate::rules::{ResponseSink, RuleNode, RuleRequest};

/// Upper bound on backends behind a single balancer.
pub const MAX_BACKENDS: usize = 64;

/// Spreads requests over an ordered set of child chains.
///
/// The backend list is swapped as a whole on every change, so a request
/// always sees one consistent list even while join/leave run.
pub struct LoadBalancerRule {
    name: String,
    backends: ArcSwap<Vec<Arc<RuleNode>>>,
    strategy: Strategy,
    selector: Arc<dyn BackendSelector>,
    request_counter: AtomicUsize,
}

impl LoadBalancerRule {
    pub fn new(name: impl Into<String>, strategy: Strategy) -> Self {
        Self::with_selector(name, strategy, create_selector(strategy))
    }

    pub fn with_selector(
        name: impl Into<String>,
        strategy: Strategy,
        selector: Arc<dyn BackendSelector>,
    ) -> Self {
        Self {
            name: name.into(),
            backends: ArcSwap::from_pointee(Vec::new()),
            strategy,
            selector,
            request_counter: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn request_count(&self) -> usize {
        self.request_counter.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.load().is_empty()
    }

    pub fn backends(&self) -> Arc<Vec<Arc<RuleNode>>> {
        self.backends.load_full()
    }

    /// Target URLs of the children that proxy somewhere, in order.
    pub fn targets(&self) -> Vec<String> {
        self.backends
            .load()
            .iter()
            .filter_map(|node| node.target().map(str::to_string))
            .collect()
    }

    pub fn contains_target(&self, target: &str) -> bool {
        self.backends
            .load()
            .iter()
            .any(|node| node.target() == Some(target))
    }

    /// Appends a backend; fails once the balancer holds `MAX_BACKENDS`.
    pub fn add_target_rule(&self, rule: RuleNode) -> Result<(), ConfigError> {
        let rule = Arc::new(rule);
        let mut full = false;

        self.backends.rcu(|current| {
            if current.len() >= MAX_BACKENDS {
                full = true;
                return Arc::clone(current);
            }
            full = false;
            let mut next = Vec::clone(current);
            next.push(rule.clone());
            Arc::new(next)
        });

        if full {
            return Err(ConfigError::TooManyBackends {
                name: self.name.clone(),
                max: MAX_BACKENDS,
            });
        }
        Ok(())
    }

    /// Drops every child whose target equals `target`. Returns whether
    /// anything was removed.
    pub fn remove_target(&self, target: &str) -> bool {
        let mut removed = false;

        self.backends.rcu(|current| {
            let next: Vec<Arc<RuleNode>> = current
                .iter()
                .filter(|node| node.target() != Some(target))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            Arc::new(next)
        });

        if removed {
            debug!("Removed backend {} from {}", target, self.name);
        }
        removed
    }

    pub async fn serve(&self, req: &RuleRequest, res: &mut ResponseSink) {
        self.dispatch(req, res).await;
    }

    /// Serves the request and reports which child handled it.
    pub async fn dispatch(
        &self,
        req: &RuleRequest,
        res: &mut ResponseSink,
    ) -> Option<Arc<RuleNode>> {
        let counter = self.request_counter.fetch_add(1, Ordering::Relaxed);
        let backends = self.backends.load_full();

        if backends.is_empty() {
            warn!("No backends available for {}", self.name);
            ProxyError::NoBackendsAvailable {
                prefix: self.name.clone(),
            }
            .write_to(res);
            return None;
        }

        let index = self.selector.select(counter, backends.len());
        let node = backends[index].clone();
        node.serve(req, res).await;
        Some(node)
    }
}

impl std::fmt::Debug for LoadBalancerRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancerRule")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("selector", &self.selector.name())
            .field("backends", &self.targets())
            .finish()
    }
}
