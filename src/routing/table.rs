// src/routing/table.rs
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::HealthCheckSettings;
use crate::load_balancer::LoadBalancerRule;
use crate::rules::{RuleNode, RuleRequest};

/// A path prefix bound to a rule chain.
#[derive(Debug)]
pub struct Route {
    pub id: Uuid,
    pub path_prefix: String,
    pub application: String,
    pub order: i64,
    pub healthcheck: Option<HealthCheckSettings>,
    pub chain: Arc<RuleNode>,
}

impl Route {
    pub fn new(path_prefix: impl Into<String>, chain: RuleNode) -> Self {
        let path_prefix = path_prefix.into();
        Self {
            id: Uuid::new_v4(),
            application: path_prefix.clone(),
            path_prefix,
            order: 0,
            healthcheck: None,
            chain: Arc::new(chain),
        }
    }

    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = application.into();
        self
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    pub fn with_healthcheck(mut self, healthcheck: Option<HealthCheckSettings>) -> Self {
        self.healthcheck = healthcheck;
        self
    }

    pub fn matches(&self, identity: &str) -> bool {
        identity.starts_with(&self.path_prefix)
    }

    pub fn load_balancer(&self) -> Option<&LoadBalancerRule> {
        self.chain.load_balancer()
    }

    /// Root routes (`scheme://host/` or bare `/`) also collect the
    /// statistics of requests nothing matched.
    pub fn is_root(&self) -> bool {
        let rest = match self.path_prefix.split_once("://") {
            Some((_, rest)) => rest.find('/').map(|i| &rest[i..]).unwrap_or(""),
            None => self.path_prefix.as_str(),
        };
        rest.is_empty() || rest == "/"
    }
}

/// Routes in match order: index 0 is checked first.
///
/// A table is never mutated once published; changes build a copy and swap
/// it in. Copies are cheap since routes are shared.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: VecDeque<Arc<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `route` ahead of every existing route, shadowing any older
    /// route with an overlapping prefix.
    pub fn insert(&mut self, route: Arc<Route>) {
        self.routes.push_front(route);
    }

    /// Places `route` before the first route with an equal or greater
    /// order, so within one order the newest route shadows older ones.
    pub fn insert_ordered(&mut self, route: Arc<Route>) {
        let position = self
            .routes
            .iter()
            .position(|existing| existing.order >= route.order)
            .unwrap_or(self.routes.len());
        self.routes.insert(position, route);
    }

    /// First route, newest first, whose prefix starts `identity`.
    ///
    /// Overlaps are resolved by position, not by prefix length.
    pub fn find(&self, identity: &str) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|route| route.matches(identity))
            .cloned()
    }

    pub fn match_request(&self, req: &RuleRequest) -> Option<Arc<Route>> {
        self.find(&req.identity())
    }

    pub fn routes_for(&self, application: &str) -> Vec<Arc<Route>> {
        self.routes
            .iter()
            .filter(|route| route.application == application)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Route>> {
        self.routes.iter().find(|route| &route.id == id).cloned()
    }

    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&Arc<Route>) -> bool,
    {
        self.routes.retain(keep);
    }

    pub fn root(&self) -> Option<Arc<Route>> {
        self.routes.iter().find(|route| route.is_root()).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter()
    }

    pub fn prefixes(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.path_prefix.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
