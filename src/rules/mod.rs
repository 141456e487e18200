//! Rule chains.
//!
//! A route owns one `RuleNode`. Every node either writes a complete response
//! into the sink, or writes its part and hands the same request and sink to
//! the node it holds (successor, wrapped node or selected backend). Chains
//! are trees; nothing points back up.

mod cache;
mod content;
mod request;
mod watch;

pub use cache::CacheRule;
pub use content::{parse_header_lines, ContentRule};
pub use request::{ResponseSink, RuleRequest};
pub use watch::MutationWatchRule;

use futures::future::BoxFuture;

use crate::load_balancer::LoadBalancerRule;
use crate::proxy::ProxyRule;

#[derive(Debug)]
pub enum RuleNode {
    Proxy(ProxyRule),
    Content(ContentRule),
    Cache(CacheRule),
    LoadBalancer(LoadBalancerRule),
    Watch(MutationWatchRule),
}

impl RuleNode {
    /// Runs this node (and whatever it delegates to) against `req`.
    pub fn serve<'a>(
        &'a self,
        req: &'a RuleRequest,
        res: &'a mut ResponseSink,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match self {
                RuleNode::Proxy(rule) => rule.serve(req, res).await,
                RuleNode::Content(rule) => rule.serve(req, res).await,
                RuleNode::Cache(rule) => rule.serve(req, res).await,
                RuleNode::LoadBalancer(rule) => rule.serve(req, res).await,
                RuleNode::Watch(rule) => rule.serve(req, res).await,
            }
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RuleNode::Proxy(_) => "proxy",
            RuleNode::Content(_) => "content",
            RuleNode::Cache(_) => "cache",
            RuleNode::LoadBalancer(_) => "load-balancer",
            RuleNode::Watch(_) => "watch",
        }
    }

    /// Backend URL this node ultimately proxies to, seen through decorators.
    pub fn target(&self) -> Option<&str> {
        match self {
            RuleNode::Proxy(rule) => Some(rule.target()),
            RuleNode::Cache(rule) => rule.wrapped().target(),
            RuleNode::Watch(rule) => rule.inner().target(),
            RuleNode::Content(_) | RuleNode::LoadBalancer(_) => None,
        }
    }

    /// The balancer at the top of this chain, seen through decorators.
    pub fn load_balancer(&self) -> Option<&LoadBalancerRule> {
        match self {
            RuleNode::LoadBalancer(rule) => Some(rule),
            RuleNode::Watch(rule) => rule.inner().load_balancer(),
            RuleNode::Cache(rule) => rule.wrapped().load_balancer(),
            RuleNode::Proxy(_) | RuleNode::Content(_) => None,
        }
    }
}

impl From<ProxyRule> for RuleNode {
    fn from(rule: ProxyRule) -> Self {
        RuleNode::Proxy(rule)
    }
}

impl From<ContentRule> for RuleNode {
    fn from(rule: ContentRule) -> Self {
        RuleNode::Content(rule)
    }
}

impl From<CacheRule> for RuleNode {
    fn from(rule: CacheRule) -> Self {
        RuleNode::Cache(rule)
    }
}

impl From<LoadBalancerRule> for RuleNode {
    fn from(rule: LoadBalancerRule) -> Self {
        RuleNode::LoadBalancer(rule)
    }
}

impl From<MutationWatchRule> for RuleNode {
    fn from(rule: MutationWatchRule) -> Self {
        RuleNode::Watch(rule)
    }
}
