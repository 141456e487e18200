// src/rules/watch.rs
use hyper::{Method, StatusCode};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::{ResponseSink, RuleNode, RuleRequest};
use crate::control::ReloadTrigger;

/// Wraps an API route and asks for a configuration reload whenever a
/// non-GET request through it succeeds: the API behind it is the store the
/// routing table comes from.
#[derive(Debug)]
pub struct MutationWatchRule {
    inner: Box<RuleNode>,
    route: String,
    reload_tx: UnboundedSender<ReloadTrigger>,
}

impl MutationWatchRule {
    pub fn new(route: impl Into<String>, inner: RuleNode, reload_tx: UnboundedSender<ReloadTrigger>) -> Self {
        Self {
            inner: Box::new(inner),
            route: route.into(),
            reload_tx,
        }
    }

    pub fn inner(&self) -> &RuleNode {
        &self.inner
    }

    pub async fn serve(&self, req: &RuleRequest, res: &mut ResponseSink) {
        self.inner.serve(req, res).await;

        if req.method != Method::GET
            && matches!(res.status(), StatusCode::OK | StatusCode::NO_CONTENT)
        {
            debug!("{} {} changed configuration, requesting reload", req.method, self.route);
            let trigger = ReloadTrigger::Mutation {
                route: self.route.clone(),
            };
            if self.reload_tx.send(trigger).is_err() {
                warn!("Reload listener is gone, {} change not applied", self.route);
            }
        }
    }
}
