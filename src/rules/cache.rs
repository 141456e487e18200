// src/rules/cache.rs
use std::sync::Arc;
use tracing::{debug, error};

use super::{ResponseSink, RuleNode, RuleRequest};
use crate::cache::{CachedResponse, SingleFlight};
use crate::proxy::ProxyError;

/// Serves the wrapped node's first response forever.
///
/// The wrapped node runs exactly once for the life of the rule; there is no
/// expiry or invalidation.
pub struct CacheRule {
    wrapped: Arc<RuleNode>,
    snapshot: SingleFlight<Arc<CachedResponse>>,
}

impl CacheRule {
    pub fn new(wrapped: RuleNode) -> Self {
        Self {
            wrapped: Arc::new(wrapped),
            snapshot: SingleFlight::new(),
        }
    }

    pub fn wrapped(&self) -> &RuleNode {
        &self.wrapped
    }

    pub fn is_populated(&self) -> bool {
        self.snapshot.get().is_some()
    }

    pub fn populations(&self) -> usize {
        self.snapshot.populations()
    }

    pub async fn serve(&self, req: &RuleRequest, res: &mut ResponseSink) {
        let wrapped = self.wrapped.clone();
        let request = req.clone();
        let cached = self
            .snapshot
            .get_or_populate(move || async move {
                debug!("Populating cache for {}", request.uri.path());
                let mut sink = ResponseSink::new();
                wrapped.serve(&request, &mut sink).await;
                Arc::new(CachedResponse::capture(sink))
            })
            .await;

        match cached {
            Ok(cached) => cached.replay(res),
            Err(e) => {
                error!("Cache population failed: {}", e);
                ProxyError::CachePopulation(e.to_string()).write_to(res);
            }
        }
    }
}

impl std::fmt::Debug for CacheRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRule")
            .field("wrapped", &self.wrapped)
            .field("populated", &self.is_populated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::X_CACHE_HIT;
    use crate::proxy::ProxyRule;
    use crate::rules::ContentRule;
    use hyper::{Method, StatusCode};

    fn request() -> RuleRequest {
        RuleRequest::new(Method::GET, "/cache".parse().unwrap())
    }

    #[tokio::test]
    async fn replays_with_hit_marker() {
        let rule = CacheRule::new(ContentRule::complete("cached", &[], 203).unwrap().into());

        for _ in 0..3 {
            let mut sink = ResponseSink::new();
            rule.serve(&request(), &mut sink).await;
            assert_eq!(sink.status(), StatusCode::NON_AUTHORITATIVE_INFORMATION);
            assert_eq!(sink.headers()[X_CACHE_HIT], "HIT");
            assert_eq!(sink.body(), b"cached");
        }
        assert_eq!(rule.populations(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cold_cache_fetches_upstream_once() {
        let mut server = mockito::Server::new_async().await;
        let upstream = server
            .mock("GET", "/cache")
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_body("published page")
            .expect(1)
            .create_async()
            .await;

        let proxy = ProxyRule::new(&server.url(), 8).unwrap();
        let rule = Arc::new(CacheRule::new(proxy.into()));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let rule = rule.clone();
            handles.push(tokio::spawn(async move {
                let mut sink = ResponseSink::new();
                rule.serve(&request(), &mut sink).await;
                sink.into_parts()
            }));
        }

        let mut responses = Vec::new();
        for handle in handles {
            responses.push(handle.await.unwrap());
        }

        upstream.assert_async().await;
        let first = &responses[0];
        assert_eq!(first.0, StatusCode::OK);
        assert_eq!(&first.2[..], b"published page");
        assert!(responses.iter().all(|r| r == first));
    }
}
