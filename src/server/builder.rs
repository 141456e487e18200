// src/server/builder.rs
use hyper::{server::conn::Http, Body, Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::Service;
use tracing::{debug, info, warn};

use super::handler::PeerAware;
use super::listener::bind_tcp;
use crate::metrics::MetricsCollector;

/// Holds the active-connection gauge up for the life of one connection.
struct ConnectionGuard(Option<Arc<MetricsCollector>>);

impl ConnectionGuard {
    fn open(metrics: Option<Arc<MetricsCollector>>) -> Self {
        if let Some(metrics) = &metrics {
            metrics.increment_active_connections();
        }
        Self(metrics)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(metrics) = &self.0 {
            metrics.decrement_active_connections();
        }
    }
}

/// Accept loop for the inbound listener.
pub struct ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + PeerAware + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    addr: SocketAddr,
    handler: H,
}

impl<H> ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + PeerAware + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    pub fn new(addr: SocketAddr, handler: H) -> Self {
        Self { addr, handler }
    }

    /// Binds and serves until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = bind_tcp(self.addr).await?;
        info!("HTTP server listening on {}", self.addr);
        serve_with_listener(listener, self.handler, shutdown).await;
        Ok(())
    }
}

/// Serves connections from an already bound listener. Once `shutdown`
/// resolves no new connections are accepted and open ones are asked to
/// finish their in-flight requests.
pub async fn serve_with_listener<H, F>(listener: TcpListener, handler: H, shutdown: F)
where
    H: Service<Request<Body>, Response = Response<Body>> + PeerAware + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
    F: Future<Output = ()> + Send,
{
    let (close_tx, close_rx) = watch::channel(false);
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(%err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let svc = handler.with_peer(peer);
        let guard = ConnectionGuard::open(svc.connection_metrics());
        let mut close_rx = close_rx.clone();

        // One Tokio task per connection.
        tokio::spawn(async move {
            let _guard = guard;
            let conn = Http::new().serve_connection(stream, svc);
            tokio::pin!(conn);

            tokio::select! {
                res = conn.as_mut() => {
                    if let Err(err) = res {
                        debug!(%peer, %err, "connection error");
                    }
                }
                _ = close_rx.changed() => {
                    conn.as_mut().graceful_shutdown();
                    if let Err(err) = conn.as_mut().await {
                        debug!(%peer, %err, "connection error during shutdown");
                    }
                }
            }
        });
    }

    info!("HTTP server stopped accepting connections");
    let _ = close_tx.send(true);
}
