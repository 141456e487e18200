// src/server/admin.rs
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::control::ControlMessage;
use crate::metrics::MetricsRegistry;

/// Side server: Prometheus exposition plus the control-message ingress
/// (`POST /loadbalancer/<app>/join|leave`, `POST /loadbalancer/reload`).
#[derive(Clone)]
pub struct AdminService {
    registry: Option<Arc<MetricsRegistry>>,
    metrics_path: String,
    message_tx: UnboundedSender<ControlMessage>,
}

impl AdminService {
    pub fn new(message_tx: UnboundedSender<ControlMessage>) -> Self {
        Self {
            registry: None,
            metrics_path: "/metrics".to_string(),
            message_tx,
        }
    }

    pub fn with_metrics(mut self, registry: Arc<MetricsRegistry>, path: impl Into<String>) -> Self {
        self.registry = Some(registry);
        self.metrics_path = path.into();
        self
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();

        if req.method() == Method::GET && path == self.metrics_path {
            return match &self.registry {
                Some(registry) => match registry.gather() {
                    Ok(metrics) => Response::builder()
                        .status(StatusCode::OK)
                        .header(CONTENT_TYPE, "text/plain; version=0.0.4")
                        .body(Body::from(metrics))
                        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "Encoding failed.")),
                    Err(e) => {
                        error!("Failed to encode metrics: {}", e);
                        plain(StatusCode::INTERNAL_SERVER_ERROR, "Encoding failed.")
                    }
                },
                None => plain(StatusCode::NOT_FOUND, "Not Found"),
            };
        }

        if req.method() == Method::POST && path.starts_with("/loadbalancer/") {
            let payload = match hyper::body::to_bytes(req.into_body()).await {
                Ok(payload) => payload,
                Err(_) => return plain(StatusCode::BAD_REQUEST, "Bad request."),
            };
            return match ControlMessage::parse(&path, &payload) {
                Ok(message) => {
                    info!(
                        application = message.application().unwrap_or("-"),
                        "Control message received on {}",
                        path
                    );
                    if self.message_tx.send(message).is_err() {
                        return plain(StatusCode::SERVICE_UNAVAILABLE, "Control plane stopped.");
                    }
                    plain(StatusCode::ACCEPTED, "Accepted.")
                }
                Err(e) => {
                    warn!("Rejected control message: {}", e);
                    plain(StatusCode::BAD_REQUEST, &e.to_string())
                }
            };
        }

        plain(StatusCode::NOT_FOUND, "Not Found")
    }
}

fn plain(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
}

/// Binds the side server and runs it until `shutdown` resolves.
pub fn spawn_admin_server<F>(
    addr: SocketAddr,
    service: AdminService,
    shutdown: F,
) -> Result<JoinHandle<()>, hyper::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let make_service = make_service_fn(move |_| {
        let service = service.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let service = service.clone();
                async move { Ok::<_, Infallible>(service.handle(req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?
        .serve(make_service)
        .with_graceful_shutdown(shutdown);
    info!("Admin server listening on http://{}", addr);

    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Admin server error: {}", e);
        }
    }))
}
