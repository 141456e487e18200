//! demos/echo_backend.rs
//! Run: cargo run --example echo_backend -- <port> [name]
//!
//! Answers every request with a JSON description of what arrived, including
//! the forwarding headers the balancer adds. `/health` answers 200 until
//! `POST /health/toggle` flips it to 503.

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use serde_json::json;
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

#[derive(Clone)]
struct EchoState {
    name: String,
    served: Arc<AtomicU64>,
    healthy: Arc<AtomicBool>,
}

fn header(req: &Request<Body>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn handle(req: Request<Body>, state: EchoState) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_owned();

    match (req.method(), path.as_str()) {
        (&Method::GET, "/health") => {
            let status = if state.healthy.load(Ordering::SeqCst) {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let mut response = Response::new(Body::from(status.canonical_reason().unwrap_or("")));
            *response.status_mut() = status;
            return Ok(response);
        }
        (&Method::POST, "/health/toggle") => {
            let was = state.healthy.fetch_xor(true, Ordering::SeqCst);
            println!("[{}] health → {}", state.name, if was { "failing" } else { "ok" });
            return Ok(Response::new(Body::from("toggled")));
        }
        _ => {}
    }

    let served = state.served.fetch_add(1, Ordering::SeqCst) + 1;
    let method = req.method().to_string();
    let forwarded_for = header(&req, "x-forwarded-for");
    let forwarded_host = header(&req, "x-forwarded-host");
    let forwarded_proto = header(&req, "x-forwarded-proto");
    let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();

    let echo = json!({
        "backend": state.name,
        "served": served,
        "method": method,
        "path": path,
        "body_bytes": body.len(),
        "x_forwarded_for": forwarded_for,
        "x_forwarded_host": forwarded_host,
        "x_forwarded_proto": forwarded_proto,
    });

    let mut response = Response::new(Body::from(echo.to_string()));
    response.headers_mut().insert(
        "content-type",
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "8001".into())
        .parse()?;
    let name = std::env::args()
        .nth(2)
        .unwrap_or_else(|| format!("echo-{port}"));

    let state = EchoState {
        name: name.clone(),
        served: Arc::new(AtomicU64::new(0)),
        healthy: Arc::new(AtomicBool::new(true)),
    };

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let make_svc = make_service_fn(move |_conn| {
        let st = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, st.clone()))) }
    });

    println!("Echo backend '{}' on http://{}", name, addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}
