// tests/load_balancer_tests.rs
use async_trait::async_trait;
use chain_balancer::config::{parse_json_descriptors, ConfigError, ConfigSource, RouteDescriptor, Settings};
use chain_balancer::control::{
    control_channels, ChainBuilder, ControlChannels, ControlPlane, ControlReceivers, JoinOutcome,
    LogEventSink, MembershipBody, ReloadTrigger,
};
use chain_balancer::health::HealthMonitor;
use chain_balancer::routing::{shared_table, RouteTable};
use chain_balancer::server::{serve_with_listener, RequestHandler};
use hyper::{Body, Request, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Descriptor source backed by memory; counts how often it was read.
struct MemorySource {
    doc: Mutex<String>,
    loads: AtomicUsize,
}

impl MemorySource {
    fn new(doc: String) -> Arc<Self> {
        Arc::new(Self {
            doc: Mutex::new(doc),
            loads: AtomicUsize::new(0),
        })
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for MemorySource {
    async fn load(&self) -> Result<Vec<RouteDescriptor>, ConfigError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let doc = self.doc.lock().unwrap().clone();
        parse_json_descriptors(&doc)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

fn start_plane(source: Arc<MemorySource>) -> (Arc<ControlPlane>, ControlChannels, ControlReceivers) {
    let (channels, receivers) = control_channels();
    let plane = ControlPlane::new(
        shared_table(RouteTable::new()),
        source,
        ChainBuilder::new(&Settings::default()).with_reload_sender(channels.reload_tx.clone()),
        Arc::new(LogEventSink),
        HealthMonitor::new(channels.failure_tx.clone()),
    );
    (Arc::new(plane), channels, receivers)
}

fn get(host: &str, path: &str) -> Request<Body> {
    Request::get(path)
        .header("host", host)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let mut servers = Vec::new();
    let mut mocks = Vec::new();
    for _ in 0..3 {
        let mut server = mockito::Server::new_async().await;
        mocks.push(
            server
                .mock("GET", "/items")
                .with_status(200)
                .expect(3)
                .create_async()
                .await,
        );
        servers.push(server);
    }

    let backends: Vec<String> = servers
        .iter()
        .map(|s| format!(r#"{{"Backend": "{}"}}"#, s.url()))
        .collect();
    let doc = format!(
        r#"[{{"Type": "proxy-target", "Path": "http://front.test/", "Method": "round-robin", "Backends": [{}]}}]"#,
        backends.join(",")
    );

    let (plane, _channels, _receivers) = start_plane(MemorySource::new(doc));
    plane.bootstrap().await.unwrap();
    let handler = RequestHandler::new(plane.table(), "http");

    for _ in 0..9 {
        let response = handler.handle(get("front.test", "/items")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    for mock in mocks {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn test_health_check_removes_unhealthy_backends() {
    let mut healthy = mockito::Server::new_async().await;
    healthy.mock("GET", "/health").with_status(200).create_async().await;
    let mut failing = mockito::Server::new_async().await;
    failing.mock("GET", "/health").with_status(503).create_async().await;

    let doc = format!(
        r#"[{{"Type": "proxy-target", "Path": "http://front.test/", "Application": "front",
              "Backends": [{{"Backend": "{}"}}, {{"Backend": "{}"}}],
              "Healthcheck": {{"Path": "/health", "Interval": 1, "Timeout": 1, "RemoveOnFailure": true}}}}]"#,
        healthy.url(),
        failing.url()
    );

    let (plane, _channels, receivers) = start_plane(MemorySource::new(doc));
    plane.bootstrap().await.unwrap();
    assert_eq!(plane.health().active(), 1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(plane.clone().run(receivers, shutdown_rx));

    let route = plane.snapshot().routes_for("front")[0].clone();
    let lb_targets = || route.load_balancer().unwrap().targets();

    let mut removed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if lb_targets() == vec![healthy.url()] {
            removed = true;
            break;
        }
    }
    assert!(removed, "failing backend still present: {:?}", lb_targets());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(plane.health().active(), 0);
}

#[tokio::test]
async fn test_join_leave_round_trip() {
    let doc = r#"[{"Type": "proxy-target", "Path": "http://shop.test/", "Application": "shop",
                   "Backends": [{"Backend": "http://10.1.0.1"}]}]"#;
    let (plane, _channels, _receivers) = start_plane(MemorySource::new(doc.to_string()));
    plane.bootstrap().await.unwrap();

    let x = MembershipBody {
        application: "shop".to_string(),
        target: "http://10.1.0.2".to_string(),
        ..MembershipBody::default()
    };
    assert_eq!(plane.join(&x).await.unwrap(), JoinOutcome::Extended(1));
    assert_eq!(plane.join(&x).await.unwrap(), JoinOutcome::Extended(1));

    let outcome = plane.leave("shop", "http://10.1.0.2").await;
    assert_eq!(outcome.removed, 1);
    let targets = plane.snapshot().routes_for("shop")[0]
        .load_balancer()
        .unwrap()
        .targets();
    assert_eq!(targets, vec!["http://10.1.0.1"]);

    // Leaving twice changes nothing; leaving the last backend prunes.
    assert_eq!(plane.leave("shop", "http://10.1.0.2").await.removed, 0);
    assert_eq!(plane.leave("shop", "http://10.1.0.1").await.pruned, 1);

    let handler = RequestHandler::new(plane.table(), "http");
    let response = handler.handle(get("shop.test", "/cart")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_api_mutation_triggers_reload() {
    let mut api = mockito::Server::new_async().await;
    api.mock("POST", "/orders").with_status(200).create_async().await;
    api.mock("GET", "/orders").with_status(200).create_async().await;

    let doc = format!(
        r#"[{{"Type": "api-target", "Path": "http://api.test/", "Backends": [{{"Backend": "{}"}}]}}]"#,
        api.url()
    );
    let source = MemorySource::new(doc);
    let (plane, _channels, receivers) = start_plane(source.clone());
    plane.bootstrap().await.unwrap();
    assert_eq!(source.loads(), 1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(plane.clone().run(receivers, shutdown_rx));
    let handler = RequestHandler::new(plane.table(), "http");

    handler.handle(get("api.test", "/orders")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(source.loads(), 1);

    let post = Request::post("/orders")
        .header("host", "api.test")
        .body(Body::from(r#"{"item": 1}"#))
        .unwrap();
    assert_eq!(handler.handle(post).await.status(), StatusCode::OK);

    let mut reloaded = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if source.loads() == 2 {
            reloaded = true;
            break;
        }
    }
    assert!(reloaded);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_listener_forwards_caller_address() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut upstream = mockito::Server::new_async().await;
    let mock = upstream
        .mock("GET", "/api/ping")
        .match_header("x-forwarded-for", "10.9.9.9, 127.0.0.1")
        .match_header("x-forwarded-host", addr.to_string().as_str())
        .match_header("x-forwarded-proto", "http")
        .with_status(200)
        .with_body("pong")
        .create_async()
        .await;

    let doc = format!(
        r#"[{{"Type": "proxy-target", "Path": "http://{}/api", "Backends": [{{"Backend": "{}"}}]}}]"#,
        addr,
        upstream.url()
    );
    let (plane, _channels, _receivers) = start_plane(MemorySource::new(doc));
    plane.bootstrap().await.unwrap();

    let handler = RequestHandler::new(plane.table(), "http");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve_with_listener(listener, handler, async move {
        let mut rx = shutdown_rx;
        let _ = rx.changed().await;
    }));

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/api/ping", addr))
        .header("X-Forwarded-For", "10.9.9.9")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "pong");
    mock.assert_async().await;

    let missing = client
        .get(format!("http://{}/elsewhere", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(missing.text().await.unwrap(), "Not found (elsewhere).");

    shutdown_tx.send(true).unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_reload_swaps_table_for_new_requests() {
    let source = MemorySource::new(
        r#"[{"Type": "content-target", "Path": "http://front.test/", "Content": "v1"}]"#.to_string(),
    );
    let (plane, _channels, _receivers) = start_plane(source.clone());
    plane.bootstrap().await.unwrap();
    let handler = RequestHandler::new(plane.table(), "http");

    let body = |response: hyper::Response<Body>| async move {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    };
    assert_eq!(body(handler.handle(get("front.test", "/")).await).await, "v1");

    *source.doc.lock().unwrap() =
        r#"[{"Type": "content-target", "Path": "http://front.test/", "Content": "v2"}]"#.to_string();
    plane.reload(ReloadTrigger::Signal).await.unwrap();
    assert_eq!(body(handler.handle(get("front.test", "/")).await).await, "v2");
}
