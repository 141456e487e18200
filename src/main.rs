// src/main.rs
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use chain_balancer::{
    config::{self, Settings},
    control::{self, ChainBuilder, ControlPlane},
    health::HealthMonitor,
    metrics::{spawn_flush, MetricsRegistry, StatsRegistry},
    routing::{shared_table, RouteTable},
    server::{spawn_admin_server, AdminService, RequestHandler, ServerBuilder},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chain_balancer=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load settings
    let settings_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = config::load_settings(settings_path.as_deref())
        .context("Failed to load settings")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (channels, receivers) = control::control_channels();

    // Initialize metrics
    let metrics_registry = Arc::new(MetricsRegistry::new()?);
    let metrics = metrics_registry.collector();
    let stats_registry = Arc::new(StatsRegistry::new());

    // Build the control plane and load the initial routes; failure here is fatal.
    let table = shared_table(RouteTable::new());
    let source = config::source_from_settings(&settings)?;
    let events = control::sink_from_settings(&settings)?;
    let builder = ChainBuilder::new(&settings).with_reload_sender(channels.reload_tx.clone());
    let health = HealthMonitor::new(channels.failure_tx.clone())
        .with_metrics(metrics.clone())
        .with_scheme(settings.listen.scheme.clone());

    let plane = Arc::new(
        ControlPlane::new(table.clone(), source, builder, events, health)
            .with_metrics(metrics.clone()),
    );
    let routes = plane
        .bootstrap()
        .await
        .context("Initial configuration load failed")?;
    info!("Serving {} routes", routes);

    let control_task = tokio::spawn(plane.clone().run(receivers, shutdown_rx.clone()));
    spawn_background(&settings, &channels, &stats_registry, &shutdown_rx);

    // Start admin server if enabled
    if settings.metrics.enabled {
        let admin_addr: SocketAddr = ([0, 0, 0, 0], settings.metrics.port).into();
        let admin = AdminService::new(channels.message_tx.clone())
            .with_metrics(metrics_registry.clone(), settings.metrics.path.clone());
        spawn_admin_server(admin_addr, admin, wait_for(shutdown_rx.clone()))?;
    }

    // Create request handler
    let handler = RequestHandler::new(table, settings.listen.scheme.clone())
        .with_static_headers(settings.static_header_map()?)
        .with_access_log(settings.log_requests)
        .with_request_timeout(settings.upstream_timeout())
        .with_metrics(metrics)
        .with_stats(stats_registry);

    // Start main server
    let addr = settings.listen_addr()?;
    info!("Starting load balancer on {}", addr);

    ServerBuilder::new(addr, handler)
        .serve(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = control_task.await;
    Ok(())
}

fn spawn_background(
    settings: &Settings,
    channels: &control::ControlChannels,
    stats_registry: &Arc<StatsRegistry>,
    shutdown_rx: &watch::Receiver<bool>,
) {
    spawn_flush(
        stats_registry.clone(),
        settings.stats_interval(),
        shutdown_rx.clone(),
    );

    if let Some(every) = settings.refresh_interval() {
        info!("Refreshing routes every {:?}", every);
        control::spawn_refresh(channels.reload_tx.clone(), every, shutdown_rx.clone());
    }

    spawn_hangup_reload(channels, shutdown_rx);
}

#[cfg(unix)]
fn spawn_hangup_reload(channels: &control::ControlChannels, shutdown_rx: &watch::Receiver<bool>) {
    if let Err(e) = control::spawn_signal_reload(channels.reload_tx.clone(), shutdown_rx.clone()) {
        warn!("SIGHUP reloads unavailable: {}", e);
    }
}

#[cfg(not(unix))]
fn spawn_hangup_reload(_channels: &control::ControlChannels, _shutdown_rx: &watch::Receiver<bool>) {}

async fn wait_for(mut shutdown_rx: watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
