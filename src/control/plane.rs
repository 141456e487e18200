// src/control/plane.rs
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ChainBuilder, ControlMessage, Event, EventSink, MembershipBody};
use crate::config::{ConfigError, ConfigSource};
use crate::health::{HealthFailure, HealthMonitor};
use crate::metrics::MetricsCollector;
use crate::routing::{RouteTable, SharedRouteTable};

/// Why a reload was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadTrigger {
    /// SIGHUP or another operator signal.
    Signal,
    /// A watched api route accepted a mutation.
    Mutation { route: String },
    Periodic,
    Admin,
}

impl ReloadTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadTrigger::Signal => "signal",
            ReloadTrigger::Mutation { .. } => "mutation",
            ReloadTrigger::Periodic => "periodic",
            ReloadTrigger::Admin => "admin",
        }
    }
}

/// Senders handed to the request path, health tickers and admin ingress.
#[derive(Clone)]
pub struct ControlChannels {
    pub reload_tx: UnboundedSender<ReloadTrigger>,
    pub failure_tx: UnboundedSender<HealthFailure>,
    pub message_tx: UnboundedSender<ControlMessage>,
}

/// Receiving ends, consumed by [`ControlPlane::run`].
pub struct ControlReceivers {
    reload_rx: UnboundedReceiver<ReloadTrigger>,
    failure_rx: UnboundedReceiver<HealthFailure>,
    message_rx: UnboundedReceiver<ControlMessage>,
}

pub fn control_channels() -> (ControlChannels, ControlReceivers) {
    let (reload_tx, reload_rx) = mpsc::unbounded_channel();
    let (failure_tx, failure_rx) = mpsc::unbounded_channel();
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    (
        ControlChannels {
            reload_tx,
            failure_tx,
            message_tx,
        },
        ControlReceivers {
            reload_rx,
            failure_rx,
            message_rx,
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The backend was (re)appended to this many existing routes.
    Extended(usize),
    /// This many new routes were spliced into the table.
    Created(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Routes the backend was removed from.
    pub removed: usize,
    /// Routes dropped because their last backend left.
    pub pruned: usize,
}

/// Single writer of the active route table.
///
/// Requests read the table lock-free through [`SharedRouteTable`]; every
/// change (reload, join, leave, health removal) runs under `writer` so
/// concurrent changes never lose each other's work.
pub struct ControlPlane {
    table: SharedRouteTable,
    source: Arc<dyn ConfigSource>,
    builder: ChainBuilder,
    events: Arc<dyn EventSink>,
    health: HealthMonitor,
    metrics: Option<Arc<MetricsCollector>>,
    writer: Mutex<()>,
}

impl ControlPlane {
    pub fn new(
        table: SharedRouteTable,
        source: Arc<dyn ConfigSource>,
        builder: ChainBuilder,
        events: Arc<dyn EventSink>,
        health: HealthMonitor,
    ) -> Self {
        Self {
            table,
            source,
            builder,
            events,
            health,
            metrics: None,
            writer: Mutex::new(()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn table(&self) -> SharedRouteTable {
        self.table.clone()
    }

    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Initial load. Any failure, including an empty table, is returned to
    /// the caller, which treats it as fatal.
    pub async fn bootstrap(&self) -> Result<usize, ConfigError> {
        let _guard = self.writer.lock().await;
        info!("Loading routes from {}", self.source.describe());

        let table = self.load_table().await?;
        let routes = table.len();
        self.install(table);
        info!("Loaded {} routes", routes);
        Ok(routes)
    }

    /// Rebuilds the table from the source and swaps it in. On failure the
    /// active table is left untouched.
    pub async fn reload(&self, trigger: ReloadTrigger) -> Result<usize, ConfigError> {
        let _guard = self.writer.lock().await;
        info!(trigger = trigger.as_str(), "Reloading routes from {}", self.source.describe());

        match self.load_table().await {
            Ok(table) => {
                let routes = table.len();
                self.install(table);
                if let Some(metrics) = &self.metrics {
                    metrics.record_reload(true);
                }
                info!("Reloaded {} routes", routes);
                self.emit(Event::reloaded(routes));
                Ok(routes)
            }
            Err(e) => {
                error!("Reload failed, keeping previous routes: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.record_reload(false);
                }
                self.emit(Event::reload_failed(&e));
                Err(e)
            }
        }
    }

    async fn load_table(&self) -> Result<RouteTable, ConfigError> {
        let descriptors = self.source.load().await?;
        let table = self.builder.build_table(&descriptors);
        if table.is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(table)
    }

    fn install(&self, table: RouteTable) {
        self.health.sync(&table);
        if let Some(metrics) = &self.metrics {
            metrics.observe_table(&table);
        }
        self.table.store(Arc::new(table));
    }

    /// Adds `body.target` to an application. Known applications get the
    /// backend appended to each of their balanced routes (an identical entry
    /// is removed first); unknown ones get new routes placed by order.
    pub async fn join(&self, body: &MembershipBody) -> Result<JoinOutcome, ConfigError> {
        let _guard = self.writer.lock().await;
        let current = self.table.load_full();
        let routes = current.routes_for(&body.application);

        let balanced: Vec<_> = routes
            .iter()
            .filter(|route| route.load_balancer().is_some())
            .collect();

        if !balanced.is_empty() {
            for route in &balanced {
                if let Some(lb) = route.load_balancer() {
                    let node = self.builder.proxy_node(&body.target)?;
                    lb.remove_target(&body.target);
                    lb.add_target_rule(node)?;
                }
            }
            if let Some(metrics) = &self.metrics {
                metrics.observe_table(&current);
            }
            info!(
                "Backend {} joined {} ({} routes)",
                body.target,
                body.application,
                balanced.len()
            );
            return Ok(JoinOutcome::Extended(balanced.len()));
        }

        let created = self.builder.build_join_routes(body)?;
        let count = created.len();
        let mut next = RouteTable::clone(&current);
        for route in created {
            next.insert_ordered(Arc::new(route));
        }
        self.install(next);
        info!(
            "Application {} created with backend {} at order {}",
            body.application, body.target, body.order
        );
        Ok(JoinOutcome::Created(count))
    }

    /// Removes `target` from every route of `application` and drops the
    /// routes this left without backends. Unknown backends are a no-op.
    pub async fn leave(&self, application: &str, target: &str) -> LeaveOutcome {
        let _guard = self.writer.lock().await;
        self.leave_locked(application, target)
    }

    fn leave_locked(&self, application: &str, target: &str) -> LeaveOutcome {
        let current = self.table.load_full();
        let mut outcome = LeaveOutcome::default();
        let mut emptied = Vec::new();

        for route in current.routes_for(application) {
            if let Some(lb) = route.load_balancer() {
                if lb.remove_target(target) {
                    outcome.removed += 1;
                    if lb.is_empty() {
                        emptied.push(route.id);
                    }
                }
            }
        }

        if emptied.is_empty() {
            if outcome.removed > 0 {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_table(&current);
                }
            }
        } else {
            let mut next = RouteTable::clone(&current);
            next.retain(|route| !emptied.contains(&route.id));
            outcome.pruned = emptied.len();
            self.install(next);
        }

        if outcome.removed > 0 {
            info!(
                "Backend {} left {} (removed from {}, pruned {})",
                target, application, outcome.removed, outcome.pruned
            );
        } else {
            debug!("Backend {} not part of {}, nothing to do", target, application);
        }
        outcome
    }

    pub async fn apply(&self, message: ControlMessage) {
        match message {
            ControlMessage::Join(body) => {
                if let Err(e) = self.join(&body).await {
                    error!("Join of {} to {} failed: {}", body.target, body.application, e);
                }
            }
            ControlMessage::Leave(body) => {
                self.leave(&body.application, &body.target).await;
            }
            ControlMessage::Reload => {
                let _ = self.reload(ReloadTrigger::Admin).await;
            }
        }
    }

    pub async fn handle_health_failure(&self, failure: HealthFailure) {
        self.emit(Event::health_check_failed(
            &failure.route,
            &failure.backend,
            &failure.detail,
        ));

        if !failure.remove || failure.backend.is_empty() {
            return;
        }

        let _guard = self.writer.lock().await;
        // The failure may come from a table that has since been replaced.
        if self.table.load().get(&failure.route_id).is_none() {
            debug!("Ignoring health failure from retired route {}", failure.route);
            return;
        }
        let outcome = self.leave_locked(&failure.application, &failure.backend);
        if outcome.removed > 0 {
            warn!(
                "Removed unhealthy backend {} from {}",
                failure.backend, failure.application
            );
            self.emit(Event::backend_removed(&failure.application, &failure.backend));
        }
    }

    fn emit(&self, event: Event) {
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = events.send(&event).await {
                warn!(event_id = event.event_id, "Failed to deliver event: {}", e);
            }
        });
    }

    /// Serves control traffic until `shutdown_rx` flips. Bursts of reload
    /// triggers collapse into one rebuild.
    pub async fn run(self: Arc<Self>, mut receivers: ControlReceivers, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                Some(trigger) = receivers.reload_rx.recv() => {
                    let mut coalesced = 0;
                    while receivers.reload_rx.try_recv().is_ok() {
                        coalesced += 1;
                    }
                    if coalesced > 0 {
                        debug!("Coalesced {} extra reload triggers", coalesced);
                    }
                    let _ = self.reload(trigger).await;
                }
                Some(failure) = receivers.failure_rx.recv() => {
                    self.handle_health_failure(failure).await;
                }
                Some(message) = receivers.message_rx.recv() => {
                    self.apply(message).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.health.shutdown();
        info!("Control plane stopped");
    }
}

/// Requests a reload every `every` until shutdown.
pub fn spawn_refresh(
    reload_tx: UnboundedSender<ReloadTrigger>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if reload_tx.send(ReloadTrigger::Periodic).is_err() {
                        break;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Forwards SIGHUP as a reload trigger.
#[cfg(unix)]
pub fn spawn_signal_reload(
    reload_tx: UnboundedSender<ReloadTrigger>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() || reload_tx.send(ReloadTrigger::Signal).is_err() {
                        break;
                    }
                    info!("SIGHUP received, reloading routes");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouteDescriptor, Settings};
    use crate::control::LogEventSink;
    use crate::routing::shared_table;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Serves whatever descriptor list it currently holds, or an error.
    struct StaticSource {
        descriptors: StdMutex<Result<Vec<RouteDescriptor>, String>>,
    }

    impl StaticSource {
        fn json(doc: &str) -> Arc<Self> {
            Arc::new(Self {
                descriptors: StdMutex::new(Ok(crate::config::parse_json_descriptors(doc).unwrap())),
            })
        }

        fn fail(&self) {
            *self.descriptors.lock().unwrap() = Err("backend down".to_string());
        }
    }

    #[async_trait]
    impl ConfigSource for StaticSource {
        async fn load(&self) -> Result<Vec<RouteDescriptor>, ConfigError> {
            self.descriptors
                .lock()
                .unwrap()
                .clone()
                .map_err(ConfigError::Parse)
        }

        fn describe(&self) -> String {
            "static".to_string()
        }
    }

    fn plane(source: Arc<StaticSource>) -> ControlPlane {
        let (channels, _receivers) = control_channels();
        ControlPlane::new(
            shared_table(RouteTable::new()),
            source,
            ChainBuilder::new(&Settings::default()),
            Arc::new(LogEventSink),
            HealthMonitor::new(channels.failure_tx),
        )
    }

    const ROUTES: &str = r#"[
        {"Type": "proxy-target", "Path": "http://shop.test/", "Application": "shop",
         "Backends": [{"Backend": "http://10.0.0.1"}, {"Backend": "http://10.0.0.2"}]},
        {"Type": "content-target", "Path": "http://shop.test/about", "Content": "about"}
    ]"#;

    fn join_body(application: &str, target: &str, order: i64) -> MembershipBody {
        MembershipBody {
            application: application.to_string(),
            target: target.to_string(),
            order,
            ..MembershipBody::default()
        }
    }

    #[tokio::test]
    async fn reload_failure_keeps_previous_table() {
        let source = StaticSource::json(ROUTES);
        let plane = plane(source.clone());
        assert_eq!(plane.bootstrap().await.unwrap(), 2);
        let before = plane.snapshot();

        source.fail();
        assert!(plane.reload(ReloadTrigger::Signal).await.is_err());
        assert!(Arc::ptr_eq(&before, &plane.snapshot()));
    }

    #[tokio::test]
    async fn empty_reload_is_rejected() {
        let source = StaticSource::json(ROUTES);
        let plane = plane(source.clone());
        plane.bootstrap().await.unwrap();

        *source.descriptors.lock().unwrap() = Ok(Vec::new());
        assert!(matches!(
            plane.reload(ReloadTrigger::Admin).await,
            Err(ConfigError::Empty)
        ));
        assert_eq!(plane.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn join_existing_application_is_idempotent() {
        let plane = plane(StaticSource::json(ROUTES));
        plane.bootstrap().await.unwrap();

        let body = join_body("shop", "http://10.0.0.1", 0);
        assert_eq!(plane.join(&body).await.unwrap(), JoinOutcome::Extended(1));
        assert_eq!(plane.join(&body).await.unwrap(), JoinOutcome::Extended(1));

        let table = plane.snapshot();
        let lb = table.routes_for("shop")[0].load_balancer().unwrap().targets();
        assert_eq!(lb, vec!["http://10.0.0.2", "http://10.0.0.1"]);
    }

    #[tokio::test]
    async fn join_new_application_is_placed_by_order() {
        let plane = plane(StaticSource::json(ROUTES));
        plane.bootstrap().await.unwrap();

        plane.join(&join_body("/late", "http://10.0.1.1", 10)).await.unwrap();
        plane.join(&join_body("/early", "http://10.0.1.2", -1)).await.unwrap();

        assert_eq!(
            plane.snapshot().prefixes(),
            vec!["/early", "http://shop.test/about", "http://shop.test/", "/late"]
        );
    }

    #[tokio::test]
    async fn joined_application_shadows_same_order_prefix() {
        let plane = plane(StaticSource::json(ROUTES));
        plane.bootstrap().await.unwrap();

        let body = MembershipBody {
            routes: vec!["http://shop.test/".to_string()],
            ..join_body("shop-v2", "http://10.0.2.1", 0)
        };
        assert_eq!(plane.join(&body).await.unwrap(), JoinOutcome::Created(1));

        let table = plane.snapshot();
        assert_eq!(table.find("http://shop.test/cart").unwrap().application, "shop-v2");
    }

    #[tokio::test]
    async fn leaving_last_backend_prunes_route() {
        let plane = plane(StaticSource::json(ROUTES));
        plane.bootstrap().await.unwrap();

        assert_eq!(plane.leave("shop", "http://10.0.0.9").await, LeaveOutcome::default());
        assert_eq!(
            plane.leave("shop", "http://10.0.0.1").await,
            LeaveOutcome { removed: 1, pruned: 0 }
        );
        assert_eq!(
            plane.leave("shop", "http://10.0.0.2").await,
            LeaveOutcome { removed: 1, pruned: 1 }
        );
        assert!(plane.snapshot().routes_for("shop").is_empty());
        assert_eq!(plane.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn health_failure_removes_backend_when_asked() {
        let plane = plane(StaticSource::json(ROUTES));
        plane.bootstrap().await.unwrap();
        let route = plane.snapshot().routes_for("shop")[0].clone();

        let failure = HealthFailure {
            route_id: route.id,
            route: route.path_prefix.clone(),
            application: "shop".to_string(),
            backend: "http://10.0.0.1".to_string(),
            detail: "expected 200, got 503".to_string(),
            remove: true,
        };
        plane.handle_health_failure(failure.clone()).await;
        assert_eq!(route.load_balancer().unwrap().targets(), vec!["http://10.0.0.2"]);

        // Failures reported by a retired table are ignored.
        plane.reload(ReloadTrigger::Periodic).await.unwrap();
        plane
            .handle_health_failure(HealthFailure {
                backend: "http://10.0.0.2".to_string(),
                ..failure
            })
            .await;
        let fresh = plane.snapshot().routes_for("shop")[0].clone();
        assert_eq!(fresh.load_balancer().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_applies_messages_until_shutdown() {
        let source = StaticSource::json(ROUTES);
        let (channels, receivers) = control_channels();
        let plane = Arc::new(ControlPlane::new(
            shared_table(RouteTable::new()),
            source,
            ChainBuilder::new(&Settings::default()),
            Arc::new(LogEventSink),
            HealthMonitor::new(channels.failure_tx.clone()),
        ));
        plane.bootstrap().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(plane.clone().run(receivers, shutdown_rx));

        let shop_backends = |plane: &Arc<ControlPlane>| {
            plane.snapshot().routes_for("shop")[0]
                .load_balancer()
                .map(|lb| lb.len())
                .unwrap_or(0)
        };

        channels
            .message_tx
            .send(ControlMessage::Leave(join_body("shop", "http://10.0.0.1", 0)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shop_backends(&plane), 1);

        // A rebuild restores both backends.
        channels.reload_tx.send(ReloadTrigger::Admin).unwrap();
        channels.reload_tx.send(ReloadTrigger::Admin).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(shop_backends(&plane), 2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
