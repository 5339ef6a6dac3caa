//! Per-upstream health tracking.
//!
//! Two inputs drive the same state machine: scheduled `/health` probes and
//! failures reported by the forwarder. Both go through [`HealthRegistry`],
//! which owns the one consecutive-failure counter and the one threshold.
//!
//! ```text
//! unknown ──success──▶ healthy ◀──success── unhealthy
//!    │                    │                      ▲
//!    └──── N failures ────┴───── N failures ─────┘
//! ```

use crate::resolver::{EndpointResolver, ServiceEndpoint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Health classification of one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Current health of one registered service.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub service_name: String,
    pub status: HealthStatus,
    /// When the last probe or reported failure landed.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Duration of the last probe, if any.
    #[serde(rename = "last_latency_ms", serialize_with = "latency_millis")]
    pub last_latency: Option<Duration>,
    /// Reset to zero by any healthy probe.
    pub consecutive_failures: u32,
}

fn latency_millis<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&(d.as_millis() as u64)),
        None => s.serialize_none(),
    }
}

impl HealthRecord {
    fn new(service_name: String) -> Self {
        Self {
            service_name,
            status: HealthStatus::Unknown,
            last_checked_at: None,
            last_latency: None,
            consecutive_failures: 0,
        }
    }
}

/// Status before and after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: HealthStatus,
    pub current: HealthStatus,
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Thread-safe health map with a single shared failure threshold.
///
/// Only registered services have a record; updates for other names are
/// ignored and reads report [`HealthStatus::Unknown`].
#[derive(Debug)]
pub struct HealthRegistry {
    records: RwLock<HashMap<String, HealthRecord>>,
    threshold: u32,
}

impl HealthRegistry {
    pub fn new<I, S>(services: I, threshold: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = services
            .into_iter()
            .map(|name| {
                let name = name.into();
                (name.clone(), HealthRecord::new(name))
            })
            .collect();
        Self {
            records: RwLock::new(records),
            threshold: threshold.max(1),
        }
    }

    /// Consecutive failures that mark a service unhealthy.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Copy of one record, `None` for unregistered names.
    pub fn get(&self, name: &str) -> Option<HealthRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.get(name).cloned()
    }

    pub fn status(&self, name: &str) -> HealthStatus {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .get(name)
            .map(|r| r.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Reset the failure count and mark healthy.
    pub fn set_healthy(&self, name: &str, latency: Option<Duration>) -> Option<StatusChange> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records.get_mut(name)?;
        let previous = record.status;
        record.consecutive_failures = 0;
        record.status = HealthStatus::Healthy;
        record.last_checked_at = Some(Utc::now());
        if latency.is_some() {
            record.last_latency = latency;
        }
        Some(StatusChange {
            previous,
            current: record.status,
        })
    }

    /// Count one failure; mark unhealthy once the threshold is reached.
    pub fn record_failure(&self, name: &str, latency: Option<Duration>) -> Option<StatusChange> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records.get_mut(name)?;
        let previous = record.status;
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_checked_at = Some(Utc::now());
        if latency.is_some() {
            record.last_latency = latency;
        }
        if record.consecutive_failures >= self.threshold {
            record.status = HealthStatus::Unhealthy;
        }
        Some(StatusChange {
            previous,
            current: record.status,
        })
    }

    /// Consistent copy of every record, sorted by service name.
    pub fn snapshot(&self) -> Vec<HealthRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<HealthRecord> = records.values().cloned().collect();
        snapshot.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        snapshot
    }
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

/// Checks whether an upstream is alive.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self, endpoint: &ServiceEndpoint) -> ProbeOutcome;
}

/// `GET <base>/health` with a bounded timeout; any 2xx is healthy.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, endpoint: &ServiceEndpoint) -> ProbeOutcome {
        let url = endpoint.url_for("/health");
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Healthy,
            Ok(resp) => ProbeOutcome::Unhealthy(format!("status {}", resp.status())),
            Err(e) if e.is_timeout() => ProbeOutcome::Unhealthy("timeout".to_string()),
            Err(e) => ProbeOutcome::Unhealthy(e.to_string()),
        }
    }
}

/// Keeps [`HealthRegistry`] current by periodic probing and reactive reports.
pub struct HealthMonitor {
    registry: Arc<HealthRegistry>,
    resolver: Arc<EndpointResolver>,
    probe: Arc<dyn HealthProbe>,
    probe_permits: Arc<Semaphore>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<HealthRegistry>,
        resolver: Arc<EndpointResolver>,
        probe: Arc<dyn HealthProbe>,
        max_concurrent_probes: usize,
    ) -> Self {
        Self {
            registry,
            resolver,
            probe,
            probe_permits: Arc::new(Semaphore::new(max_concurrent_probes.max(1))),
        }
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    pub fn status(&self, name: &str) -> HealthStatus {
        self.registry.status(name)
    }

    /// Report a failed forwarded request.
    pub fn record_failure(&self, name: &str) {
        if let Some(change) = self.registry.record_failure(name, None) {
            log_change(name, change);
        }
    }

    /// Spawn the periodic probe loop. Each tick starts one round in the
    /// background so a slow round never delays the next tick. Rounds still
    /// in flight are aborted on shutdown.
    pub fn start(
        self: Arc<Self>,
        period: Duration,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Health monitor started ({} services, every {:?}, threshold {})",
                self.resolver.len(),
                period,
                self.registry.threshold()
            );
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut rounds = JoinSet::new();

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        info!("Health monitor received shutdown signal");
                        break;
                    }

                    _ = ticker.tick() => {
                        // Reap finished rounds so the set stays small.
                        while rounds.try_join_next().is_some() {}
                        let monitor = self.clone();
                        rounds.spawn(async move { monitor.check_all().await });
                    }
                }
            }

            if !rounds.is_empty() {
                debug!("Aborting {} probe round(s) in flight", rounds.len());
            }
            rounds.shutdown().await;
        })
    }

    /// Probe every registered service once and wait for all results.
    pub async fn check_all(&self) {
        let mut round = JoinSet::new();
        for endpoint in self.resolver.endpoints() {
            let registry = self.registry.clone();
            let probe = self.probe.clone();
            let permits = self.probe_permits.clone();
            round.spawn(async move {
                // Closed only if the monitor is dropped mid-round.
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                run_probe(&registry, probe.as_ref(), &endpoint).await;
            });
        }
        while let Some(res) = round.join_next().await {
            if let Err(e) = res {
                warn!("Health probe task failed: {}", e);
            }
        }
    }
}

async fn run_probe(registry: &HealthRegistry, probe: &dyn HealthProbe, endpoint: &ServiceEndpoint) {
    let started = Instant::now();
    let outcome = probe.probe(endpoint).await;
    let latency = started.elapsed();

    let change = match &outcome {
        ProbeOutcome::Healthy => {
            counter!("gateway_health_probes_total", "service" => endpoint.name.clone(), "result" => "healthy").increment(1);
            debug!("Probe {} healthy in {:?}", endpoint.name, latency);
            registry.set_healthy(&endpoint.name, Some(latency))
        }
        ProbeOutcome::Unhealthy(reason) => {
            counter!("gateway_health_probes_total", "service" => endpoint.name.clone(), "result" => "unhealthy").increment(1);
            debug!("Probe {} failed in {:?}: {}", endpoint.name, latency, reason);
            registry.record_failure(&endpoint.name, Some(latency))
        }
    };

    if let Some(change) = change {
        log_change(&endpoint.name, change);
    }
}

fn log_change(name: &str, change: StatusChange) {
    let healthy = if change.current == HealthStatus::Healthy { 1.0 } else { 0.0 };
    gauge!("gateway_upstream_healthy", "service" => name.to_string()).set(healthy);

    if !change.changed() {
        return;
    }
    match change.current {
        HealthStatus::Unhealthy => warn!("Service {} marked unhealthy", name),
        HealthStatus::Healthy => info!("Service {} is healthy", name),
        HealthStatus::Unknown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::upstream_client;
    use axum::http::StatusCode;
    use axum::response::Redirect;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    /// Replays a fixed outcome per service.
    struct ScriptedProbe {
        outcomes: Mutex<HashMap<String, ProbeOutcome>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new() -> Self {
            Self {
                outcomes: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn set(&self, name: &str, outcome: ProbeOutcome) {
            self.outcomes.lock().unwrap().insert(name.to_string(), outcome);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, endpoint: &ServiceEndpoint) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .get(&endpoint.name)
                .cloned()
                .unwrap_or(ProbeOutcome::Healthy)
        }
    }

    fn monitor(names: &[&str], probe: Arc<ScriptedProbe>) -> HealthMonitor {
        let resolver = EndpointResolver::new(names.iter().map(|n| {
            ServiceEndpoint::new(*n, format!("http://{}:80", n), Duration::from_secs(1), 0)
        }));
        let registry = Arc::new(HealthRegistry::new(resolver.names(), 3));
        HealthMonitor::new(registry, Arc::new(resolver), probe, 2)
    }

    #[test]
    fn test_never_probed_is_unknown() {
        let registry = HealthRegistry::new(["auth", "chat"], 3);
        assert_eq!(registry.status("auth"), HealthStatus::Unknown);
        assert_eq!(registry.status("chat"), HealthStatus::Unknown);
        assert_eq!(registry.status("missing"), HealthStatus::Unknown);
    }

    #[test]
    fn test_threshold_then_immediate_recovery() {
        let registry = HealthRegistry::new(["auth"], 3);
        registry.set_healthy("auth", None);

        registry.record_failure("auth", None);
        registry.record_failure("auth", None);
        assert_eq!(registry.status("auth"), HealthStatus::Healthy);

        let change = registry.record_failure("auth", None).unwrap();
        assert!(change.changed());
        assert_eq!(change.current, HealthStatus::Unhealthy);
        assert_eq!(registry.get("auth").unwrap().consecutive_failures, 3);

        let change = registry.set_healthy("auth", None).unwrap();
        assert_eq!(change.previous, HealthStatus::Unhealthy);
        assert_eq!(change.current, HealthStatus::Healthy);
        assert_eq!(registry.get("auth").unwrap().consecutive_failures, 0);
    }

    #[test]
    fn test_failures_below_threshold_keep_unknown() {
        let registry = HealthRegistry::new(["auth"], 3);
        registry.record_failure("auth", None);
        registry.record_failure("auth", None);
        assert_eq!(registry.status("auth"), HealthStatus::Unknown);
        registry.record_failure("auth", None);
        assert_eq!(registry.status("auth"), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_unregistered_updates_ignored() {
        let registry = HealthRegistry::new(["auth"], 3);
        assert!(registry.record_failure("billing", None).is_none());
        assert!(registry.set_healthy("billing", None).is_none());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_probe_round_updates_every_service() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set("chat", ProbeOutcome::Unhealthy("status 500".into()));
        let monitor = monitor(&["auth", "chat", "world"], probe.clone());

        monitor.check_all().await;

        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.status("auth"), HealthStatus::Healthy);
        assert_eq!(monitor.status("world"), HealthStatus::Healthy);
        let chat = monitor.registry().get("chat").unwrap();
        assert_eq!(chat.status, HealthStatus::Unknown);
        assert_eq!(chat.consecutive_failures, 1);
        assert!(chat.last_checked_at.is_some());
        assert!(chat.last_latency.is_some());
    }

    #[tokio::test]
    async fn test_mixed_probe_and_reactive_failures_share_counter() {
        let probe = Arc::new(ScriptedProbe::new());
        let monitor = monitor(&["auth"], probe.clone());
        monitor.check_all().await;
        assert_eq!(monitor.status("auth"), HealthStatus::Healthy);

        probe.set("auth", ProbeOutcome::Unhealthy("timeout".into()));
        monitor.check_all().await;
        monitor.record_failure("auth");
        assert_eq!(monitor.status("auth"), HealthStatus::Healthy);
        monitor.check_all().await;
        assert_eq!(monitor.status("auth"), HealthStatus::Unhealthy);

        probe.set("auth", ProbeOutcome::Healthy);
        monitor.check_all().await;
        assert_eq!(monitor.status("auth"), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_start_probes_on_first_tick_and_stops() {
        let probe = Arc::new(ScriptedProbe::new());
        let monitor = Arc::new(monitor(&["auth"], probe.clone()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let handle = monitor.clone().start(Duration::from_secs(60), shutdown_rx);

        for _ in 0..50 {
            if monitor.status("auth") == HealthStatus::Healthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(monitor.status("auth"), HealthStatus::Healthy);

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_record_serializes_latency_in_millis() {
        let registry = HealthRegistry::new(["auth"], 3);
        registry.set_healthy("auth", Some(Duration::from_millis(42)));
        let json = serde_json::to_value(registry.get("auth").unwrap()).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["last_latency_ms"], 42);
        assert_eq!(json["consecutive_failures"], 0);
    }

    /// Never answers; holds `token` while pending.
    struct HangingProbe {
        token: Arc<()>,
    }

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self, _endpoint: &ServiceEndpoint) -> ProbeOutcome {
            let _held = self.token.clone();
            std::future::pending::<ProbeOutcome>().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_aborts_rounds_in_flight() {
        let token = Arc::new(());
        let resolver = Arc::new(EndpointResolver::new(vec![ServiceEndpoint::new(
            "auth",
            "http://auth:80",
            Duration::from_secs(1),
            0,
        )]));
        let registry = Arc::new(HealthRegistry::new(resolver.names(), 3));
        let probe = Arc::new(HangingProbe {
            token: token.clone(),
        });
        let monitor = Arc::new(HealthMonitor::new(registry, resolver, probe, 1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let handle = monitor.clone().start(Duration::from_millis(20), shutdown_rx);
        for _ in 0..100 {
            if Arc::strong_count(&token) > 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(Arc::strong_count(&token) > 1);

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();

        for _ in 0..100 {
            if Arc::strong_count(&token) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(&token), 1);
        assert_eq!(monitor.status("auth"), HealthStatus::Unknown);
    }

    async fn spawn_upstream() -> String {
        let app = Router::new()
            .route("/up/health", get(|| async { "ok" }))
            .route(
                "/down/health",
                get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
            )
            .route("/moved/health", get(|| async { Redirect::to("/up/health") }))
            .route(
                "/hung/health",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    "late"
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn endpoint(base: &str, prefix: &str) -> ServiceEndpoint {
        ServiceEndpoint::new(prefix, format!("{}/{}", base, prefix), Duration::from_secs(1), 0)
    }

    #[tokio::test]
    async fn test_http_probe_against_live_upstream() {
        let base = spawn_upstream().await;
        let probe = HttpProbe::new(upstream_client().unwrap(), Duration::from_millis(300));

        assert_eq!(probe.probe(&endpoint(&base, "up")).await, ProbeOutcome::Healthy);
        assert!(matches!(
            probe.probe(&endpoint(&base, "down")).await,
            ProbeOutcome::Unhealthy(reason) if reason.contains("503")
        ));
        // A redirect is not a healthy answer, even when its target is.
        assert!(matches!(
            probe.probe(&endpoint(&base, "moved")).await,
            ProbeOutcome::Unhealthy(_)
        ));
        assert_eq!(
            probe.probe(&endpoint(&base, "hung")).await,
            ProbeOutcome::Unhealthy("timeout".to_string())
        );
    }
}
