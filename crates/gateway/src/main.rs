//! Gateway service entry point.
//!
//! Health-aware reverse proxy and WebSocket bridge for the game backend.

use anyhow::Result;
use gateway::{
    connect_bridge, create_router, spawn_broadcast_listener, AppState, ConnectionHub,
    EndpointResolver, GatewayConfig, HealthMonitor, HealthRegistry, HttpProbe, ProxyForwarder,
    ReqwestTransport,
};
use gateway::proxy::upstream_client;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting API gateway");

    let config = GatewayConfig::from_env()?;

    info!("Configuration:");
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  NATS_URL: {}", config.bus.url);
    info!("  BUS_FAILURE_MODE: {:?}", config.bus.failure_mode);
    info!(
        "  HEALTH_CHECK_INTERVAL_SECS: {}",
        config.health.interval.as_secs()
    );
    info!("  UNHEALTHY_THRESHOLD: {}", config.health.unhealthy_threshold);
    for service in &config.services {
        info!(
            "  service {} -> {} (timeout {:?}, retries {})",
            service.name, service.base_url, service.timeout, service.retry_budget
        );
    }

    // Metrics are rendered by the /metrics route
    let metrics = PrometheusBuilder::new().install_recorder()?;

    let resolver = Arc::new(EndpointResolver::new(config.services.clone()));
    let registry = Arc::new(HealthRegistry::new(
        resolver.names(),
        config.health.unhealthy_threshold,
    ));

    let http = upstream_client()?;
    let probe = Arc::new(HttpProbe::new(http.clone(), config.health.probe_timeout));
    let monitor = Arc::new(HealthMonitor::new(
        registry,
        resolver.clone(),
        probe,
        config.health.max_concurrent_probes,
    ));

    let (monitor_shutdown_tx, monitor_shutdown_rx) = mpsc::channel(1);
    let monitor_handle = monitor.clone().start(config.health.interval, monitor_shutdown_rx);

    // Connect to NATS; fail_fast mode aborts startup here
    info!("Connecting to NATS at {}", config.bus.url);
    let (bridge, nats_client) = connect_bridge(&config.bus).await?;

    let hub = Arc::new(ConnectionHub::new());

    let (listener_shutdown_tx, listener_shutdown_rx) = mpsc::channel(1);
    let listener_handle = match nats_client.clone() {
        Some(client) => Some(spawn_broadcast_listener(
            client,
            config.bus.broadcast_subject.clone(),
            hub.clone(),
            listener_shutdown_rx,
        )),
        None => {
            warn!("Broadcast listener not started: message bus unavailable");
            None
        }
    };

    let forwarder = Arc::new(ProxyForwarder::new(
        resolver.clone(),
        monitor.clone(),
        Arc::new(ReqwestTransport::new(http)),
    ));

    // Create application state
    let mut state = AppState::new(resolver, monitor, forwarder, hub, bridge);
    state.metrics = Some(metrics);
    state.outbound_buffer = config.ws_outbound_buffer;
    state.max_body_bytes = config.max_body_bytes;

    let app = create_router(Arc::new(state));

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background tasks...");
    let _ = monitor_shutdown_tx.send(()).await;
    let _ = monitor_handle.await;
    if let Some(handle) = listener_handle {
        let _ = listener_shutdown_tx.send(()).await;
        let _ = handle.await;
    }
    if let Some(client) = &nats_client {
        if let Err(e) = client.flush().await {
            warn!("Failed to flush NATS on shutdown: {}", e);
        }
    }

    info!("Gateway stopped");
    Ok(())
}

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
            Ok(mut sig) => {
                sig.recv().await;
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
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
