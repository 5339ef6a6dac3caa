//! HTTP and WebSocket surface of the gateway.

use crate::bridge::MessageBridge;
use crate::error::GatewayError;
use crate::health::{HealthMonitor, HealthStatus};
use crate::hub::{ConnectionEntry, ConnectionHub, DEFAULT_OUTBOUND_BUFFER};
use crate::identity::Identity;
use crate::protocol::{ClientMessage, RelayMessage, ServerMessage};
use crate::proxy::{ForwardRequest, ProxyForwarder};
use crate::resolver::EndpointResolver;
use crate::status::aggregate;
use axum::body::Bytes;
use axum::{
    extract::{
        rejection::BytesRejection,
        ws::{Message, WebSocket},
        DefaultBodyLimit, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Prefix of namespaced proxy routes.
pub const API_PREFIX: &str = "/api/v1/";

/// Shared application state.
pub struct AppState {
    /// Service name -> upstream endpoint
    pub resolver: Arc<EndpointResolver>,
    /// Health verdicts consulted before forwarding
    pub monitor: Arc<HealthMonitor>,
    /// Forwards `/api/v1/*` requests
    pub forwarder: Arc<ProxyForwarder>,
    /// Live WebSocket connections
    pub hub: Arc<ConnectionHub>,
    /// Chat relay onto the message bus
    pub bridge: Arc<MessageBridge>,
    /// Prometheus handle rendered by `/metrics`; empty output when unset
    pub metrics: Option<PrometheusHandle>,
    /// Outbound queue size for each new connection
    pub outbound_buffer: usize,
    /// Largest proxied request body accepted
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(
        resolver: Arc<EndpointResolver>,
        monitor: Arc<HealthMonitor>,
        forwarder: Arc<ProxyForwarder>,
        hub: Arc<ConnectionHub>,
        bridge: Arc<MessageBridge>,
    ) -> Self {
        Self {
            resolver,
            monitor,
            forwarder,
            hub,
            bridge,
            metrics: None,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Create the gateway router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/gateway/status", get(status_handler))
        .route("/gateway/services", get(services_handler))
        .route("/ws", get(ws_handler))
        .route("/api/v1/{service}", any(proxy_handler))
        .route("/api/v1/{service}/{*rest}", any(proxy_handler))
        .with_state(state)
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// =============================================================================
// HTTP Handlers
// =============================================================================

#[derive(Serialize)]
struct SelfHealth {
    status: &'static str,
    service: &'static str,
    connections: usize,
    time: i64,
}

/// Liveness of the gateway process itself.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<SelfHealth> {
    Json(SelfHealth {
        status: "ok",
        service: "api-gateway",
        connections: state.hub.connection_count(),
        time: Utc::now().timestamp(),
    })
}

/// Prometheus exposition.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(aggregate(state.monitor.registry()))
}

#[derive(Serialize)]
struct ServiceInfo {
    name: String,
    base_url: String,
    timeout_ms: u64,
    retry_budget: u32,
    status: HealthStatus,
}

#[derive(Serialize)]
struct ServiceList {
    services: Vec<ServiceInfo>,
    count: usize,
}

async fn services_handler(State(state): State<Arc<AppState>>) -> Json<ServiceList> {
    let services: Vec<ServiceInfo> = state
        .resolver
        .endpoints()
        .into_iter()
        .map(|e| ServiceInfo {
            name: e.name.clone(),
            base_url: e.base_url.clone(),
            timeout_ms: e.timeout.as_millis() as u64,
            retry_budget: e.retry_budget,
            status: state.monitor.status(&e.name),
        })
        .collect();
    let count = services.len();
    Json(ServiceList { services, count })
}

/// Split `/api/v1/<service>/<rest>` into the raw service segment and the
/// remainder (always starting with `/`).
fn split_proxy_path(path: &str) -> Option<(&str, String)> {
    let tail = path.strip_prefix(API_PREFIX)?;
    let (service, rest) = match tail.split_once('/') {
        Some((service, rest)) => (service, format!("/{}", rest)),
        None => (tail, "/".to_string()),
    };
    if service.is_empty() {
        return None;
    }
    Some((service, rest))
}

/// Forward `/api/v1/<service>/...` to the upstream.
///
/// The body is buffered under [`AppState::max_body_bytes`]: exceeding the
/// limit is 413, any other failure to read it is 400.
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    identity: Option<Extension<Identity>>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let Some((service, path)) = split_proxy_path(uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let service = service.to_string();

    let body = match body {
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return GatewayError::PayloadTooLarge.into_response();
        }
        Err(rejection) => {
            debug!("Unreadable body for {}: {}", service, rejection.body_text());
            return GatewayError::BadRequest(rejection.body_text()).into_response();
        }
    };

    let forward = ForwardRequest {
        method,
        path,
        query: uri.query().map(str::to_string),
        headers,
        body,
        identity: identity.map(|Extension(id)| id),
    };

    match state.forwarder.forward(&service, forward).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

// =============================================================================
// WebSocket
// =============================================================================

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<Identity>>,
) -> impl IntoResponse {
    let identity = identity.map(|Extension(id)| id.0);
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// What the read loop does after one frame.
#[derive(Debug, PartialEq, Eq)]
enum FrameAction {
    Continue,
    Close,
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Message>(state.outbound_buffer.max(1));
    let entry = Arc::new(ConnectionEntry::new(identity, tx));
    let client_id = entry.id;

    // Removed from the hub when this guard drops, however the loop exits.
    let (guard, count) = state.hub.register_scoped(entry.clone());
    counter!("gateway_connections_total").increment(1);
    info!("Client {} connected ({} active)", client_id, count);

    // The welcome goes out before the read loop starts.
    let welcome = match ServerMessage::welcome(&entry.identity).to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize welcome: {}", e);
            return;
        }
    };
    if ws_tx.send(Message::Text(welcome.into())).await.is_err() {
        debug!("Client {} went away before welcome", client_id);
        return;
    }

    // Spawn task to forward messages from the outbound queue to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Ping interval for keepalive
    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.reset();

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if handle_frame(&state, &entry, msg) == FrameAction::Close {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", client_id, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if entry.try_send_raw(Message::Ping(Default::default())).is_err() {
                    debug!("Keepalive ping for {} not queued", client_id);
                }
            }
        }
    }

    // Cleanup: unregister, then let the writer flush what is queued.
    drop(guard);
    drop(entry);
    let abort = send_task.abort_handle();
    if tokio::time::timeout(Duration::from_secs(5), send_task).await.is_err() {
        abort.abort();
    }

    counter!("gateway_disconnections_total").increment(1);
    info!("Client {} disconnected", client_id);
}

/// Handle a single WebSocket frame.
fn handle_frame(state: &AppState, entry: &ConnectionEntry, msg: Message) -> FrameAction {
    match msg {
        Message::Text(text) => handle_envelope(state, entry, text.as_bytes()),
        Message::Binary(data) => handle_envelope(state, entry, &data),
        Message::Ping(data) => {
            if entry.try_send_raw(Message::Pong(data)).is_err() {
                debug!("Pong for {} not queued", entry.id);
            }
            FrameAction::Continue
        }
        Message::Pong(_) => FrameAction::Continue,
        Message::Close(_) => FrameAction::Close,
    }
}

fn handle_envelope(state: &AppState, entry: &ConnectionEntry, data: &[u8]) -> FrameAction {
    let relay = match RelayMessage::parse(data) {
        Ok(relay) => relay,
        Err(e) => {
            counter!("gateway_ws_messages_total", "type" => "malformed").increment(1);
            warn!("Closing {} after malformed frame: {}", entry.id, e);
            return FrameAction::Close;
        }
    };

    let msg = ClientMessage::from(relay);
    counter!("gateway_ws_messages_total", "type" => msg.label()).increment(1);

    if let Some(reply) = dispatch(&state.hub, &state.bridge, entry, msg) {
        if let Err(e) = entry.send(&reply) {
            debug!("Reply to {} not queued: {}", entry.id, e);
        }
    }
    FrameAction::Continue
}

/// Apply one client message and return the direct reply, if any.
pub fn dispatch(
    hub: &ConnectionHub,
    bridge: &MessageBridge,
    entry: &ConnectionEntry,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Ping => Some(ServerMessage::pong()),
        ClientMessage::JoinChannel { channel } => match hub.join_channel(&entry.id, &channel) {
            Ok(()) => Some(ServerMessage::ChannelJoined { channel }),
            Err(e) => Some(ServerMessage::error(e.to_string())),
        },
        ClientMessage::LeaveChannel { channel } => match hub.leave_channel(&entry.id, &channel) {
            Ok(()) => Some(ServerMessage::ChannelLeft { channel }),
            Err(e) => Some(ServerMessage::error(e.to_string())),
        },
        ClientMessage::ChatMessage(relay) => {
            bridge.publish_chat(entry, relay);
            None
        }
        ClientMessage::Invalid { reason } => Some(ServerMessage::error(reason)),
        ClientMessage::Unknown { kind } => {
            debug!("Unknown message type '{}' from {}", kind, entry.id);
            Some(ServerMessage::error("Unknown message type"))
        }
    }
}
