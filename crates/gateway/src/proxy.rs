//! Health-aware reverse proxy.
//!
//! Request path: resolve the service, fail fast if it is unhealthy, forward
//! with the endpoint's timeout, relay the response. Transport errors and 5xx
//! responses are reported back to the [`HealthMonitor`] and surface as 502.
//! Successful responses are not a health input; only probes mark a service
//! healthy.

use crate::error::{GatewayError, Result};
use crate::health::{HealthMonitor, HealthStatus};
use crate::identity::{Identity, USER_ID_HEADER};
use crate::resolver::{EndpointResolver, Resolution, ServiceEndpoint};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Headers that only describe the client↔gateway hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// One outbound request to an upstream.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Duration,
}

/// Upstream response, fully buffered.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Failure to get any response from the upstream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

/// Network seam for forwarding.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, req: UpstreamRequest) -> std::result::Result<UpstreamResponse, TransportError>;
}

/// Build the client shared by forwarding and probing.
///
/// Redirects are never followed: a 3xx from an upstream is relayed to the
/// caller as-is, and a redirecting `/health` does not count as healthy.
pub fn upstream_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Wrap `client`; build it with [`upstream_client`] so redirects pass through.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, req: UpstreamRequest) -> std::result::Result<UpstreamResponse, TransportError> {
        let resp = self
            .client
            .request(req.method, &req.url)
            .headers(req.headers)
            .body(req.body)
            .timeout(req.timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(classify)?;
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// Inbound request as seen by the forwarder.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path below the service prefix, e.g. `/login`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub identity: Option<Identity>,
}

/// Methods safe to resend after a transport error.
fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Forwards requests to resolved, healthy upstreams.
pub struct ProxyForwarder {
    resolver: Arc<EndpointResolver>,
    monitor: Arc<HealthMonitor>,
    transport: Arc<dyn Transport>,
}

impl ProxyForwarder {
    pub fn new(
        resolver: Arc<EndpointResolver>,
        monitor: Arc<HealthMonitor>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            resolver,
            monitor,
            transport,
        }
    }

    /// Forward one request to `service` and build the relayed response.
    pub async fn forward(&self, service: &str, req: ForwardRequest) -> Result<Response> {
        let endpoint = match self.resolver.resolve(service) {
            Resolution::Found(endpoint) => endpoint,
            Resolution::NotRegistered => {
                record_outcome(service, "not_registered");
                return Err(GatewayError::ServiceNotRegistered(service.to_string()));
            }
        };

        if self.monitor.status(service) == HealthStatus::Unhealthy {
            record_outcome(service, "rejected_unhealthy");
            debug!("Rejecting request to unhealthy service {}", service);
            return Err(GatewayError::UpstreamUnhealthy(service.to_string()));
        }

        let upstream = build_upstream_request(&endpoint, req);
        let attempts = if is_idempotent(&upstream.method) {
            1 + endpoint.retry_budget
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            match self.transport.send(upstream.clone()).await {
                Ok(resp) if resp.status.is_server_error() => {
                    warn!("Upstream {} returned {}", service, resp.status);
                    self.monitor.record_failure(service);
                    record_outcome(service, "upstream_error");
                    return Err(GatewayError::UpstreamServer {
                        service: service.to_string(),
                        status: resp.status,
                    });
                }
                Ok(resp) => {
                    debug!("Relaying {} from {}", resp.status, service);
                    record_outcome(service, "relayed");
                    return Ok(relay_response(resp));
                }
                Err(e) => {
                    let retry = attempt < attempts
                        && self.monitor.status(service) != HealthStatus::Unhealthy;
                    if retry {
                        debug!(
                            "Attempt {}/{} to {} failed: {}, retrying",
                            attempt, attempts, service, e
                        );
                        attempt += 1;
                        continue;
                    }
                    warn!("Forward to {} failed after {} attempt(s): {}", service, attempt, e);
                    self.monitor.record_failure(service);
                    record_outcome(service, "transport_error");
                    return Err(GatewayError::Transport {
                        service: service.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

fn build_upstream_request(endpoint: &ServiceEndpoint, req: ForwardRequest) -> UpstreamRequest {
    let mut url = endpoint.url_for(&req.path);
    if let Some(query) = req.query.as_deref().filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }

    let mut headers = req.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(USER_ID_HEADER);
    if let Some(identity) = &req.identity {
        if let Ok(value) = HeaderValue::from_str(identity.as_str()) {
            headers.insert(USER_ID_HEADER, value);
        }
    }

    UpstreamRequest {
        method: req.method,
        url,
        headers,
        body: req.body,
        timeout: endpoint.timeout,
    }
}

fn relay_response(resp: UpstreamResponse) -> Response {
    let mut headers = resp.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);

    let mut response = Response::new(Body::from(resp.body));
    *response.status_mut() = resp.status;
    *response.headers_mut() = headers;
    response
}

fn record_outcome(service: &str, outcome: &'static str) {
    counter!("gateway_proxy_requests_total", "service" => service.to_string(), "outcome" => outcome)
        .increment(1);
}
