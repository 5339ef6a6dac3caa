//! API gateway for the game backend.
//!
//! This service:
//! - Forwards `/api/v1/<service>/...` requests to registered upstreams
//! - Tracks upstream health through periodic probes and request outcomes
//! - Accepts WebSocket connections and manages channel membership
//! - Relays chat messages to NATS and fans bus broadcasts out to clients
//!
//! ## Architecture
//!
//! ```text
//! HTTP /api/v1/*  → ProxyForwarder → EndpointResolver + HealthMonitor → upstream
//! WS   /ws        → ConnectionHub  → MessageBridge → NATS chat subject
//! NATS broadcast  → ConnectionHub (channel members)
//! HealthRegistry  → StatusAggregator → /gateway/status
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod health;
pub mod hub;
pub mod identity;
pub mod protocol;
pub mod proxy;
pub mod resolver;
pub mod status;
pub mod ws_server;

pub use bridge::{connect_bridge, spawn_broadcast_listener, MessageBridge};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use health::{HealthMonitor, HealthRegistry, HealthStatus, HttpProbe};
pub use hub::{ConnectionEntry, ConnectionHub};
pub use protocol::{ClientMessage, ServerMessage};
pub use proxy::{ProxyForwarder, ReqwestTransport};
pub use resolver::{EndpointResolver, ServiceEndpoint};
pub use status::{aggregate, GatewayStatus, OverallStatus};
pub use ws_server::{create_router, AppState};
