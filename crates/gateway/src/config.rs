//! Environment-driven gateway configuration.
//!
//! Everything is read once at startup. A value that is present but does not
//! parse is a fatal error; a missing value falls back to its default.

use crate::error::{GatewayError, Result};
use crate::hub::DEFAULT_OUTBOUND_BUFFER;
use crate::resolver::ServiceEndpoint;
use nats_client::ConnectPolicy;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Domain services routed by default, in port order starting at 8001.
pub const DEFAULT_SERVICES: &[&str] = &[
    "auth",
    "chat",
    "inventory",
    "player",
    "combat",
    "world",
    "guild",
];

/// What to do when the message bus is unreachable at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFailureMode {
    /// Log, drop chat relays, keep serving.
    Degrade,
    /// Refuse to start.
    FailFast,
}

impl FromStr for BusFailureMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "degrade" => Ok(BusFailureMode::Degrade),
            "fail_fast" | "fail-fast" => Ok(BusFailureMode::FailFast),
            other => Err(GatewayError::Config(format!(
                "BUS_FAILURE_MODE must be 'degrade' or 'fail_fast', got '{}'",
                other
            ))),
        }
    }
}

/// Health monitoring settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between probe rounds.
    pub interval: Duration,
    /// Timeout for a single `/health` probe.
    pub probe_timeout: Duration,
    /// Consecutive failures before a service is marked unhealthy.
    pub unhealthy_threshold: u32,
    /// Upper bound on probes in flight during one round.
    pub max_concurrent_probes: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            max_concurrent_probes: 16,
        }
    }
}

/// Message bus settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// NATS server URL.
    pub url: String,
    /// Startup connect attempts and backoff.
    pub connect: ConnectPolicy,
    /// Behavior when every connect attempt failed.
    pub failure_mode: BusFailureMode,
    /// Subject client chat messages are published on.
    pub chat_subject: String,
    /// Subject the gateway listens on for channel broadcasts.
    pub broadcast_subject: String,
    /// Pending publishes held before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            connect: ConnectPolicy::default(),
            failure_mode: BusFailureMode::Degrade,
            chat_subject: nats_client::subject("chat", "message"),
            broadcast_subject: nats_client::subject("gateway", "broadcast"),
            queue_capacity: 1024,
        }
    }
}

/// Full gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port the HTTP/WebSocket listener binds on.
    pub http_port: u16,
    /// Routed upstreams, in `GATEWAY_SERVICES` order.
    pub services: Vec<ServiceEndpoint>,
    pub health: HealthConfig,
    pub bus: BusConfig,
    /// Frames queued per WebSocket connection before drops start.
    pub ws_outbound_buffer: usize,
    /// Largest proxied request body; larger ones get 413.
    pub max_body_bytes: usize,
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http_port = parse_or(&lookup, "HTTP_PORT", 8080u16)?;

        let names: Vec<String> = match lookup("GATEWAY_SERVICES") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect(),
        };

        let default_timeout = parse_or(&lookup, "SERVICE_TIMEOUT_SECS", 30u64)?;
        let default_retries = parse_or(&lookup, "SERVICE_RETRIES", 0u32)?;

        let mut services = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let prefix = name.to_ascii_uppercase();
            let url_key = format!("{}_SERVICE_URL", prefix);
            let base_url = lookup(&url_key)
                .unwrap_or_else(|| format!("http://localhost:{}", 8001 + i));
            Url::parse(&base_url)
                .map_err(|e| GatewayError::Config(format!("{}: {}", url_key, e)))?;

            let timeout_secs = parse_or(
                &lookup,
                &format!("{}_SERVICE_TIMEOUT_SECS", prefix),
                default_timeout,
            )?;
            let retries = parse_or(
                &lookup,
                &format!("{}_SERVICE_RETRIES", prefix),
                default_retries,
            )?;

            services.push(ServiceEndpoint::new(
                name.clone(),
                base_url,
                Duration::from_secs(timeout_secs),
                retries,
            ));
        }

        let health_defaults = HealthConfig::default();
        let health = HealthConfig {
            interval: Duration::from_secs(parse_or(
                &lookup,
                "HEALTH_CHECK_INTERVAL_SECS",
                health_defaults.interval.as_secs(),
            )?),
            probe_timeout: Duration::from_secs(parse_or(
                &lookup,
                "HEALTH_PROBE_TIMEOUT_SECS",
                health_defaults.probe_timeout.as_secs(),
            )?),
            unhealthy_threshold: parse_or(
                &lookup,
                "UNHEALTHY_THRESHOLD",
                health_defaults.unhealthy_threshold,
            )?,
            max_concurrent_probes: parse_or(
                &lookup,
                "HEALTH_MAX_CONCURRENT_PROBES",
                health_defaults.max_concurrent_probes,
            )?,
        };

        let bus_defaults = BusConfig::default();
        let retry_delay_ms = parse_or(
            &lookup,
            "NATS_RETRY_DELAY_MS",
            bus_defaults.connect.retry_delay.as_millis() as u64,
        )?;
        let bus = BusConfig {
            url: lookup("NATS_URL").unwrap_or(bus_defaults.url),
            connect: ConnectPolicy {
                attempts: parse_or(
                    &lookup,
                    "NATS_CONNECT_ATTEMPTS",
                    bus_defaults.connect.attempts,
                )?,
                retry_delay: Duration::from_millis(retry_delay_ms),
                max_retry_delay: bus_defaults.connect.max_retry_delay,
            },
            failure_mode: match lookup("BUS_FAILURE_MODE") {
                Some(mode) => mode.parse()?,
                None => bus_defaults.failure_mode,
            },
            chat_subject: lookup("CHAT_SUBJECT").unwrap_or(bus_defaults.chat_subject),
            broadcast_subject: lookup("BROADCAST_SUBJECT")
                .unwrap_or(bus_defaults.broadcast_subject),
            queue_capacity: parse_or(&lookup, "BUS_QUEUE_CAPACITY", bus_defaults.queue_capacity)?,
        };

        let config = Self {
            http_port,
            services,
            health,
            bus,
            ws_outbound_buffer: parse_or(&lookup, "WS_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?,
            max_body_bytes: parse_or(&lookup, "MAX_BODY_BYTES", 10 * 1024 * 1024usize)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.health.unhealthy_threshold == 0 {
            return Err(GatewayError::Config(
                "UNHEALTHY_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if self.health.interval.is_zero() {
            return Err(GatewayError::Config(
                "HEALTH_CHECK_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }
        if self.health.max_concurrent_probes == 0 {
            return Err(GatewayError::Config(
                "HEALTH_MAX_CONCURRENT_PROBES must be at least 1".to_string(),
            ));
        }
        if self.ws_outbound_buffer == 0 || self.bus.queue_capacity == 0 {
            return Err(GatewayError::Config(
                "queue capacities must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}
