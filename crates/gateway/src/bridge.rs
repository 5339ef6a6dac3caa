//! Message bridge: WebSocket ⇄ NATS.
//!
//! Outbound, `chat_message` envelopes are queued and published on the chat
//! subject by a background task, so a read loop never waits on the bus.
//! Inbound, envelopes on the broadcast subject are fanned out to channel
//! members through the hub.
//!
//! When the bus cannot be reached at startup and the failure mode is
//! `degrade`, the bridge runs disabled: the gateway serves normally and chat
//! relays are dropped with a log line. This trades durability of chat
//! delivery for gateway availability.

use crate::config::{BusConfig, BusFailureMode};
use crate::error::{GatewayError, Result};
use crate::hub::{ConnectionEntry, ConnectionHub};
use crate::protocol::{BroadcastEnvelope, ChatRelay, RelayMessage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use metrics::counter;
use nats_client::NatsClient;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sink for bus publishes.
#[async_trait]
pub trait BusPublisher: Send + Sync + 'static {
    async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()>;
}

#[async_trait]
impl BusPublisher for NatsClient {
    async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()> {
        NatsClient::publish(self, subject, payload).await
    }
}

/// What happened to one publish request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Queued,
    Dropped,
}

/// Fire-and-forget publisher of client chat messages.
pub struct MessageBridge {
    /// Subject chat relays are published on.
    chat_subject: String,
    /// Feed of the publisher task; `None` while the bus is unavailable.
    queue: Option<mpsc::Sender<Bytes>>,
}

impl MessageBridge {
    /// A bridge that drops everything.
    pub fn disabled(chat_subject: impl Into<String>) -> Self {
        Self {
            chat_subject: chat_subject.into(),
            queue: None,
        }
    }

    /// Start the publisher task over `publisher`.
    pub fn spawn(
        publisher: Arc<dyn BusPublisher>,
        chat_subject: impl Into<String>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let chat_subject = chat_subject.into();
        let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));

        let subject = chat_subject.clone();
        let handle = tokio::spawn(async move {
            info!("Message bridge publishing to '{}'", subject);
            while let Some(payload) = rx.recv().await {
                match publisher.publish(&subject, payload).await {
                    Ok(()) => counter!("gateway_bus_published_total").increment(1),
                    Err(e) => {
                        counter!("gateway_bus_dropped_total").increment(1);
                        warn!("Failed to publish to '{}': {}", subject, e);
                    }
                }
            }
            info!("Message bridge stopped");
        });

        (
            Self {
                chat_subject,
                queue: Some(tx),
            },
            handle,
        )
    }

    /// Whether publishes can reach the bus.
    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    /// Queue a client chat message. Never waits; failures are logged only.
    pub fn publish_chat(&self, sender: &ConnectionEntry, message: RelayMessage) -> PublishOutcome {
        let Some(queue) = &self.queue else {
            counter!("gateway_bus_dropped_total").increment(1);
            debug!(
                "Bus unavailable, dropping chat message for '{}' from {}",
                self.chat_subject, sender.id
            );
            return PublishOutcome::Dropped;
        };

        let relay = ChatRelay {
            sender: sender.identity.clone(),
            connection_id: sender.id.to_string(),
            received_at: Utc::now().timestamp(),
            message,
        };
        let payload = match serde_json::to_vec(&relay) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                error!("Failed to serialize chat relay: {}", e);
                return PublishOutcome::Dropped;
            }
        };

        match queue.try_send(payload) {
            Ok(()) => PublishOutcome::Queued,
            Err(e) => {
                counter!("gateway_bus_dropped_total").increment(1);
                warn!("Bus queue rejected chat message from {}: {}", sender.id, e);
                PublishOutcome::Dropped
            }
        }
    }
}

/// Connect to the bus according to `config`.
///
/// Returns the bridge plus the client (for the broadcast listener) when the
/// bus is reachable. In `degrade` mode an unreachable bus yields a disabled
/// bridge; in `fail_fast` mode it is an error.
pub async fn connect_bridge(
    config: &BusConfig,
) -> Result<(Arc<MessageBridge>, Option<NatsClient>)> {
    match NatsClient::connect_with_policy(&config.url, &config.connect).await {
        Ok(client) => {
            let (bridge, _handle) = MessageBridge::spawn(
                Arc::new(client.clone()),
                config.chat_subject.clone(),
                config.queue_capacity,
            );
            Ok((Arc::new(bridge), Some(client)))
        }
        Err(e) => match config.failure_mode {
            BusFailureMode::FailFast => Err(GatewayError::BridgeUnavailable(e.to_string())),
            BusFailureMode::Degrade => {
                warn!(
                    "Message bus unreachable ({}); chat relaying disabled, gateway continues",
                    e
                );
                Ok((
                    Arc::new(MessageBridge::disabled(config.chat_subject.clone())),
                    None,
                ))
            }
        },
    }
}

/// Fan one broadcast payload out to the hub. Returns frames queued.
pub fn route_broadcast(hub: &ConnectionHub, payload: &[u8]) -> Result<usize> {
    let envelope: BroadcastEnvelope = serde_json::from_slice(payload)?;
    let json = serde_json::to_string(&envelope.message)?;
    let delivered = hub.broadcast_text(envelope.channel.as_deref(), &json);
    debug!(
        "Broadcast to {} delivered to {} connections",
        envelope.channel.as_deref().unwrap_or("*"),
        delivered
    );
    Ok(delivered)
}

/// Subscribe to `subject` and route every message through [`route_broadcast`].
pub fn spawn_broadcast_listener(
    client: NatsClient,
    subject: String,
    hub: Arc<ConnectionHub>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscriber = match client.subscribe(&subject).await {
            Ok(s) => s,
            Err(e) => {
                error!("Broadcast subscription to '{}' failed: {:?}", subject, e);
                return;
            }
        };
        info!("Broadcast listener running on '{}'", subject);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Broadcast listener received shutdown signal");
                    break;
                }

                msg = subscriber.next() => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = route_broadcast(&hub, &msg.payload) {
                                counter!("gateway_routing_errors_total").increment(1);
                                warn!("Failed to route broadcast: {:?}", e);
                            }
                        }
                        None => {
                            warn!("NATS subscription ended unexpectedly");
                            break;
                        }
                    }
                }
            }
        }
    })
}
