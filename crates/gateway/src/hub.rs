//! Connection state and registry management.
//!
//! Each connection owns a bounded outbound queue drained by its own writer
//! task, so fan-out never waits on a slow socket: a full queue drops the
//! frame for that client only.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;
use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use metrics::{counter, gauge};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Identity used when the request carried no verified identity.
pub const ANONYMOUS: &str = "anonymous";

/// Default size of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// State for a single connected client.
pub struct ConnectionEntry {
    /// Unique connection ID
    pub id: ConnectionId,
    /// Verified user identity, or [`ANONYMOUS`]
    pub identity: String,
    /// Channels this connection receives broadcasts for
    pub joined_channels: DashSet<String>,
    /// Connection timestamp (unix seconds)
    pub connected_at: i64,
    /// Bounded outbound queue drained by the writer task
    tx: mpsc::Sender<Message>,
}

impl ConnectionEntry {
    /// Create a new connection entry with a fresh ID.
    pub fn new(identity: Option<String>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.unwrap_or_else(|| ANONYMOUS.to_string()),
            joined_channels: DashSet::new(),
            connected_at: Utc::now().timestamp(),
            tx,
        }
    }

    /// Queue a message without waiting.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = msg.to_json()?;
        self.try_send_raw(Message::Text(json.into()))
    }

    /// Queue a raw frame without waiting.
    pub fn try_send_raw(&self, msg: Message) -> Result<()> {
        self.tx.try_send(msg).map_err(|_| GatewayError::ChannelSend)
    }

    /// Check if this connection joined `channel`.
    pub fn in_channel(&self, channel: &str) -> bool {
        self.joined_channels.contains(channel)
    }
}

/// Registry of live realtime connections.
#[derive(Default)]
pub struct ConnectionHub {
    /// Connection ID -> connection state
    connections: DashMap<ConnectionId, Arc<ConnectionEntry>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection and return the number now connected.
    pub fn register(&self, entry: Arc<ConnectionEntry>) -> usize {
        let id = entry.id;
        let identity = entry.identity.clone();
        self.connections.insert(id, entry);
        let count = self.connections.len();
        gauge!("gateway_active_connections").set(count as f64);
        info!("Connection {} registered ({}), {} active", id, identity, count);
        count
    }

    /// Register and return a guard that unregisters on drop.
    pub fn register_scoped(self: &Arc<Self>, entry: Arc<ConnectionEntry>) -> (ConnectionGuard, usize) {
        let id = entry.id;
        let count = self.register(entry);
        (
            ConnectionGuard {
                hub: self.clone(),
                id,
            },
            count,
        )
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.remove(id).is_some();
        if removed {
            let count = self.connections.len();
            gauge!("gateway_active_connections").set(count as f64);
            info!("Connection {} unregistered, {} active", id, count);
        }
        removed
    }

    /// Get a connection by ID.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionEntry>> {
        self.connections.get(id).map(|r| r.clone())
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Check if a connection is still registered.
    pub fn is_registered(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Add `channel` to a connection's memberships.
    pub fn join_channel(&self, id: &ConnectionId, channel: &str) -> Result<()> {
        let entry = self
            .get(id)
            .ok_or_else(|| GatewayError::Internal(format!("connection {} not registered", id)))?;
        entry.joined_channels.insert(channel.to_string());
        debug!("Connection {} joined {}", id, channel);
        Ok(())
    }

    /// Remove `channel` from a connection's memberships.
    pub fn leave_channel(&self, id: &ConnectionId, channel: &str) -> Result<()> {
        let entry = self
            .get(id)
            .ok_or_else(|| GatewayError::Internal(format!("connection {} not registered", id)))?;
        entry.joined_channels.remove(channel);
        debug!("Connection {} left {}", id, channel);
        Ok(())
    }

    /// Members of one channel.
    pub fn channel_members(&self, channel: &str) -> Vec<Arc<ConnectionEntry>> {
        self.connections
            .iter()
            .filter(|e| e.value().in_channel(channel))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Queue a pre-serialized frame for every member of `channel`, or for
    /// every connection when `channel` is `None`. Returns frames queued.
    pub fn broadcast_text(&self, channel: Option<&str>, json: &str) -> usize {
        let targets: Vec<Arc<ConnectionEntry>> = match channel {
            Some(channel) => self.channel_members(channel),
            None => self.connections.iter().map(|e| e.value().clone()).collect(),
        };

        let mut delivered = 0;
        for entry in targets {
            match entry.try_send_raw(Message::Text(json.to_string().into())) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    counter!("gateway_outbound_dropped_total").increment(1);
                    debug!("Outbound queue full for {}, frame dropped", entry.id);
                }
            }
        }
        delivered
    }

    /// Serialize once and queue for every target of [`Self::broadcast_text`].
    pub fn broadcast(&self, channel: Option<&str>, msg: &ServerMessage) -> Result<usize> {
        let json = msg.to_json()?;
        Ok(self.broadcast_text(channel, &json))
    }
}

/// Unregisters its connection when dropped, on every exit path.
pub struct ConnectionGuard {
    hub: Arc<ConnectionHub>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(buffer: usize) -> (Arc<ConnectionEntry>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Arc::new(ConnectionEntry::new(None, tx)), rx)
    }

    fn text(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.as_str().to_string(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_register_unregister_restores_count() {
        let hub = ConnectionHub::new();
        let (existing, _rx0) = entry(4);
        hub.register(existing);
        let before = hub.connection_count();

        let (e, _rx) = entry(4);
        let id = e.id;
        assert_eq!(hub.register(e), before + 1);
        assert!(hub.unregister(&id));
        assert_eq!(hub.connection_count(), before);
        assert!(!hub.unregister(&id));
    }

    #[test]
    fn test_guard_unregisters_once() {
        let hub = Arc::new(ConnectionHub::new());
        let (e, _rx) = entry(4);
        let id = e.id;
        {
            let (guard, count) = hub.register_scoped(e);
            assert_eq!(count, 1);
            assert_eq!(guard.id(), id);
            assert!(hub.is_registered(&id));
        }
        assert!(!hub.is_registered(&id));
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn test_anonymous_identity() {
        let (e, _rx) = entry(1);
        assert_eq!(e.identity, ANONYMOUS);
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(ConnectionEntry::new(Some("alice".into()), tx).identity, "alice");
    }

    #[test]
    fn test_channel_broadcast_targets_members_only() {
        let hub = ConnectionHub::new();
        let (a, mut rx_a) = entry(4);
        let (b, mut rx_b) = entry(4);
        let a_id = a.id;
        hub.register(a);
        hub.register(b);

        hub.join_channel(&a_id, "global").unwrap();
        let delivered = hub
            .broadcast(Some("global"), &ServerMessage::error("hello"))
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(text(rx_a.try_recv().unwrap()).contains("hello"));
        assert!(rx_b.try_recv().is_err());

        hub.leave_channel(&a_id, "global").unwrap();
        assert_eq!(hub.broadcast_text(Some("global"), "{}"), 0);
        assert_eq!(hub.broadcast_text(None, "{}"), 2);
        assert!(hub.join_channel(&Uuid::new_v4(), "global").is_err());
    }

    #[test]
    fn test_slow_client_does_not_block_broadcast() {
        let hub = ConnectionHub::new();
        let (slow, _slow_rx) = entry(1);
        let (fast, mut fast_rx) = entry(8);
        hub.register(slow);
        hub.register(fast);

        for _ in 0..5 {
            hub.broadcast_text(None, r#"{"type":"tick"}"#);
        }

        let mut received = 0;
        while fast_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 5);
    }
}
