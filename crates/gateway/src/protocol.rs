//! WebSocket protocol message types.
//!
//! Every frame is a JSON object with a `type` field. Inbound envelopes are
//! decoded in two steps: the generic [`RelayMessage`] first (failure is a
//! protocol error that closes the connection), then [`ClientMessage`] by
//! `type` (unknown types are answered, not fatal).

use crate::error::{GatewayError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Raw inbound envelope. Lives only for the duration of one dispatch.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Value>,
    /// Every other field of the envelope.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RelayMessage {
    /// Decode a text or binary frame body.
    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| GatewayError::Protocol(e.to_string()))
    }

    fn channel_name(&self) -> Option<String> {
        match &self.channel {
            Some(Value::String(name)) if !name.is_empty() => Some(name.clone()),
            _ => None,
        }
    }
}

/// Inbound message after dispatch on `type`.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Ping,
    JoinChannel { channel: String },
    LeaveChannel { channel: String },
    /// Relayed to the bus untouched.
    ChatMessage(RelayMessage),
    /// Recognised type with missing or invalid fields.
    Invalid { reason: String },
    Unknown { kind: String },
}

impl From<RelayMessage> for ClientMessage {
    fn from(msg: RelayMessage) -> Self {
        match msg.kind.as_str() {
            "ping" => ClientMessage::Ping,
            "join_channel" => match msg.channel_name() {
                Some(channel) => ClientMessage::JoinChannel { channel },
                None => ClientMessage::Invalid {
                    reason: "Missing channel".to_string(),
                },
            },
            "leave_channel" => match msg.channel_name() {
                Some(channel) => ClientMessage::LeaveChannel { channel },
                None => ClientMessage::Invalid {
                    reason: "Missing channel".to_string(),
                },
            },
            "chat_message" => ClientMessage::ChatMessage(msg),
            _ => ClientMessage::Unknown { kind: msg.kind },
        }
    }
}

impl ClientMessage {
    /// Metric label for this message.
    pub fn label(&self) -> &'static str {
        match self {
            ClientMessage::Ping => "ping",
            ClientMessage::JoinChannel { .. } => "join_channel",
            ClientMessage::LeaveChannel { .. } => "leave_channel",
            ClientMessage::ChatMessage(_) => "chat_message",
            ClientMessage::Invalid { .. } => "invalid",
            ClientMessage::Unknown { .. } => "unknown",
        }
    }
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { message: String, time: i64 },
    Pong { time: i64 },
    ChannelJoined { channel: String },
    ChannelLeft { channel: String },
    Error { error: String },
}

impl ServerMessage {
    pub fn welcome(identity: &str) -> Self {
        ServerMessage::Welcome {
            message: format!("Welcome to the game server, {}", identity),
            time: Utc::now().timestamp(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            time: Utc::now().timestamp(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload published on the chat subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRelay {
    pub sender: String,
    pub connection_id: String,
    pub received_at: i64,
    pub message: RelayMessage,
}

/// Payload received on the broadcast subject.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastEnvelope {
    /// Target channel; every connection when absent.
    #[serde(default)]
    pub channel: Option<String>,
    /// Forwarded verbatim as the frame body.
    pub message: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(raw: &str) -> ClientMessage {
        RelayMessage::parse(raw.as_bytes()).unwrap().into()
    }

    #[test]
    fn test_dispatch_types() {
        assert!(matches!(decode(r#"{"type":"ping"}"#), ClientMessage::Ping));
        match decode(r#"{"type":"join_channel","channel":"global"}"#) {
            ClientMessage::JoinChannel { channel } => assert_eq!(channel, "global"),
            other => panic!("unexpected {:?}", other),
        }
        match decode(r#"{"type":"leave_channel","channel":"global"}"#) {
            ClientMessage::LeaveChannel { channel } => assert_eq!(channel, "global"),
            other => panic!("unexpected {:?}", other),
        }
        match decode(r#"{"type":"dance"}"#) {
            ClientMessage::Unknown { kind } => assert_eq!(kind, "dance"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_chat_message_keeps_payload() {
        let ClientMessage::ChatMessage(msg) =
            decode(r#"{"type":"chat_message","channel":"global","content":"hi","n":1}"#)
        else {
            panic!("expected chat_message");
        };
        assert_eq!(msg.payload["content"], "hi");
        assert_eq!(msg.payload["n"], 1);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "chat_message");
        assert_eq!(json["channel"], "global");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn test_missing_channel_is_invalid() {
        assert!(matches!(
            decode(r#"{"type":"join_channel"}"#),
            ClientMessage::Invalid { .. }
        ));
        assert!(matches!(
            decode(r#"{"type":"leave_channel","channel":7}"#),
            ClientMessage::Invalid { .. }
        ));
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        for raw in ["not json", "[1,2]", r#"{"channel":"global"}"#, r#"{"type":5}"#] {
            assert!(
                matches!(RelayMessage::parse(raw.as_bytes()), Err(GatewayError::Protocol(_))),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_server_message_wire_format() {
        let json: Value = serde_json::from_str(
            &ServerMessage::ChannelJoined {
                channel: "global".into(),
            }
            .to_json()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(json, serde_json::json!({"type":"channel_joined","channel":"global"}));

        let json: Value =
            serde_json::from_str(&ServerMessage::error("Unknown message type").to_json().unwrap())
                .unwrap();
        assert_eq!(json, serde_json::json!({"type":"error","error":"Unknown message type"}));

        let json = serde_json::to_value(ServerMessage::pong()).unwrap();
        assert_eq!(json["type"], "pong");
        assert!(json["time"].is_i64());
    }
}
