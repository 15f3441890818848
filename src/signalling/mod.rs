//! Signalling rendezvous client side.
//!
//! The relay itself is external; this module defines the message shape it
//! speaks, a websocket client for production, and an in-process rendezvous
//! for tests. Every message shares one envelope:
//!
//!   {type, roomId, peerId, targetId?, payload, timestamp}
//!
//! Rooms hold at most two peers. The peer that created the room is the
//! initiator for the whole connection lifetime.

pub mod memory;
pub mod ws;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

// ── Messages ─────────────────────────────────────────────────────────────────

/// Message types exchanged with the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    #[serde(rename = "register")]
    Register,
    #[serde(rename = "peer-joined")]
    PeerJoined,
    #[serde(rename = "peer-left")]
    PeerLeft,
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice-candidate")]
    IceCandidate,
    #[serde(rename = "error")]
    Error,
}

/// One signalling frame, both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub room_id: String,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: u64,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, room_id: &str, peer_id: &str, payload: Value, timestamp: u64) -> Self {
        Self {
            kind,
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            target_id: None,
            payload,
            timestamp,
        }
    }
}

// ── Link ─────────────────────────────────────────────────────────────────────

/// A connected rendezvous session: frames out, frames in. The concrete
/// transport (websocket, in-memory hub) pumps both ends.
pub struct SignalLink {
    pub outgoing: mpsc::UnboundedSender<SignalMessage>,
    pub incoming: mpsc::UnboundedReceiver<SignalMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_wire_field_names() {
        let msg = SignalMessage {
            kind: SignalKind::IceCandidate,
            room_id: "room-1".into(),
            peer_id: "peer-a".into(),
            target_id: Some("peer-b".into()),
            payload: json!({"candidate": "candidate:1 1 udp ..."}),
            timestamp: 99,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"ice-candidate""#));
        assert!(json.contains(r#""roomId":"room-1""#));
        assert!(json.contains(r#""targetId":"peer-b""#));

        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn target_id_is_omitted_when_absent() {
        let msg = SignalMessage::new(SignalKind::Register, "room", "peer", json!({}), 0);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("targetId"));
    }
}
