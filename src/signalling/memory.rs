//! In-process rendezvous hub for tests: two-peer rooms, register acks,
//! candidate/offer forwarding, peer-left on drop. Mirrors the relay
//! contract closely enough that the session driver cannot tell the
//! difference.

use super::{SignalKind, SignalLink, SignalMessage};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct Room {
    /// (peer_id, sender toward that peer), in join order.
    members: Vec<(String, mpsc::UnboundedSender<SignalMessage>)>,
}

/// Shared hub; clone-cheap handle.
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    rooms: Arc<Mutex<HashMap<String, Room>>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join (or create) a room. The register ack arrives on the returned
    /// link's incoming stream; `isCreator` is true for the first member.
    pub fn connect(&self, room_id: &str, peer_id: &str) -> SignalLink {
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();

        {
            let mut rooms = self.rooms.lock().unwrap();
            let room = rooms.entry(room_id.to_string()).or_insert(Room {
                members: Vec::new(),
            });
            // Room capacity is 2; a third joiner gets an error frame.
            if room.members.len() >= 2 {
                let _ = to_client_tx.send(SignalMessage {
                    kind: SignalKind::Error,
                    room_id: room_id.to_string(),
                    peer_id: String::new(),
                    target_id: Some(peer_id.to_string()),
                    payload: json!({"message": "room is full"}),
                    timestamp: 0,
                });
                return SignalLink {
                    outgoing: from_client_tx,
                    incoming: to_client_rx,
                };
            }
            let is_creator = room.members.is_empty();
            room.members.push((peer_id.to_string(), to_client_tx.clone()));

            let _ = to_client_tx.send(SignalMessage {
                kind: SignalKind::Register,
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                target_id: None,
                payload: json!({"peerId": peer_id, "isCreator": is_creator}),
                timestamp: 0,
            });

            // Tell the earlier member someone arrived, and the newcomer
            // who is already here.
            if let Some((other_id, other_tx)) = room
                .members
                .iter()
                .find(|(id, _)| id != peer_id)
                .cloned()
            {
                let _ = other_tx.send(SignalMessage {
                    kind: SignalKind::PeerJoined,
                    room_id: room_id.to_string(),
                    peer_id: peer_id.to_string(),
                    target_id: Some(other_id.clone()),
                    payload: json!({}),
                    timestamp: 0,
                });
                let _ = to_client_tx.send(SignalMessage {
                    kind: SignalKind::PeerJoined,
                    room_id: room_id.to_string(),
                    peer_id: other_id,
                    target_id: Some(peer_id.to_string()),
                    payload: json!({}),
                    timestamp: 0,
                });
            }
        }

        // Forwarding pump: relay frames to the target (or the other
        // member), emit peer-left when the client goes away.
        let rooms = Arc::clone(&self.rooms);
        let room_id = room_id.to_string();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            let mut from_client_rx = from_client_rx;
            while let Some(message) = from_client_rx.recv().await {
                let rooms = rooms.lock().unwrap();
                let Some(room) = rooms.get(&room_id) else {
                    continue;
                };
                for (member_id, member_tx) in &room.members {
                    let targeted = message
                        .target_id
                        .as_ref()
                        .map(|t| t == member_id)
                        .unwrap_or(member_id != &peer_id);
                    if targeted {
                        let _ = member_tx.send(message.clone());
                    }
                }
            }

            // Client dropped its link: leave the room.
            let mut rooms = rooms.lock().unwrap();
            if let Some(room) = rooms.get_mut(&room_id) {
                room.members.retain(|(id, _)| id != &peer_id);
                for (other_id, other_tx) in &room.members {
                    let _ = other_tx.send(SignalMessage {
                        kind: SignalKind::PeerLeft,
                        room_id: room_id.clone(),
                        peer_id: peer_id.clone(),
                        target_id: Some(other_id.clone()),
                        payload: json!({}),
                        timestamp: 0,
                    });
                }
                if room.members.is_empty() {
                    rooms.remove(&room_id);
                }
            }
        });

        SignalLink {
            outgoing: from_client_tx,
            incoming: to_client_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_assigns_creator_in_join_order() {
        let hub = MemoryRendezvous::new();
        let mut a = hub.connect("room-1", "peer-a");
        let mut b = hub.connect("room-1", "peer-b");

        let reg_a = a.incoming.recv().await.unwrap();
        assert_eq!(reg_a.kind, SignalKind::Register);
        assert_eq!(reg_a.payload["isCreator"], true);

        let reg_b = b.incoming.recv().await.unwrap();
        assert_eq!(reg_b.payload["isCreator"], false);

        // Both sides learn about each other.
        let joined_a = a.incoming.recv().await.unwrap();
        assert_eq!(joined_a.kind, SignalKind::PeerJoined);
        assert_eq!(joined_a.peer_id, "peer-b");
        let joined_b = b.incoming.recv().await.unwrap();
        assert_eq!(joined_b.peer_id, "peer-a");
    }

    #[tokio::test]
    async fn forwards_to_the_other_member() {
        let hub = MemoryRendezvous::new();
        let a = hub.connect("room-1", "peer-a");
        let mut b = hub.connect("room-1", "peer-b");

        // Drain handshake frames on b.
        b.incoming.recv().await.unwrap();
        b.incoming.recv().await.unwrap();

        a.outgoing
            .send(SignalMessage::new(
                SignalKind::Offer,
                "room-1",
                "peer-a",
                serde_json::json!({"sdp": "offer-sdp"}),
                1,
            ))
            .unwrap();

        let got = b.incoming.recv().await.unwrap();
        assert_eq!(got.kind, SignalKind::Offer);
        assert_eq!(got.payload["sdp"], "offer-sdp");
    }

    #[tokio::test]
    async fn dropping_a_link_emits_peer_left() {
        let hub = MemoryRendezvous::new();
        let a = hub.connect("room-1", "peer-a");
        let mut b = hub.connect("room-1", "peer-b");
        b.incoming.recv().await.unwrap();
        b.incoming.recv().await.unwrap();

        drop(a);
        let left = b.incoming.recv().await.unwrap();
        assert_eq!(left.kind, SignalKind::PeerLeft);
        assert_eq!(left.peer_id, "peer-a");
    }

    #[tokio::test]
    async fn third_member_is_rejected() {
        let hub = MemoryRendezvous::new();
        let _a = hub.connect("room-1", "peer-a");
        let _b = hub.connect("room-1", "peer-b");
        let mut c = hub.connect("room-1", "peer-c");

        let err = c.incoming.recv().await.unwrap();
        assert_eq!(err.kind, SignalKind::Error);
    }
}
