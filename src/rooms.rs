//! Peer and room membership, and room-wide fanout.
//!
//! Peers register a delivery address on connect; rooms are created on first
//! join and garbage-collected when the last member leaves. Broadcasts take a
//! membership snapshot so a peer disconnecting mid-fanout cannot abort it.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use actix::prelude::*;
use log::debug;

pub type PeerId = String;
pub type RoomId = String;

/// Fallback room for peers that publish or upload before joining anywhere.
pub const DEFAULT_ROOM: &str = "global";

/// JSON text pushed to one signaling connection.
#[derive(Message)]
#[rtype(result = "()")]
pub struct OutboundText(pub String);

struct PeerEntry {
    recipient: Recipient<OutboundText>,
    room_id: Option<RoomId>,
    role: Option<String>,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<PeerId, PeerEntry>,
    rooms: HashMap<RoomId, HashSet<PeerId>>,
}

/// Process-wide registry of connected peers and their rooms.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<Inner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a peer record on signaling connect.
    pub fn register(&self, peer_id: &str, recipient: Recipient<OutboundText>) {
        let mut inner = self.inner.write().unwrap();
        inner.peers.insert(
            peer_id.to_string(),
            PeerEntry {
                recipient,
                room_id: None,
                role: None,
            },
        );
    }

    /// Remove a peer entirely, leaving its room first.
    pub fn unregister(&self, peer_id: &str) {
        let mut inner = self.inner.write().unwrap();
        remove_from_room(&mut inner, peer_id);
        inner.peers.remove(peer_id);
    }

    /// Move a peer into `room_id`, leaving any prior room atomically.
    pub fn join_room(&self, peer_id: &str, room_id: &str) {
        let mut inner = self.inner.write().unwrap();
        remove_from_room(&mut inner, peer_id);
        if let Some(entry) = inner.peers.get_mut(peer_id) {
            entry.room_id = Some(room_id.to_string());
        } else {
            return;
        }
        inner
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(peer_id.to_string());
    }

    /// Remove a peer from its room, garbage-collecting the room if emptied.
    pub fn leave_room(&self, peer_id: &str) {
        let mut inner = self.inner.write().unwrap();
        remove_from_room(&mut inner, peer_id);
    }

    pub fn set_role(&self, peer_id: &str, role: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.peers.get_mut(peer_id) {
            entry.role = Some(role.to_string());
        }
    }

    pub fn role_of(&self, peer_id: &str) -> Option<String> {
        let inner = self.inner.read().unwrap();
        inner.peers.get(peer_id).and_then(|entry| entry.role.clone())
    }

    pub fn room_of(&self, peer_id: &str) -> Option<RoomId> {
        let inner = self.inner.read().unwrap();
        inner
            .peers
            .get(peer_id)
            .and_then(|entry| entry.room_id.clone())
    }

    /// Peer ids currently in `room_id`.
    pub fn members_of(&self, room_id: &str) -> Vec<PeerId> {
        let inner = self.inner.read().unwrap();
        inner
            .rooms
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        self.inner.read().unwrap().rooms.contains_key(room_id)
    }

    /// Serialize `payload` once and push it to every live peer in the room.
    /// Delivery failures to individual peers are ignored.
    pub fn broadcast(&self, room_id: &str, payload: &serde_json::Value) {
        let recipients: Vec<Recipient<OutboundText>> = {
            let inner = self.inner.read().unwrap();
            match inner.rooms.get(room_id) {
                Some(members) => members
                    .iter()
                    .filter_map(|peer_id| inner.peers.get(peer_id))
                    .map(|entry| entry.recipient.clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        if recipients.is_empty() {
            debug!("broadcast to empty room {room_id}");
            return;
        }
        let text = payload.to_string();
        for recipient in recipients {
            let _ = recipient.do_send(OutboundText(text.clone()));
        }
    }
}

fn remove_from_room(inner: &mut Inner, peer_id: &str) {
    let prior = match inner.peers.get_mut(peer_id) {
        Some(entry) => entry.room_id.take(),
        None => None,
    };
    if let Some(room_id) = prior {
        if let Some(members) = inner.rooms.get_mut(&room_id) {
            members.remove(peer_id);
            if members.is_empty() {
                inner.rooms.remove(&room_id);
            }
        }
    }
}
