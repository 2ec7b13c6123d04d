use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AppError;
use crate::ws::{RelayKind, ServerMessage};

/// Nickname assigned to a connection until it joins a room.
const DEFAULT_NICKNAME: &str = "Anon";

/// A connected participant, tracked from transport connect to disconnect.
struct Member {
    nickname: String,
    room: Option<String>,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl Member {
    fn send(&self, msg: ServerMessage) {
        if self.sender.send(msg).is_err() {
            tracing::warn!(nickname = %self.nickname, "Dropping message for closed connection");
        }
    }
}

/// Process-wide room membership state.
///
/// Constructed once at server start and injected into the WebSocket layer;
/// rooms are created implicitly on first join and destroyed when the last
/// member leaves. Every room holds at most two members. Each mutation locks
/// the room's own entry, so concurrent joins to the same room serialize and
/// the capacity check cannot race.
pub struct RoomRegistry {
    members: DashMap<Uuid, Member>,
    rooms: DashMap<String, Vec<Uuid>>,
}

impl RoomRegistry {
    pub const ROOM_CAPACITY: usize = 2;

    pub fn new() -> Self {
        Self {
            members: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Registers a new transport connection and returns its id.
    pub fn connect(&self, sender: mpsc::UnboundedSender<ServerMessage>) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.members.insert(
            conn_id,
            Member {
                nickname: DEFAULT_NICKNAME.to_string(),
                room: None,
                sender,
            },
        );
        conn_id
    }

    /// Admits a member into a room, or rejects it.
    ///
    /// On success the member's nickname is set, it is appended to the room
    /// and the other member (at most one) receives `welcome`. On `RoomFull`
    /// the member is not added and nothing is broadcast.
    pub fn join(&self, conn_id: Uuid, room_name: &str, nickname: &str) -> Result<(), AppError> {
        if room_name.is_empty() {
            return Err(AppError::BadRequest("Room name is required".to_string()));
        }
        if nickname.is_empty() {
            return Err(AppError::BadRequest("Nickname is required".to_string()));
        }

        let mut member = self
            .members
            .get_mut(&conn_id)
            .ok_or_else(|| AppError::NotFound("Unknown connection".to_string()))?;
        if member.room.is_some() {
            return Err(AppError::BadRequest("Already in a room".to_string()));
        }

        // Entry lock serializes the capacity check with concurrent joins.
        let mut room = self.rooms.entry(room_name.to_string()).or_default();
        if room.len() >= Self::ROOM_CAPACITY {
            return Err(AppError::RoomFull);
        }

        member.nickname = nickname.to_string();
        member.room = Some(room_name.to_string());

        let others: Vec<Uuid> = room.clone();
        room.push(conn_id);
        drop(room);
        drop(member);

        for other in others {
            if let Some(peer) = self.members.get(&other) {
                peer.send(ServerMessage::Welcome {
                    nickname: nickname.to_string(),
                });
            }
        }

        tracing::info!(room = %room_name, nickname = %nickname, "Member joined room");
        Ok(())
    }

    /// Forwards a negotiation payload unchanged to every other member of the
    /// room (at most one). Payload-agnostic; no acknowledgement. Relaying
    /// into a room the sender does not belong to is a no-op.
    pub fn relay(&self, conn_id: Uuid, kind: RelayKind, payload: serde_json::Value, room_name: &str) {
        let is_member = self
            .members
            .get(&conn_id)
            .is_some_and(|m| m.room.as_deref() == Some(room_name));
        if !is_member {
            tracing::warn!(room = %room_name, "Relay from non-member ignored");
            return;
        }

        let Some(room) = self.rooms.get(room_name) else {
            return;
        };
        let targets: Vec<Uuid> = room.iter().filter(|id| **id != conn_id).copied().collect();
        drop(room);

        for target in targets {
            if let Some(peer) = self.members.get(&target) {
                peer.send(kind.wrap(payload.clone()));
            }
        }
    }

    /// Removes a member, broadcasting `bye` to whoever shared its room and
    /// destroying the room if it empties. Idempotent: a second call for the
    /// same connection is a no-op and produces no second broadcast.
    pub fn disconnect(&self, conn_id: Uuid) {
        let Some((_, member)) = self.members.remove(&conn_id) else {
            return;
        };

        let Some(room_name) = member.room else {
            return;
        };

        let remaining: Vec<Uuid> = {
            let Some(mut room) = self.rooms.get_mut(&room_name) else {
                return;
            };
            room.retain(|id| *id != conn_id);
            room.clone()
        };

        if remaining.is_empty() {
            self.rooms.remove(&room_name);
            tracing::info!(room = %room_name, "Room destroyed");
        }

        for other in remaining {
            if let Some(peer) = self.members.get(&other) {
                peer.send(ServerMessage::Bye {
                    nickname: member.nickname.clone(),
                });
            }
        }

        tracing::info!(room = %room_name, nickname = %member.nickname, "Member left room");
    }

    /// Names of rooms that currently have at least one member. Diagnostic
    /// only; the negotiation protocol does not depend on it.
    pub fn public_rooms(&self) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
