use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages a client sends to the coordinator over the WebSocket.
///
/// Offer, answer and ICE payloads are opaque: the coordinator relays them
/// verbatim to the other room member and never inspects them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom {
        room_name: String,
        nickname: String,
    },
    Offer {
        payload: Value,
        room_name: String,
    },
    Answer {
        payload: Value,
        room_name: String,
    },
    Ice {
        payload: Value,
        room_name: String,
    },
}

/// Messages the coordinator sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join acknowledgement. Over a bare socket success has to be explicit;
    /// a rejected join arrives as `error` instead.
    Joined { room_name: String },
    /// Sent to the existing member when a second member joins.
    Welcome { nickname: String },
    Offer { payload: Value },
    Answer { payload: Value },
    Ice { payload: Value },
    /// Sent to the remaining member when the other one departs.
    Bye { nickname: String },
    Error { code: u16, message: String },
}

impl ServerMessage {
    pub fn error(code: u16, message: &str) -> Self {
        ServerMessage::Error {
            code,
            message: message.to_string(),
        }
    }
}

/// Which kind of negotiation payload is being relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Offer,
    Answer,
    Ice,
}

impl RelayKind {
    /// Wraps an opaque payload into the server-side message delivered to the
    /// other room member.
    pub fn wrap(self, payload: Value) -> ServerMessage {
        match self {
            RelayKind::Offer => ServerMessage::Offer { payload },
            RelayKind::Answer => ServerMessage::Answer { payload },
            RelayKind::Ice => ServerMessage::Ice { payload },
        }
    }
}

/// Text chat exchanged over the peer-to-peer data channel, never through the
/// coordinator. Wire format: UTF-8 JSON `{ "name": ..., "message": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub name: String,
    pub message: String,
}
