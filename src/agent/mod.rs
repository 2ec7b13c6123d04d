pub mod session;

pub use session::NegotiationAgent;

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{AppError, Result};
use crate::ws::ClientMessage;

/// Local capture capability. Returns the tracks to attach to the call, or
/// `MediaAccessDenied` when the hardware is unavailable or refused.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_tracks(&self) -> Result<Vec<Arc<dyn TrackLocal + Send + Sync>>>;
}

/// Display surface and UI sink for one participant. The agent pushes every
/// user-visible development of the call through this trait; it contains no
/// protocol logic.
#[async_trait]
pub trait CallEvents: Send + Sync {
    async fn on_local_tracks(&self, tracks: &[Arc<dyn TrackLocal + Send + Sync>]);
    async fn on_remote_track(&self, track: Arc<TrackRemote>);
    async fn on_chat(&self, name: &str, message: &str, local: bool);
    async fn on_peer_arrived(&self, nickname: &str);
    async fn on_peer_left(&self, nickname: &str);
    async fn on_call_failed(&self, error: &AppError);
}

/// Opaque relay toward the room coordinator. Fire-and-forget: the agent
/// never assumes delivery, ordering beyond the transport's own, or replies.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, msg: ClientMessage);
}

/// Lifecycle of one participant's side of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    AwaitingMedia,
    Connecting,
    Connected,
    Ended,
}

/// Which half of the handshake this agent drives. Selected by the first peer
/// event received: `welcome` makes the agent the initiator, an inbound
/// `offer` makes it the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Responder,
}
