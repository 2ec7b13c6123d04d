use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::agent::{CallEvents, CallRole, CallState, MediaSource, SignalingTransport};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::ws::{ChatMessage, ClientMessage, ServerMessage};

/// One participant's side of a call: drives the peer connection through the
/// offer/answer/candidate exchange and multiplexes the chat data channel
/// over the same connection.
///
/// All negotiation steps serialize on one lock; candidate and chat delivery
/// interleave with them but each is handled to completion.
pub struct NegotiationAgent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: Arc<Config>,
    room_name: String,
    nickname: String,
    api: API,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaSource>,
    events: Arc<dyn CallEvents>,
    session: Mutex<Session>,
}

struct Session {
    state: CallState,
    role: Option<CallRole>,
    pc: Option<Arc<RTCPeerConnection>>,
    dc: Option<Arc<RTCDataChannel>>,
    peer_nickname: Option<String>,
    /// Candidates that arrived before the remote description; drained once
    /// it is set. Applying them immediately would silently lose them.
    pending_candidates: Vec<RTCIceCandidateInit>,
    has_remote_description: bool,
    /// Chat typed before the data channel opened; flushed on open.
    chat_outbox: VecDeque<ChatMessage>,
    /// Bumped on every connection build and teardown; disarms stale
    /// negotiation deadlines.
    generation: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            state: CallState::Idle,
            role: None,
            pc: None,
            dc: None,
            peer_nickname: None,
            pending_candidates: Vec::new(),
            has_remote_description: false,
            chat_outbox: VecDeque::new(),
            generation: 0,
        }
    }
}

impl NegotiationAgent {
    pub fn new(
        config: Arc<Config>,
        room_name: String,
        nickname: String,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaSource>,
        events: Arc<dyn CallEvents>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            inner: Arc::new(AgentInner {
                config,
                room_name,
                nickname,
                api,
                transport,
                media,
                events,
                session: Mutex::new(Session::new()),
            }),
        })
    }

    pub fn room_name(&self) -> &str {
        &self.inner.room_name
    }

    pub fn nickname(&self) -> &str {
        &self.inner.nickname
    }

    pub async fn state(&self) -> CallState {
        self.inner.session.lock().await.state
    }

    /// Acquires local media and constructs the peer connection. The agent is
    /// then `Connecting` and ready to play either handshake role, decided by
    /// whichever of `welcome` or `offer` arrives first.
    pub async fn start_call(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        if session.state != CallState::Idle && session.state != CallState::Ended {
            return Err(AppError::BadRequest("Call already in progress".to_string()));
        }
        session.state = CallState::AwaitingMedia;

        let tracks = match self.inner.media.acquire_tracks().await {
            Ok(tracks) => tracks,
            Err(e) => {
                session.state = CallState::Idle;
                self.inner.events.on_call_failed(&e).await;
                return Err(e);
            }
        };
        self.inner.events.on_local_tracks(&tracks).await;

        let pc = match self.setup_connection(&tracks).await {
            Ok(pc) => pc,
            Err(e) => {
                session.state = CallState::Idle;
                self.inner.events.on_call_failed(&e).await;
                return Err(e);
            }
        };

        session.pc = Some(pc);
        session.state = CallState::Connecting;
        session.generation += 1;
        let generation = session.generation;
        drop(session);

        self.arm_negotiation_deadline(generation);

        tracing::info!(room = %self.inner.room_name, "Call started, awaiting peer");
        Ok(())
    }

    /// Reacts to one coordinator event.
    pub async fn handle_signal(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Joined { room_name } => {
                tracing::info!(room = %room_name, "Join acknowledged");
            }
            ServerMessage::Welcome { nickname } => self.handle_peer_arrived(&nickname).await,
            ServerMessage::Offer { payload } => self.handle_offer(payload).await,
            ServerMessage::Answer { payload } => self.handle_answer(payload).await,
            ServerMessage::Ice { payload } => self.handle_remote_candidate(payload).await,
            ServerMessage::Bye { nickname } => self.handle_peer_left(&nickname).await,
            ServerMessage::Error { code, message } => {
                let error = if code == 409 {
                    AppError::RoomFull
                } else {
                    AppError::BadRequest(message)
                };
                self.inner.events.on_call_failed(&error).await;
            }
        }
    }

    /// Sends a chat line. The local echo always happens; the wire copy is
    /// buffered until the data channel is open.
    pub async fn send_chat(&self, text: &str) {
        self.inner
            .events
            .on_chat(&self.inner.nickname, text, true)
            .await;

        let chat = ChatMessage {
            name: self.inner.nickname.clone(),
            message: text.to_string(),
        };

        let dc = {
            let mut session = self.inner.session.lock().await;
            match &session.dc {
                Some(dc) if dc.ready_state() == RTCDataChannelState::Open => dc.clone(),
                _ => {
                    if session.chat_outbox.len() >= self.inner.config.chat_buffer_size {
                        tracing::warn!("Chat buffer full, dropping oldest message");
                        session.chat_outbox.pop_front();
                    }
                    session.chat_outbox.push_back(chat);
                    return;
                }
            }
        };

        send_chat_on_channel(&dc, &chat).await;
    }

    /// The peer arrived while this agent was already in the room: this side
    /// initiates. Creates the chat channel, produces the offer and relays it.
    async fn handle_peer_arrived(&self, nickname: &str) {
        let mut session = self.inner.session.lock().await;
        if session.state != CallState::Connecting || session.role.is_some() {
            tracing::warn!(
                state = ?session.state,
                "Ignoring welcome outside of connection setup"
            );
            return;
        }
        let Some(pc) = session.pc.clone() else {
            return;
        };

        session.role = Some(CallRole::Initiator);
        session.peer_nickname = Some(nickname.to_string());

        let dc = match pc.create_data_channel("chat", None).await {
            Ok(dc) => dc,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create data channel");
                return;
            }
        };
        self.inner.register_data_channel(&dc);
        session.dc = Some(dc);

        let offer = match pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create offer");
                return;
            }
        };
        if let Err(e) = pc.set_local_description(offer.clone()).await {
            tracing::error!(error = %e, "Failed to set local description");
            return;
        }
        drop(session);

        match serde_json::to_value(&offer) {
            Ok(payload) => {
                self.inner
                    .transport
                    .send(ClientMessage::Offer {
                        payload,
                        room_name: self.inner.room_name.clone(),
                    })
                    .await;
                tracing::info!(peer = %nickname, "Sent offer");
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize offer"),
        }

        self.inner.events.on_peer_arrived(nickname).await;
    }

    /// An offer arrived first: this side responds. Registers the handler for
    /// the peer-opened data channel, answers, and relays the answer back.
    async fn handle_offer(&self, payload: serde_json::Value) {
        let offer: RTCSessionDescription = match serde_json::from_value(payload) {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed offer");
                return;
            }
        };

        let mut session = self.inner.session.lock().await;
        if session.state != CallState::Connecting || session.role.is_some() {
            tracing::warn!(state = ?session.state, "Ignoring offer outside of connection setup");
            return;
        }
        let Some(pc) = session.pc.clone() else {
            return;
        };

        session.role = Some(CallRole::Responder);

        let weak = Arc::downgrade(&self.inner);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                tracing::info!(label = %dc.label(), "Peer opened data channel");
                inner.register_data_channel(&dc);
                inner.session.lock().await.dc = Some(dc);
            })
        }));

        if let Err(e) = pc.set_remote_description(offer).await {
            tracing::error!(error = %e, "Failed to set remote description");
            session.role = None;
            return;
        }
        session.has_remote_description = true;

        let pending: Vec<RTCIceCandidateInit> = session.pending_candidates.drain(..).collect();
        apply_candidates(&pc, pending).await;

        let answer = match pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create answer");
                return;
            }
        };
        if let Err(e) = pc.set_local_description(answer.clone()).await {
            tracing::error!(error = %e, "Failed to set local description");
            return;
        }
        drop(session);

        match serde_json::to_value(&answer) {
            Ok(payload) => {
                self.inner
                    .transport
                    .send(ClientMessage::Answer {
                        payload,
                        room_name: self.inner.room_name.clone(),
                    })
                    .await;
                tracing::info!("Sent answer");
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize answer"),
        }
    }

    /// The peer accepted our offer. No reply is produced.
    async fn handle_answer(&self, payload: serde_json::Value) {
        let answer: RTCSessionDescription = match serde_json::from_value(payload) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed answer");
                return;
            }
        };

        let mut session = self.inner.session.lock().await;
        if session.role != Some(CallRole::Initiator) {
            tracing::warn!("Ignoring answer: not the initiator");
            return;
        }
        let Some(pc) = session.pc.clone() else {
            return;
        };

        if let Err(e) = pc.set_remote_description(answer).await {
            tracing::error!(error = %e, "Failed to set remote description");
            return;
        }
        session.has_remote_description = true;

        let pending: Vec<RTCIceCandidateInit> = session.pending_candidates.drain(..).collect();
        apply_candidates(&pc, pending).await;
    }

    /// A candidate the peer discovered. Candidate arrival order relative to
    /// offer/answer is not guaranteed; early arrivals are queued.
    async fn handle_remote_candidate(&self, payload: serde_json::Value) {
        let init: RTCIceCandidateInit = match serde_json::from_value(payload) {
            Ok(init) => init,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed ICE candidate");
                return;
            }
        };

        let mut session = self.inner.session.lock().await;
        if session.has_remote_description {
            if let Some(pc) = session.pc.clone() {
                drop(session);
                apply_candidates(&pc, vec![init]).await;
            }
        } else {
            session.pending_candidates.push(init);
        }
    }

    /// The peer departed. Tears the connection down and returns to `Idle` so
    /// a later call in the same session negotiates from a clean slate.
    async fn handle_peer_left(&self, nickname: &str) {
        let pc = {
            let mut session = self.inner.session.lock().await;
            session.role = None;
            session.peer_nickname = None;
            session.dc = None;
            session.has_remote_description = false;
            session.pending_candidates.clear();
            session.chat_outbox.clear();
            session.generation += 1;
            session.state = CallState::Idle;
            session.pc.take()
        };

        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                tracing::warn!(error = %e, "Error closing peer connection");
            }
        }

        tracing::info!(peer = %nickname, "Peer left, session reset");
        self.inner.events.on_peer_left(nickname).await;
    }

    /// Builds the peer connection, attaches local tracks and wires the
    /// continuous callbacks: candidate discovery, remote media, state.
    async fn setup_connection(
        &self,
        tracks: &[Arc<dyn webrtc::track::track_local::TrackLocal + Send + Sync>],
    ) -> Result<Arc<RTCPeerConnection>> {
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.inner.config.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(self.inner.api.new_peer_connection(rtc_config).await?);

        for track in tracks {
            let rtp_sender = pc.add_track(track.clone()).await?;
            // Drain RTCP so the sender does not stall.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
            });
        }

        // Every locally discovered candidate is relayed immediately, tagged
        // with the room name.
        let transport = self.inner.transport.clone();
        let room_name = self.inner.room_name.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let transport = transport.clone();
            let room_name = room_name.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_value(&init) {
                        Ok(payload) => {
                            transport
                                .send(ClientMessage::Ice { payload, room_name })
                                .await;
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to serialize candidate"),
                    },
                    Err(e) => tracing::error!(error = %e, "Failed to encode candidate"),
                }
            })
        }));

        // Remote media arriving is the point at which the call is visually
        // live for the display collaborator.
        let events = self.inner.events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                tracing::info!(kind = ?track.kind(), "Received remote track");
                events.on_remote_track(track).await;
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        pc.on_peer_connection_state_change(Box::new(move |pc_state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                tracing::info!(state = ?pc_state, "Peer connection state changed");
                if pc_state == RTCPeerConnectionState::Connected {
                    if let Some(inner) = weak.upgrade() {
                        let mut session = inner.session.lock().await;
                        if session.state == CallState::Connecting {
                            session.state = CallState::Connected;
                        }
                    }
                }
            })
        }));

        Ok(pc)
    }

    /// A call that never leaves `Connecting` would otherwise hang forever:
    /// there is no retry policy anywhere in the protocol.
    fn arm_negotiation_deadline(&self, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        let deadline = self.inner.config.negotiation_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let pc = {
                let mut session = inner.session.lock().await;
                if session.generation != generation || session.state != CallState::Connecting {
                    return;
                }
                session.state = CallState::Ended;
                session.role = None;
                session.dc = None;
                session.pc.take()
            };

            tracing::warn!("Negotiation deadline elapsed, ending call");
            if let Some(pc) = pc {
                let _ = pc.close().await;
            }
            inner.events.on_call_failed(&AppError::NegotiationTimedOut).await;
        });
    }
}

impl AgentInner {
    /// Wires chat delivery and the open-flush on a data channel, whichever
    /// side created it.
    fn register_data_channel(self: &Arc<Self>, dc: &Arc<RTCDataChannel>) {
        let events = self.events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                match parse_chat(&msg.data) {
                    Ok(chat) => events.on_chat(&chat.name, &chat.message, false).await,
                    Err(e) => tracing::warn!(error = %e, "Dropping chat payload"),
                }
            })
        }));

        let weak = Arc::downgrade(self);
        let opened = dc.clone();
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            let dc = opened.clone();
            Box::pin(async move {
                tracing::info!(label = %dc.label(), "Data channel open");
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let buffered: Vec<ChatMessage> = {
                    let mut session = inner.session.lock().await;
                    session.chat_outbox.drain(..).collect()
                };
                for chat in buffered {
                    send_chat_on_channel(&dc, &chat).await;
                }
            })
        }));
    }
}

/// Applies candidates, tolerating failures: a late or stale candidate after
/// the connection is established is a harmless no-op, never fatal.
async fn apply_candidates(pc: &RTCPeerConnection, candidates: Vec<RTCIceCandidateInit>) {
    for candidate in candidates {
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            tracing::warn!(error = %e, "Failed to apply ICE candidate");
        }
    }
}

async fn send_chat_on_channel(dc: &RTCDataChannel, chat: &ChatMessage) {
    match serde_json::to_string(chat) {
        Ok(json) => {
            if let Err(e) = dc.send_text(json).await {
                tracing::warn!(error = %e, "Failed to send chat");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to serialize chat"),
    }
}

fn parse_chat(data: &[u8]) -> Result<ChatMessage> {
    serde_json::from_slice(data).map_err(|e| AppError::MalformedChatPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use webrtc::track::track_local::TrackLocal;
    use webrtc::track::track_remote::TrackRemote;

    struct MockTransport {
        sent: Mutex<Vec<ClientMessage>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        async fn offers(&self) -> usize {
            self.sent
                .lock()
                .await
                .iter()
                .filter(|m| matches!(m, ClientMessage::Offer { .. }))
                .count()
        }
    }

    #[async_trait]
    impl SignalingTransport for MockTransport {
        async fn send(&self, msg: ClientMessage) {
            self.sent.lock().await.push(msg);
        }
    }

    struct NullMedia;

    #[async_trait]
    impl MediaSource for NullMedia {
        async fn acquire_tracks(&self) -> Result<Vec<Arc<dyn TrackLocal + Send + Sync>>> {
            Ok(Vec::new())
        }
    }

    struct DeniedMedia;

    #[async_trait]
    impl MediaSource for DeniedMedia {
        async fn acquire_tracks(&self) -> Result<Vec<Arc<dyn TrackLocal + Send + Sync>>> {
            Err(AppError::MediaAccessDenied("camera refused".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        log: Mutex<Vec<String>>,
    }

    impl RecordingEvents {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        async fn entries(&self) -> Vec<String> {
            self.log.lock().await.clone()
        }
    }

    #[async_trait]
    impl CallEvents for RecordingEvents {
        async fn on_local_tracks(&self, tracks: &[Arc<dyn TrackLocal + Send + Sync>]) {
            self.log
                .lock()
                .await
                .push(format!("local_tracks:{}", tracks.len()));
        }

        async fn on_remote_track(&self, _track: Arc<TrackRemote>) {
            self.log.lock().await.push("remote_track".to_string());
        }

        async fn on_chat(&self, name: &str, message: &str, local: bool) {
            self.log
                .lock()
                .await
                .push(format!("chat:{}:{}:{}", name, message, local));
        }

        async fn on_peer_arrived(&self, nickname: &str) {
            self.log
                .lock()
                .await
                .push(format!("peer_arrived:{}", nickname));
        }

        async fn on_peer_left(&self, nickname: &str) {
            self.log.lock().await.push(format!("peer_left:{}", nickname));
        }

        async fn on_call_failed(&self, error: &AppError) {
            self.log.lock().await.push(format!("call_failed:{}", error));
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config::default())
    }

    fn make_agent(
        config: Arc<Config>,
    ) -> (NegotiationAgent, Arc<MockTransport>, Arc<RecordingEvents>) {
        let transport = MockTransport::new();
        let events = RecordingEvents::new();
        let agent = NegotiationAgent::new(
            config,
            "r1".to_string(),
            "alice".to_string(),
            transport.clone(),
            Arc::new(NullMedia),
            events.clone(),
        )
        .unwrap();
        (agent, transport, events)
    }

    /// A real offer from an independent peer connection, as the coordinator
    /// would relay it.
    async fn remote_offer_payload() -> serde_json::Value {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        let _dc = pc.create_data_channel("chat", None).await.unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        serde_json::to_value(&offer).unwrap()
    }

    #[tokio::test]
    async fn welcome_makes_the_agent_initiate_with_an_offer() {
        let (agent, transport, events) = make_agent(test_config());

        agent.start_call().await.unwrap();
        assert_eq!(agent.state().await, CallState::Connecting);

        agent
            .handle_signal(ServerMessage::Welcome {
                nickname: "bob".to_string(),
            })
            .await;

        assert_eq!(transport.offers().await, 1);
        let sent = transport.sent.lock().await;
        let offer = sent
            .iter()
            .find_map(|m| match m {
                ClientMessage::Offer { payload, room_name } => {
                    assert_eq!(room_name, "r1");
                    Some(payload.clone())
                }
                _ => None,
            })
            .expect("no offer relayed");
        let desc: RTCSessionDescription = serde_json::from_value(offer).unwrap();
        assert!(!desc.sdp.is_empty());
        drop(sent);

        assert!(events
            .entries()
            .await
            .contains(&"peer_arrived:bob".to_string()));
    }

    #[tokio::test]
    async fn offer_makes_the_agent_respond_with_an_answer() {
        let (agent, transport, _events) = make_agent(test_config());

        agent.start_call().await.unwrap();
        let payload = remote_offer_payload().await;
        agent.handle_signal(ServerMessage::Offer { payload }).await;

        let sent = transport.sent.lock().await;
        let answer = sent
            .iter()
            .find_map(|m| match m {
                ClientMessage::Answer { payload, room_name } => {
                    assert_eq!(room_name, "r1");
                    Some(payload.clone())
                }
                _ => None,
            })
            .expect("no answer relayed");
        let desc: RTCSessionDescription = serde_json::from_value(answer).unwrap();
        assert!(!desc.sdp.is_empty());
        drop(sent);

        let session = agent.inner.session.lock().await;
        assert_eq!(session.role, Some(CallRole::Responder));
        assert!(session.has_remote_description);
    }

    #[tokio::test]
    async fn early_candidates_are_queued_until_remote_description() {
        let (agent, _transport, _events) = make_agent(test_config());
        agent.start_call().await.unwrap();

        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host".to_string(),
            ..Default::default()
        };
        let payload = serde_json::to_value(&init).unwrap();
        agent
            .handle_signal(ServerMessage::Ice {
                payload: payload.clone(),
            })
            .await;
        agent.handle_signal(ServerMessage::Ice { payload }).await;

        assert_eq!(
            agent.inner.session.lock().await.pending_candidates.len(),
            2
        );

        // Draining happens when the remote description is finally set.
        let offer = remote_offer_payload().await;
        agent
            .handle_signal(ServerMessage::Offer { payload: offer })
            .await;
        assert!(agent
            .inner
            .session
            .lock()
            .await
            .pending_candidates
            .is_empty());

        // With the remote description in place, later candidates are applied
        // directly and never touch the queue.
        let late = RTCIceCandidateInit {
            candidate: "candidate:2 1 UDP 2122252542 192.0.2.2 54322 typ host".to_string(),
            ..Default::default()
        };
        agent
            .handle_signal(ServerMessage::Ice {
                payload: serde_json::to_value(&late).unwrap(),
            })
            .await;
        assert!(agent
            .inner
            .session
            .lock()
            .await
            .pending_candidates
            .is_empty());
    }

    #[tokio::test]
    async fn welcome_outside_a_call_is_ignored() {
        let (agent, transport, _events) = make_agent(test_config());

        agent
            .handle_signal(ServerMessage::Welcome {
                nickname: "bob".to_string(),
            })
            .await;

        assert_eq!(transport.offers().await, 0);
        assert!(agent.inner.session.lock().await.role.is_none());
    }

    #[tokio::test]
    async fn second_welcome_does_not_produce_a_second_offer() {
        let (agent, transport, _events) = make_agent(test_config());
        agent.start_call().await.unwrap();

        agent
            .handle_signal(ServerMessage::Welcome {
                nickname: "bob".to_string(),
            })
            .await;
        agent
            .handle_signal(ServerMessage::Welcome {
                nickname: "mallory".to_string(),
            })
            .await;

        assert_eq!(transport.offers().await, 1);
    }

    #[tokio::test]
    async fn chat_is_echoed_locally_and_buffered_without_a_channel() {
        let (agent, _transport, events) = make_agent(test_config());

        agent.send_chat("hi there").await;

        assert!(events
            .entries()
            .await
            .contains(&"chat:alice:hi there:true".to_string()));
        assert_eq!(agent.inner.session.lock().await.chat_outbox.len(), 1);
    }

    #[tokio::test]
    async fn chat_buffer_is_bounded() {
        let config = Arc::new(Config {
            chat_buffer_size: 2,
            ..Config::default()
        });
        let (agent, _transport, _events) = make_agent(config);

        agent.send_chat("one").await;
        agent.send_chat("two").await;
        agent.send_chat("three").await;

        let session = agent.inner.session.lock().await;
        assert_eq!(session.chat_outbox.len(), 2);
        assert_eq!(session.chat_outbox[0].message, "two");
    }

    #[tokio::test]
    async fn bye_resets_the_session_for_a_second_call() {
        let (agent, transport, events) = make_agent(test_config());

        agent.start_call().await.unwrap();
        agent
            .handle_signal(ServerMessage::Welcome {
                nickname: "bob".to_string(),
            })
            .await;
        agent
            .handle_signal(ServerMessage::Bye {
                nickname: "bob".to_string(),
            })
            .await;

        assert_eq!(agent.state().await, CallState::Idle);
        assert!(agent.inner.session.lock().await.pc.is_none());
        assert!(events.entries().await.contains(&"peer_left:bob".to_string()));

        // A second call negotiates from scratch.
        agent.start_call().await.unwrap();
        agent
            .handle_signal(ServerMessage::Welcome {
                nickname: "carol".to_string(),
            })
            .await;
        assert_eq!(transport.offers().await, 2);
    }

    #[tokio::test]
    async fn denied_media_surfaces_the_failure() {
        let transport = MockTransport::new();
        let events = RecordingEvents::new();
        let agent = NegotiationAgent::new(
            test_config(),
            "r1".to_string(),
            "alice".to_string(),
            transport,
            Arc::new(DeniedMedia),
            events.clone(),
        )
        .unwrap();

        let result = agent.start_call().await;
        assert!(matches!(result, Err(AppError::MediaAccessDenied(_))));
        assert_eq!(agent.state().await, CallState::Idle);
        assert!(events
            .entries()
            .await
            .iter()
            .any(|e| e.starts_with("call_failed:Media access denied")));
    }

    #[tokio::test]
    async fn stuck_negotiation_times_out() {
        let config = Arc::new(Config {
            negotiation_timeout: Duration::from_millis(50),
            ..Config::default()
        });
        let (agent, _transport, events) = make_agent(config);

        agent.start_call().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(agent.state().await, CallState::Ended);
        assert!(events
            .entries()
            .await
            .contains(&"call_failed:Negotiation timed out".to_string()));
    }

    #[tokio::test]
    async fn server_room_full_error_reaches_the_display() {
        let (agent, _transport, events) = make_agent(test_config());

        agent
            .handle_signal(ServerMessage::error(409, "2 people max. allowed per room."))
            .await;

        assert!(events
            .entries()
            .await
            .iter()
            .any(|e| e.starts_with("call_failed:2 people max")));
    }

    #[test]
    fn malformed_chat_payload_is_rejected() {
        let err = parse_chat(b"not json").unwrap_err();
        assert!(matches!(err, AppError::MalformedChatPayload(_)));

        let ok = parse_chat(br#"{"name":"alice","message":"hi"}"#).unwrap();
        assert_eq!(ok.name, "alice");
        assert_eq!(ok.message, "hi");
    }
}
