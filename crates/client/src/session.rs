//! Session controller: drives one consultation from authentication to
//! teardown.
//!
//! The controller runs as a single task that owns all session state. Slow
//! operations (connect + authenticate, room join, media grant + SDP work) run
//! as one pending *step* at a time; while a step is pending the task keeps
//! serving commands, signaling and peer events, and dropping the step is how
//! `leave()` cancels it. Negotiation messages that arrive while a step is
//! pending are queued and replayed in delivery order once it completes.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use teleconsult_protocol::{
    AuthToken, AuthenticatedUser, BROADCAST_TARGET, ClientConfig, ClientMessage, IceCandidate,
    Participant, Role, ServerMessage, SessionDescription, TimeoutConfig,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{SessionError, Step};
use crate::media::{LocalMedia, MediaConstraints, MediaDevices};
use crate::negotiation::{LinkState, NegotiationEngine, PeerEvent, PeerFactory, RemoteTrack};
use crate::signaling::{ChannelEvent, Connector, RequestTimeouts, SignalingChannel};

const EVENT_CAPACITY: usize = 256;

/// Remote candidates held back until a remote description exists.
const MAX_PENDING_REMOTE_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Authenticating,
    Authenticated,
    JoiningRoom,
    InRoom,
    Negotiating,
    Connected,
    Ended,
    Error,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Ended | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Authenticating => "authenticating",
            Phase::Authenticated => "authenticated",
            Phase::JoiningRoom => "joining-room",
            Phase::InRoom => "in-room",
            Phase::Negotiating => "negotiating",
            Phase::Connected => "connected",
            Phase::Ended => "ended",
            Phase::Error => "error",
        };
        f.write_str(name)
    }
}

/// Who is calling into which room. Fixed for the life of the session.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub token: AuthToken,
    pub room_code: String,
    pub role: Role,
    pub participant: String,
}

/// Snapshot published to observers after every transition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionState {
    pub phase: Phase,
    pub is_connected: bool,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub last_error: Option<SessionError>,
    pub participants: Vec<Participant>,
}

/// The remote participant's stream. Surfaced once; tracks that arrive later
/// are appended to the same handle.
#[derive(Clone)]
pub struct RemoteMedia {
    stream_id: String,
    tracks: Arc<Mutex<Vec<RemoteTrack>>>,
}

impl RemoteMedia {
    fn new(first: RemoteTrack) -> Self {
        Self {
            stream_id: first.stream_id.clone(),
            tracks: Arc::new(Mutex::new(vec![first])),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, track: RemoteTrack) {
        self.tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(track);
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.tracks().len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(Phase),
    ConnectionChanged(bool),
    ParticipantsJoined(Vec<Participant>),
    ParticipantLeft(String),
    LocalStream(Arc<LocalMedia>),
    RemoteStream(RemoteMedia),
    RemoteAudioToggled {
        participant_id: Option<String>,
        muted: bool,
    },
    RemoteVideoToggled {
        participant_id: Option<String>,
        video_off: bool,
    },
    Error(SessionError),
}

enum Command {
    ToggleAudio(oneshot::Sender<Result<bool, SessionError>>),
    ToggleVideo(oneshot::Sender<Result<bool, SessionError>>),
    Leave(oneshot::Sender<()>),
}

/// Cheap-to-clone handle for observing and driving a session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Mute or unmute the microphone. Returns the new `is_muted`.
    pub async fn toggle_audio(&self) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ToggleAudio(tx)).is_err() {
            return Err(SessionError::MediaNotReady);
        }
        rx.await.unwrap_or(Err(SessionError::MediaNotReady))
    }

    /// Turn the camera off or on. Returns the new `is_video_off`.
    pub async fn toggle_video(&self) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ToggleVideo(tx)).is_err() {
            return Err(SessionError::MediaNotReady);
        }
        rx.await.unwrap_or(Err(SessionError::MediaNotReady))
    }

    /// End the session. Returns once teardown has completed; safe to call
    /// from any phase and any number of times.
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Leave(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Wait for the session to reach `Ended` or `Error`.
    pub async fn closed(&self) -> SessionState {
        let mut state = self.state.clone();
        let result = state.wait_for(|s| s.phase.is_terminal()).await.map(|s| s.clone());
        match result {
            Ok(state) => state,
            Err(_) => state.borrow().clone(),
        }
    }
}

pub struct SessionController {
    identity: SessionIdentity,
    timeouts: TimeoutConfig,
    constraints: MediaConstraints,
    channel: SignalingChannel,
    devices: Arc<dyn MediaDevices>,
    engine: NegotiationEngine,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: mpsc::UnboundedReceiver<Command>,
}

impl SessionController {
    pub fn new(
        identity: SessionIdentity,
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerFactory>,
    ) -> Self {
        let channel = SignalingChannel::new(connector, RequestTimeouts::from(&config.timeouts));
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(identity.role, peers, peer_tx);
        let (state, _) = watch::channel(SessionState::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            timeouts: config.timeouts.clone(),
            constraints: MediaConstraints::from(&config.media),
            channel,
            devices,
            engine,
            peer_rx,
            state,
            events,
            command_tx,
            command_rx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.command_tx.clone(),
            state: self.state.subscribe(),
            events: self.events.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Spawn the session task and begin authenticating.
    pub fn start(self) -> SessionHandle {
        let handle = self.handle();
        let signaling = self.channel.subscribe();
        let (actor, command_rx, peer_rx) = self.into_actor();
        tokio::spawn(actor.run(command_rx, signaling, peer_rx));
        handle
    }

    fn into_actor(
        self,
    ) -> (
        Actor,
        mpsc::UnboundedReceiver<Command>,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let SessionController {
            identity,
            timeouts,
            constraints,
            channel,
            devices,
            engine,
            peer_rx,
            state,
            events,
            command_tx,
            command_rx,
        } = self;
        // Handles own the only senders; when all are gone no command can arrive
        drop(command_tx);

        let actor = Actor {
            identity,
            timeouts,
            constraints,
            channel,
            devices,
            engine: Arc::new(tokio::sync::Mutex::new(engine)),
            state,
            events,
            step: None,
            media: None,
            remote_media: None,
            join_requested: false,
            local_description: None,
            awaiting_answer: false,
            remote_applied: false,
            accepted_offer_ufrag: None,
            remote_peer: None,
            deferred: VecDeque::new(),
            pending_remote_candidates: VecDeque::new(),
            pending_local_candidates: Vec::new(),
            deadline: None,
            torn_down: false,
        };
        (actor, command_rx, peer_rx)
    }
}

type StepFuture = Pin<Box<dyn Future<Output = StepOutcome> + Send>>;

enum StepOutcome {
    Authenticated(Result<AuthenticatedUser, SessionError>),
    Joined(Result<Vec<Participant>, SessionError>),
    MediaFailed(SessionError),
    LocalDescription {
        media: Arc<LocalMedia>,
        result: Result<SessionDescription, SessionError>,
    },
    AnswerApplied(Result<(), SessionError>),
}

struct Actor {
    identity: SessionIdentity,
    timeouts: TimeoutConfig,
    constraints: MediaConstraints,
    channel: SignalingChannel,
    devices: Arc<dyn MediaDevices>,
    engine: Arc<tokio::sync::Mutex<NegotiationEngine>>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,

    step: Option<StepFuture>,
    media: Option<Arc<LocalMedia>>,
    remote_media: Option<RemoteMedia>,
    join_requested: bool,
    /// Set once our offer or answer has been sent.
    local_description: Option<SessionDescription>,
    awaiting_answer: bool,
    remote_applied: bool,
    accepted_offer_ufrag: Option<String>,
    /// Participant our negotiation messages are addressed to.
    remote_peer: Option<String>,
    deferred: VecDeque<ServerMessage>,
    pending_remote_candidates: VecDeque<IceCandidate>,
    pending_local_candidates: Vec<IceCandidate>,
    deadline: Option<Instant>,
    torn_down: bool,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signaling: broadcast::Receiver<ChannelEvent>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        info!(
            room = %self.identity.room_code,
            role = %self.identity.role,
            participant = %self.identity.participant,
            "Session starting"
        );
        self.set_phase(Phase::Authenticating);
        self.step = Some(self.authenticate_step());

        while !self.phase().is_terminal() {
            tokio::select! {
                biased;
                Some(command) = commands.recv() => self.handle_command(command).await,
                outcome = next_step(&mut self.step) => self.handle_step(outcome).await,
                event = signaling.recv() => self.handle_channel_event(event).await,
                Some(event) = peer_rx.recv() => self.handle_peer_event(event).await,
                _ = sleep_until(self.deadline) => {
                    self.fail(SessionError::Timeout(Step::Negotiation)).await;
                }
            }
        }

        // Answer anything queued behind the final transition
        while let Ok(command) = commands.try_recv() {
            self.handle_command(command).await;
        }
        info!(phase = %self.phase(), "Session finished");
    }

    fn phase(&self) -> Phase {
        self.state.borrow().phase
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_phase(&self, phase: Phase) {
        self.state.send_modify(|s| s.phase = phase);
        debug!(%phase, "Session phase changed");
        self.emit(SessionEvent::PhaseChanged(phase));
    }

    fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        self.channel.send(message)
    }

    fn target(&self) -> String {
        self.remote_peer
            .clone()
            .unwrap_or_else(|| BROADCAST_TARGET.to_string())
    }

    // -- steps ---------------------------------------------------------

    fn authenticate_step(&self) -> StepFuture {
        let channel = self.channel.clone();
        let token = self.identity.token.clone();
        let room_code = self.identity.room_code.clone();
        Box::pin(async move {
            let result = async {
                channel.connect().await?;
                channel.authenticate(&token, &room_code).await
            }
            .await;
            StepOutcome::Authenticated(result)
        })
    }

    fn join_step(&self) -> StepFuture {
        let channel = self.channel.clone();
        let room_code = self.identity.room_code.clone();
        let role = self.identity.role;
        Box::pin(async move { StepOutcome::Joined(channel.join_room(&room_code, role).await) })
    }

    /// Acquire media (once), attach it to the peer connection, then create
    /// the offer or answer `remote_offer`.
    fn describe_step(&self, remote_offer: Option<SessionDescription>) -> StepFuture {
        let devices = Arc::clone(&self.devices);
        let constraints = self.constraints.clone();
        let existing = self.media.clone();
        let engine = Arc::clone(&self.engine);
        Box::pin(async move {
            let media = match existing {
                Some(media) => media,
                None => match devices.acquire(&constraints).await {
                    Ok(media) => Arc::new(media),
                    Err(e) => return StepOutcome::MediaFailed(e),
                },
            };
            let result = async {
                let mut engine = engine.lock().await;
                engine.ensure_connection(&media).await?;
                match &remote_offer {
                    Some(offer) => engine.accept_offer(offer).await,
                    None => engine.create_offer().await,
                }
            }
            .await;
            StepOutcome::LocalDescription { media, result }
        })
    }

    fn apply_answer_step(&self, answer: SessionDescription) -> StepFuture {
        let engine = Arc::clone(&self.engine);
        Box::pin(async move {
            StepOutcome::AnswerApplied(engine.lock().await.apply_answer(&answer).await)
        })
    }

    async fn handle_step(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Authenticated(Ok(user)) => {
                info!(user_type = ?user.user_type, "Authenticated");
                self.set_phase(Phase::Authenticated);
                self.set_phase(Phase::JoiningRoom);
                self.join_requested = true;
                self.step = Some(self.join_step());
            }
            StepOutcome::Joined(Ok(participants)) => {
                info!(participants = participants.len(), "Joined room");
                self.state
                    .send_modify(|s| s.participants = participants.clone());
                if !participants.is_empty() {
                    self.emit(SessionEvent::ParticipantsJoined(participants));
                }
                self.set_phase(Phase::InRoom);
                if self.identity.role.is_initiator() {
                    self.set_phase(Phase::Negotiating);
                    self.step = Some(self.describe_step(None));
                }
            }
            StepOutcome::MediaFailed(e) => {
                error!("Local media unavailable: {e}");
                self.fail(e).await;
            }
            StepOutcome::LocalDescription { media, result } => {
                if self.media.is_none() {
                    self.media = Some(Arc::clone(&media));
                    self.emit(SessionEvent::LocalStream(media));
                }
                match result {
                    Ok(desc) => self.send_local_description(desc).await,
                    Err(e) => self.fail(e).await,
                }
            }
            StepOutcome::AnswerApplied(result) => match result {
                Ok(()) => {
                    self.awaiting_answer = false;
                    self.remote_applied = true;
                    self.flush_remote_candidates().await;
                }
                Err(e) => self.fail(e).await,
            },
            // Auth and join failures are terminal whatever their kind
            StepOutcome::Authenticated(Err(e)) | StepOutcome::Joined(Err(e)) => {
                error!("Session failed: {e}");
                self.finish(Phase::Error, Some(e)).await;
            }
        }
        self.replay_deferred().await;
    }

    async fn send_local_description(&mut self, desc: SessionDescription) {
        let room_code = self.identity.room_code.clone();
        let target = self.target();
        let message = if self.identity.role.is_initiator() {
            self.awaiting_answer = true;
            ClientMessage::Offer {
                room_code,
                sdp: desc.clone(),
                target,
            }
        } else {
            // Our answer means the remote offer is applied
            self.remote_applied = true;
            ClientMessage::Answer {
                room_code,
                sdp: desc.clone(),
                target,
            }
        };
        info!(event = message.event_name(), target = %self.target(), "Sending local description");
        if let Err(e) = self.send(message) {
            self.fail(e).await;
            return;
        }
        self.local_description = Some(desc);
        self.deadline = Some(Instant::now() + self.timeouts.negotiation());

        for candidate in std::mem::take(&mut self.pending_local_candidates) {
            self.send_local_candidate(candidate).await;
        }
        if self.remote_applied {
            self.flush_remote_candidates().await;
        }
    }

    async fn replay_deferred(&mut self) {
        while self.step.is_none() && !self.phase().is_terminal() {
            let Some(message) = self.deferred.pop_front() else {
                break;
            };
            self.handle_message(message).await;
        }
    }

    // -- commands ------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ToggleAudio(reply) => {
                let _ = reply.send(self.toggle(true));
            }
            Command::ToggleVideo(reply) => {
                let _ = reply.send(self.toggle(false));
            }
            Command::Leave(reply) => {
                if !self.phase().is_terminal() {
                    info!("Leaving session");
                    self.finish(Phase::Ended, None).await;
                }
                let _ = reply.send(());
            }
        }
    }

    fn toggle(&mut self, audio: bool) -> Result<bool, SessionError> {
        if self.phase().is_terminal() {
            return Err(SessionError::MediaNotReady);
        }
        let media = self.media.as_ref().ok_or(SessionError::MediaNotReady)?;
        let room_code = self.identity.room_code.clone();
        let (off, message) = if audio {
            let muted = !self.state.borrow().is_muted;
            media.set_audio_enabled(!muted);
            self.state.send_modify(|s| s.is_muted = muted);
            (muted, ClientMessage::ToggleAudio { room_code, muted })
        } else {
            let video_off = !self.state.borrow().is_video_off;
            media.set_video_enabled(!video_off);
            self.state.send_modify(|s| s.is_video_off = video_off);
            (
                video_off,
                ClientMessage::ToggleVideo {
                    room_code,
                    video_off,
                },
            )
        };
        // A send failure means the transport is gone; the disconnect event
        // ends the session separately.
        if let Err(e) = self.send(message) {
            warn!("Failed to notify toggle: {e}");
        }
        Ok(off)
    }

    // -- signaling -----------------------------------------------------

    async fn handle_channel_event(&mut self, event: Result<ChannelEvent, broadcast::error::RecvError>) {
        match event {
            Ok(ChannelEvent::Message(message)) => {
                if message.is_negotiation() && (self.step.is_some() || !self.deferred.is_empty()) {
                    debug!("Deferring negotiation message until the current step completes");
                    self.deferred.push_back(message);
                } else {
                    self.handle_message(message).await;
                }
            }
            Ok(ChannelEvent::Disconnected(reason)) => {
                warn!(%reason, "Signaling channel lost");
                self.fail(SessionError::TransportError(reason)).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                error!(skipped, "Session fell behind the signaling channel");
                self.fail(SessionError::TransportError(format!(
                    "{skipped} signaling messages lost"
                )))
                .await;
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.fail(SessionError::TransportError(
                    "signaling channel dropped".to_string(),
                ))
                .await;
            }
        }
    }

    async fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Offer { sdp, from } => self.on_offer(sdp, from).await,
            ServerMessage::Answer { sdp, from } => self.on_answer(sdp, from),
            ServerMessage::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await;
            }
            ServerMessage::ParticipantJoined(participant) => self.on_participant_joined(participant),
            ServerMessage::ParticipantLeft { participant_id }
            | ServerMessage::ParticipantDisconnected { participant_id } => {
                info!(%participant_id, "Participant left");
                self.state
                    .send_modify(|s| s.participants.retain(|p| p.participant_id != participant_id));
                self.emit(SessionEvent::ParticipantLeft(participant_id));
            }
            ServerMessage::AudioToggled {
                participant_id,
                muted,
            } => self.emit(SessionEvent::RemoteAudioToggled {
                participant_id,
                muted,
            }),
            ServerMessage::VideoToggled {
                participant_id,
                video_off,
            } => self.emit(SessionEvent::RemoteVideoToggled {
                participant_id,
                video_off,
            }),
            ServerMessage::ForceClosed { reason } => {
                let reason = reason.unwrap_or_else(|| "conference closed".to_string());
                warn!(%reason, "Conference force-closed by server");
                self.finish(Phase::Ended, Some(SessionError::RemoteForceClosed(reason)))
                    .await;
            }
            ServerMessage::Error { message } => {
                if matches!(self.phase(), Phase::Authenticating | Phase::JoiningRoom) {
                    // The pending request consumes it and ends the session
                    debug!(%message, "Server error answers the pending request");
                } else {
                    self.report(SessionError::Server(message));
                }
            }
            // Consumed by the authenticate/join requests
            ServerMessage::Authenticated { .. }
            | ServerMessage::AuthError { .. }
            | ServerMessage::RoomJoined { .. } => {}
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription, from: Option<String>) {
        if let Some(ufrag) = offer.ice_ufrag()
            && self.accepted_offer_ufrag.as_deref() == Some(ufrag)
        {
            info!(ufrag, "Ignoring duplicate offer (same ICE ufrag)");
            return;
        }
        if self.identity.role.is_initiator() {
            self.report(SessionError::InvalidNegotiationState(
                "the initiator does not accept offers".to_string(),
            ));
            return;
        }
        let phase = self.phase();
        if phase != Phase::InRoom {
            self.report(SessionError::InvalidNegotiationState(format!(
                "offer received while {phase}"
            )));
            return;
        }

        info!(from = ?from, "Received offer");
        self.accepted_offer_ufrag = offer.ice_ufrag().map(str::to_string);
        self.remote_peer = from;
        self.set_phase(Phase::Negotiating);
        self.step = Some(self.describe_step(Some(offer)));
    }

    fn on_answer(&mut self, answer: SessionDescription, from: Option<String>) {
        if self.phase() != Phase::Negotiating || !self.awaiting_answer {
            self.report(SessionError::InvalidNegotiationState(format!(
                "unexpected answer while {}",
                self.phase()
            )));
            return;
        }
        info!(from = ?from, "Received answer");
        if from.is_some() {
            self.remote_peer = from;
        }
        self.step = Some(self.apply_answer_step(answer));
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let phase = self.phase();
        if !matches!(phase, Phase::InRoom | Phase::Negotiating | Phase::Connected) {
            self.report(SessionError::InvalidNegotiationState(format!(
                "ICE candidate received while {phase}"
            )));
            return;
        }
        if !self.remote_applied {
            if self.pending_remote_candidates.len() >= MAX_PENDING_REMOTE_CANDIDATES {
                warn!("Too many early ICE candidates, dropping the oldest");
                self.pending_remote_candidates.pop_front();
            }
            self.pending_remote_candidates.push_back(candidate);
            return;
        }
        self.apply_remote_candidate(candidate).await;
    }

    async fn apply_remote_candidate(&mut self, candidate: IceCandidate) {
        let result = self
            .engine
            .lock()
            .await
            .add_remote_ice_candidate(&candidate)
            .await;
        if let Err(e) = result {
            self.fail(e).await;
        }
    }

    async fn flush_remote_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_remote_candidates);
        if !pending.is_empty() {
            debug!(count = pending.len(), "Applying buffered ICE candidates");
        }
        for candidate in pending {
            if self.phase().is_terminal() {
                return;
            }
            self.apply_remote_candidate(candidate).await;
        }
    }

    fn on_participant_joined(&mut self, participant: Participant) {
        info!(participant_id = %participant.participant_id, "Participant joined");
        self.state.send_modify(|s| {
            if !s
                .participants
                .iter()
                .any(|p| p.participant_id == participant.participant_id)
            {
                s.participants.push(participant.clone());
            }
        });

        // Someone who joins after our offer went out never saw it
        if self.identity.role.is_initiator()
            && self.phase() == Phase::Negotiating
            && self.awaiting_answer
            && let Some(offer) = self.local_description.clone()
        {
            info!(participant_id = %participant.participant_id, "Re-sending offer to late joiner");
            let message = ClientMessage::Offer {
                room_code: self.identity.room_code.clone(),
                sdp: offer,
                target: participant.participant_id.clone(),
            };
            if let Err(e) = self.send(message) {
                warn!("Failed to re-send offer: {e}");
            }
        }
        self.emit(SessionEvent::ParticipantsJoined(vec![participant]));
    }

    // -- peer ----------------------------------------------------------

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.local_description.is_none() {
                    self.pending_local_candidates.push(candidate);
                } else {
                    self.send_local_candidate(candidate).await;
                }
            }
            PeerEvent::RemoteTrack(track) => match &self.remote_media {
                Some(remote) => remote.push(track),
                None => {
                    let remote = RemoteMedia::new(track);
                    info!(stream_id = %remote.stream_id(), "Remote stream available");
                    self.remote_media = Some(remote.clone());
                    self.emit(SessionEvent::RemoteStream(remote));
                }
            },
            PeerEvent::StateChanged(LinkState::Connected) => {
                if self.phase() == Phase::Negotiating {
                    self.deadline = None;
                    self.state.send_modify(|s| s.is_connected = true);
                    self.set_phase(Phase::Connected);
                    self.emit(SessionEvent::ConnectionChanged(true));
                }
            }
            PeerEvent::StateChanged(LinkState::Disconnected) => {
                if self.phase() == Phase::Connected {
                    warn!("Peer connection lost, waiting for ICE to recover");
                    self.state.send_modify(|s| s.is_connected = false);
                    self.emit(SessionEvent::ConnectionChanged(false));
                    self.set_phase(Phase::Negotiating);
                    self.deadline = Some(Instant::now() + self.timeouts.negotiation());
                }
            }
            PeerEvent::StateChanged(LinkState::Connecting) => {
                debug!("Peer connection connecting");
            }
        }
    }

    async fn send_local_candidate(&mut self, candidate: IceCandidate) {
        let message = ClientMessage::IceCandidate {
            room_code: self.identity.room_code.clone(),
            candidate,
            target: self.target(),
        };
        if let Err(e) = self.send(message) {
            self.fail(e).await;
        }
    }

    // -- errors and teardown -------------------------------------------

    /// Record a non-fatal error and carry on.
    fn report(&self, error: SessionError) {
        warn!("Session error: {error}");
        self.state.send_modify(|s| s.last_error = Some(error.clone()));
        self.emit(SessionEvent::Error(error));
    }

    async fn fail(&mut self, error: SessionError) {
        if self.phase().is_terminal() {
            return;
        }
        if error.is_fatal() {
            error!("Session failed: {error}");
            self.finish(Phase::Error, Some(error)).await;
        } else {
            self.report(error);
        }
    }

    /// Tear down, then publish the terminal phase. The error event, if any,
    /// is emitted last.
    async fn finish(&mut self, phase: Phase, error: Option<SessionError>) {
        if self.phase().is_terminal() {
            return;
        }
        let was_connected = self.state.borrow().is_connected;
        self.teardown().await;

        self.state.send_modify(|s| {
            s.phase = phase;
            s.is_connected = false;
            if let Some(error) = &error {
                s.last_error = Some(error.clone());
            }
        });
        self.emit(SessionEvent::PhaseChanged(phase));
        if was_connected {
            self.emit(SessionEvent::ConnectionChanged(false));
        }
        if let Some(error) = error {
            self.emit(SessionEvent::Error(error));
        }
    }

    async fn teardown(&mut self) {
        if std::mem::replace(&mut self.torn_down, true) {
            return;
        }
        // Dropping the step cancels it and releases the engine lock
        self.step = None;
        self.deadline = None;
        self.deferred.clear();
        self.pending_remote_candidates.clear();
        self.pending_local_candidates.clear();

        if self.join_requested {
            let message = ClientMessage::LeaveRoom {
                room_code: self.identity.room_code.clone(),
            };
            if let Err(e) = self.send(message) {
                debug!("Could not send leave-room: {e}");
            }
        }
        self.engine.lock().await.close().await;
        if let Some(media) = &self.media {
            media.release();
        }
        self.channel.disconnect();
        self.state.send_modify(|s| s.is_connected = false);
        info!("Session torn down");
    }
}

async fn next_step(step: &mut Option<StepFuture>) -> StepOutcome {
    match step {
        Some(future) => {
            let outcome = future.await;
            *step = None;
            outcome
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
