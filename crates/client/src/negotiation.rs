//! Owns the single peer connection of a session and the SDP offer/answer
//! state around it.
//!
//! The engine never talks to signaling itself. Descriptions are returned to
//! the caller, remote descriptions and candidates are passed in, and
//! everything the peer reports asynchronously (local candidates, remote
//! tracks, connection state) arrives on the `PeerEvent` channel given at
//! construction.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use teleconsult_protocol::{IceCandidate, Role, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::track::track_remote::TrackRemote;

use crate::error::SessionError;
use crate::media::{LocalMedia, MediaKind};

/// Bumped for every peer connection created in this process, so log lines
/// from different sessions can be told apart.
static PEER_GENERATION: AtomicU64 = AtomicU64::new(0);

/// Peer connection state as surfaced to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

/// An incoming track. `track` is `None` for peers that do not carry real
/// RTP (tests).
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(LinkState),
}

/// The operations the engine needs from a peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach every track of `media`. Called once, before any description.
    async fn add_local_media(&self, media: Arc<LocalMedia>) -> Result<(), SessionError>;
    async fn create_offer(&self) -> Result<SessionDescription, SessionError>;
    async fn create_answer(&self) -> Result<SessionDescription, SessionError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), SessionError>;
    async fn set_remote_description(&self, desc: &SessionDescription)
    -> Result<(), SessionError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError>;
    async fn close(&self) -> Result<(), SessionError>;
}

/// Creates peer connections that report on `events`.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
}

/// The live connection and everything negotiated on it so far.
pub struct NegotiationContext {
    generation: u64,
    peer: Arc<dyn PeerConnection>,
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    local_candidates: Arc<Mutex<Vec<IceCandidate>>>,
    forwarder: JoinHandle<()>,
}

impl NegotiationContext {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    /// Local candidates gathered so far, in generation order.
    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

pub struct NegotiationEngine {
    role: Role,
    factory: Arc<dyn PeerFactory>,
    events: mpsc::UnboundedSender<PeerEvent>,
    context: Option<NegotiationContext>,
    closed: bool,
}

impl NegotiationEngine {
    pub fn new(
        role: Role,
        factory: Arc<dyn PeerFactory>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            role,
            factory,
            events,
            context: None,
            closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn context(&self) -> Option<&NegotiationContext> {
        self.context.as_ref()
    }

    pub fn has_remote_description(&self) -> bool {
        self.context.as_ref().is_some_and(|ctx| ctx.remote.is_some())
    }

    /// Create the peer connection on first call and attach the local tracks.
    /// Later calls return the generation of the existing connection.
    pub async fn ensure_connection(&mut self, media: &Arc<LocalMedia>) -> Result<u64, SessionError> {
        if let Some(ctx) = &self.context {
            debug!(generation = ctx.generation, "Reusing existing peer connection");
            return Ok(ctx.generation);
        }
        if self.closed {
            return Err(SessionError::InvalidNegotiationState(
                "negotiation engine already closed".to_string(),
            ));
        }

        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let peer = self.factory.create(peer_tx).await?;
        if let Err(e) = peer.add_local_media(Arc::clone(media)).await {
            let _ = peer.close().await;
            return Err(e);
        }

        // Record local candidates on their way out
        let local_candidates = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&local_candidates);
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                if let PeerEvent::LocalCandidate(candidate) = &event {
                    recorded
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(candidate.clone());
                }
                if events.send(event).is_err() {
                    break;
                }
            }
        });

        let generation = PEER_GENERATION.fetch_add(1, Ordering::Relaxed) + 1;
        info!(generation, role = %self.role, "Peer connection created");
        self.context = Some(NegotiationContext {
            generation,
            peer,
            signaling: SignalingState::Stable,
            local: None,
            remote: None,
            local_candidates,
            forwarder,
        });
        Ok(generation)
    }

    /// Initiator only. Creates the offer and sets it as local description.
    /// While the offer is outstanding the same offer is returned again.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, SessionError> {
        if !self.role.is_initiator() {
            return Err(SessionError::InvalidNegotiationState(
                "only the initiator creates offers".to_string(),
            ));
        }
        let ctx = self.context.as_mut().ok_or(SessionError::NoActiveConnection)?;
        if ctx.signaling == SignalingState::HaveLocalOffer
            && let Some(offer) = &ctx.local
        {
            return Ok(offer.clone());
        }
        if ctx.remote.is_some() {
            return Err(SessionError::InvalidNegotiationState(
                "offer already answered".to_string(),
            ));
        }

        let offer = ctx.peer.create_offer().await?;
        ctx.peer.set_local_description(&offer).await?;
        log_sdp("Offer SDP", &offer.sdp);
        ctx.local = Some(offer.clone());
        ctx.signaling = SignalingState::HaveLocalOffer;
        info!(generation = ctx.generation, "Local offer created");
        Ok(offer)
    }

    /// Joiner only. Applies the remote offer and returns the local answer.
    pub async fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        if self.role.is_initiator() {
            return Err(SessionError::InvalidNegotiationState(
                "the initiator does not accept offers".to_string(),
            ));
        }
        if offer.kind != SdpKind::Offer {
            return Err(SessionError::InvalidNegotiationState(format!(
                "expected an offer, got {:?}",
                offer.kind
            )));
        }
        let ctx = self.context.as_mut().ok_or(SessionError::NoActiveConnection)?;
        if ctx.remote.is_some() {
            return Err(SessionError::InvalidNegotiationState(
                "an offer was already accepted".to_string(),
            ));
        }

        log_sdp("Offer SDP", &offer.sdp);
        ctx.peer.set_remote_description(offer).await?;
        ctx.remote = Some(offer.clone());

        let answer = ctx.peer.create_answer().await?;
        ctx.peer.set_local_description(&answer).await?;
        log_sdp("Answer SDP", &answer.sdp);
        ctx.local = Some(answer.clone());
        ctx.signaling = SignalingState::Stable;
        info!(generation = ctx.generation, "Local answer created");
        Ok(answer)
    }

    /// Apply the remote answer to the outstanding local offer.
    pub async fn apply_answer(&mut self, answer: &SessionDescription) -> Result<(), SessionError> {
        if answer.kind != SdpKind::Answer {
            return Err(SessionError::InvalidNegotiationState(format!(
                "expected an answer, got {:?}",
                answer.kind
            )));
        }
        let Some(ctx) = self
            .context
            .as_mut()
            .filter(|ctx| ctx.signaling == SignalingState::HaveLocalOffer)
        else {
            return Err(SessionError::InvalidNegotiationState(
                "no offer outstanding".to_string(),
            ));
        };

        log_sdp("Answer SDP", &answer.sdp);
        ctx.peer.set_remote_description(answer).await?;
        ctx.remote = Some(answer.clone());
        ctx.signaling = SignalingState::Stable;
        info!(generation = ctx.generation, "Remote answer applied");
        Ok(())
    }

    pub async fn add_remote_ice_candidate(
        &mut self,
        candidate: &IceCandidate,
    ) -> Result<(), SessionError> {
        let ctx = self.context.as_ref().ok_or(SessionError::NoActiveConnection)?;
        if ctx.remote.is_none() {
            return Err(SessionError::InvalidNegotiationState(
                "remote description not set".to_string(),
            ));
        }
        ctx.peer.add_ice_candidate(candidate).await?;
        debug!(
            candidate = %candidate.candidate,
            sdp_mid = ?candidate.sdp_mid,
            "Remote ICE candidate added"
        );
        Ok(())
    }

    /// Close the peer connection. Idempotent; the engine cannot be reused.
    pub async fn close(&mut self) {
        self.closed = true;
        let Some(ctx) = self.context.take() else {
            return;
        };
        ctx.forwarder.abort();
        match ctx.peer.close().await {
            Ok(()) => info!(generation = ctx.generation, "Peer connection closed"),
            Err(e) => warn!(generation = ctx.generation, "Failed to close peer connection: {e}"),
        }
    }
}

/// Log the media and codec lines of an SDP body.
fn log_sdp(label: &str, sdp: &str) {
    for line in sdp.lines() {
        if line.starts_with("m=")
            || line.starts_with("a=rtpmap:")
            || line.starts_with("a=fmtp:")
            || line.starts_with("a=group:")
            || line.starts_with("a=mid:")
        {
            debug!(sdp_line = line, "{label}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaConstraints;
    use crate::testing::FakePeerFactory;
    use std::time::Duration;

    fn media() -> Arc<LocalMedia> {
        Arc::new(LocalMedia::new(&MediaConstraints::default()).unwrap())
    }

    fn engine(
        role: Role,
    ) -> (
        NegotiationEngine,
        Arc<FakePeerFactory>,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let factory = Arc::new(FakePeerFactory::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (
            NegotiationEngine::new(role, Arc::clone(&factory) as Arc<dyn PeerFactory>, tx),
            factory,
            rx,
        )
    }

    fn remote_offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n")
    }

    #[tokio::test]
    async fn ensure_connection_reuses_context() {
        let (mut engine, factory, _rx) = engine(Role::Initiator);
        let media = media();
        let first = engine.ensure_connection(&media).await.unwrap();
        let second = engine.ensure_connection(&media).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.peer(0).media_added(), 1);
    }

    #[tokio::test]
    async fn offer_requires_connection_and_initiator() {
        let (mut engine, _factory, _rx) = engine(Role::Initiator);
        assert_eq!(
            engine.create_offer().await,
            Err(SessionError::NoActiveConnection)
        );

        let (mut joiner, _factory, _rx) = self::engine(Role::Joiner);
        joiner.ensure_connection(&media()).await.unwrap();
        assert!(matches!(
            joiner.create_offer().await,
            Err(SessionError::InvalidNegotiationState(_))
        ));
    }

    #[tokio::test]
    async fn offer_then_answer() {
        let (mut engine, factory, _rx) = engine(Role::Initiator);
        engine.ensure_connection(&media()).await.unwrap();

        let offer = engine.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        // Outstanding offer is returned again rather than recreated
        assert_eq!(engine.create_offer().await.unwrap(), offer);
        let ctx = engine.context().unwrap();
        assert_eq!(ctx.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(ctx.local_description(), Some(&offer));

        engine
            .apply_answer(&SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        assert!(engine.has_remote_description());
        assert_eq!(
            engine.context().unwrap().signaling_state(),
            SignalingState::Stable
        );
        assert_eq!(factory.peer(0).offers_created(), 1);
    }

    #[tokio::test]
    async fn answer_without_offer_is_rejected() {
        let (mut engine, _factory, _rx) = engine(Role::Initiator);
        let answer = SessionDescription::answer("v=0\r\n");
        assert!(matches!(
            engine.apply_answer(&answer).await,
            Err(SessionError::InvalidNegotiationState(_))
        ));

        engine.ensure_connection(&media()).await.unwrap();
        engine.create_offer().await.unwrap();
        engine.apply_answer(&answer).await.unwrap();
        // A second answer finds no outstanding offer
        assert!(matches!(
            engine.apply_answer(&answer).await,
            Err(SessionError::InvalidNegotiationState(_))
        ));
    }

    #[tokio::test]
    async fn joiner_accepts_offer_once() {
        let (mut engine, factory, _rx) = engine(Role::Joiner);
        engine.ensure_connection(&media()).await.unwrap();

        let answer = engine.accept_offer(&remote_offer()).await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        let peer = factory.peer(0);
        assert_eq!(peer.remote_description(), Some(remote_offer()));
        assert_eq!(peer.local_description(), Some(answer));

        assert!(matches!(
            engine.accept_offer(&remote_offer()).await,
            Err(SessionError::InvalidNegotiationState(_))
        ));
    }

    #[tokio::test]
    async fn candidates_need_connection_and_remote_description() {
        let (mut engine, factory, _rx) = engine(Role::Joiner);
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        assert_eq!(
            engine.add_remote_ice_candidate(&candidate).await,
            Err(SessionError::NoActiveConnection)
        );

        engine.ensure_connection(&media()).await.unwrap();
        assert!(matches!(
            engine.add_remote_ice_candidate(&candidate).await,
            Err(SessionError::InvalidNegotiationState(_))
        ));

        engine.accept_offer(&remote_offer()).await.unwrap();
        engine.add_remote_ice_candidate(&candidate).await.unwrap();
        assert_eq!(factory.peer(0).remote_candidates(), vec![candidate]);
    }

    #[tokio::test]
    async fn local_candidates_are_recorded_and_forwarded() {
        let (mut engine, factory, mut rx) = engine(Role::Initiator);
        engine.ensure_connection(&media()).await.unwrap();
        let candidate = IceCandidate::new("candidate:2 1 udp 1 10.0.0.2 5001 typ host");
        factory
            .peer(0)
            .emit(PeerEvent::LocalCandidate(candidate.clone()));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PeerEvent::LocalCandidate(c) if c == candidate));
        assert_eq!(
            engine.context().unwrap().local_candidates(),
            vec![candidate]
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let (mut engine, factory, _rx) = engine(Role::Initiator);
        let media = media();
        engine.ensure_connection(&media).await.unwrap();
        engine.close().await;
        engine.close().await;
        assert_eq!(factory.peer(0).closes(), 1);
        assert!(engine.context().is_none());
        assert!(engine.ensure_connection(&media).await.is_err());
        assert_eq!(factory.created(), 1);
    }
}
