//! Client side of a two-party teleconsultation: signaling, WebRTC
//! negotiation, local media and the session state machine tying them
//! together.

pub mod error;
pub mod media;
pub mod negotiation;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod ws;

#[cfg(test)]
mod testing;

pub use error::{SessionError, Step};
pub use media::{CaptureDevices, LocalMedia, LocalTrack, MediaConstraints, MediaDevices, MediaKind};
pub use negotiation::{LinkState, NegotiationEngine, PeerConnection, PeerEvent, PeerFactory, RemoteTrack};
pub use rtc::RtcPeerFactory;
pub use session::{
    Phase, RemoteMedia, SessionController, SessionEvent, SessionHandle, SessionIdentity,
    SessionState,
};
pub use signaling::{
    ChannelEvent, Connector, Link, LoopbackConnector, LoopbackServer, SignalingChannel, loopback,
};
pub use ws::WebSocketConnector;
