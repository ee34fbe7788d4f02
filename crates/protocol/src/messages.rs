use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Target used when an offer or candidate is addressed to the whole room.
pub const BROADCAST_TARGET: &str = "all";

/// Which side of the consultation drives negotiation.
///
/// Roles are fixed: the clinician always creates the offer and the patient
/// always answers. On the wire the role travels as `userType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "medecin")]
    Initiator,
    #[serde(rename = "patient")]
    Joiner,
}

impl Role {
    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Joiner => f.write_str("joiner"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role '{0}' (expected initiator|medecin or joiner|patient)")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "initiator" | "medecin" => Ok(Role::Initiator),
            "joiner" | "patient" => Ok(Role::Joiner),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// Bearer token presented to the signaling server.
/// Redacted in Debug output to prevent accidental logging.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP document in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// ICE username fragment, used to tell retransmitted offers apart.
    pub fn ice_ufrag(&self) -> Option<&str> {
        self.sdp
            .lines()
            .find_map(|l| l.trim().strip_prefix("a=ice-ufrag:"))
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// A conference participant as reported by the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(alias = "id", deserialize_with = "participant_id")]
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Participant {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            user_type: None,
            name: None,
        }
    }
}

/// User record echoed back by the server after a successful `authenticate`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    #[serde(default, rename = "type")]
    pub user_type: Option<String>,
    #[serde(default, deserialize_with = "opt_participant_id")]
    pub id: Option<String>,
}

/// Messages sent by the client to the signaling server.
///
/// Serialized adjacently tagged (`{"event": ..., "data": ...}`); the wire codec
/// turns that into a Socket.IO event frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    Authenticate {
        token: AuthToken,
        #[serde(rename = "conferenceCode")]
        room_code: String,
    },
    JoinRoom {
        #[serde(rename = "conferenceCode")]
        room_code: String,
        #[serde(rename = "userType")]
        role: Role,
    },
    Offer {
        #[serde(rename = "conferenceCode")]
        room_code: String,
        #[serde(rename = "offer")]
        sdp: SessionDescription,
        #[serde(rename = "targetParticipant")]
        target: String,
    },
    Answer {
        #[serde(rename = "conferenceCode")]
        room_code: String,
        #[serde(rename = "answer")]
        sdp: SessionDescription,
        #[serde(rename = "targetParticipant")]
        target: String,
    },
    IceCandidate {
        #[serde(rename = "conferenceCode")]
        room_code: String,
        candidate: IceCandidate,
        #[serde(rename = "targetParticipant")]
        target: String,
    },
    ToggleAudio {
        #[serde(rename = "conferenceCode")]
        room_code: String,
        #[serde(rename = "isMuted")]
        muted: bool,
    },
    ToggleVideo {
        #[serde(rename = "conferenceCode")]
        room_code: String,
        #[serde(rename = "isVideoOff")]
        video_off: bool,
    },
    LeaveRoom {
        #[serde(rename = "conferenceCode")]
        room_code: String,
    },
}

impl ClientMessage {
    /// Socket.IO event name of this message.
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate { .. } => "authenticate",
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::ToggleAudio { .. } => "toggle-audio",
            ClientMessage::ToggleVideo { .. } => "toggle-video",
            ClientMessage::LeaveRoom { .. } => "leave-room",
        }
    }
}

/// Messages pushed by the signaling server to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    Authenticated {
        #[serde(default)]
        user: Option<AuthenticatedUser>,
    },
    AuthError {
        #[serde(default)]
        message: String,
    },
    RoomJoined {
        #[serde(default, rename = "conferenceCode")]
        room_code: Option<String>,
        #[serde(default)]
        participants: Vec<Participant>,
    },
    ParticipantJoined(Participant),
    ParticipantLeft {
        #[serde(rename = "participantId", deserialize_with = "participant_id")]
        participant_id: String,
    },
    ParticipantDisconnected {
        #[serde(rename = "participantId", deserialize_with = "participant_id")]
        participant_id: String,
    },
    Offer {
        #[serde(rename = "offer")]
        sdp: SessionDescription,
        #[serde(default, deserialize_with = "opt_participant_id")]
        from: Option<String>,
    },
    Answer {
        #[serde(rename = "answer")]
        sdp: SessionDescription,
        #[serde(default, deserialize_with = "opt_participant_id")]
        from: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidate,
        #[serde(default, deserialize_with = "opt_participant_id")]
        from: Option<String>,
    },
    AudioToggled {
        #[serde(
            default,
            rename = "participantId",
            deserialize_with = "opt_participant_id"
        )]
        participant_id: Option<String>,
        #[serde(default, rename = "isMuted")]
        muted: bool,
    },
    VideoToggled {
        #[serde(
            default,
            rename = "participantId",
            deserialize_with = "opt_participant_id"
        )]
        participant_id: Option<String>,
        #[serde(default, rename = "isVideoOff")]
        video_off: bool,
    },
    #[serde(rename = "conference-force-closed")]
    ForceClosed {
        #[serde(default)]
        reason: Option<String>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

impl ServerMessage {
    /// Offer, answer and candidate messages. These depend on negotiation
    /// progress and must be handled strictly in delivery order.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            ServerMessage::Offer { .. }
                | ServerMessage::Answer { .. }
                | ServerMessage::IceCandidate { .. }
        )
    }
}

/// ICE server entry, mirroring the browser's `RTCIceServer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

impl From<WireId> for String {
    fn from(id: WireId) -> Self {
        match id {
            WireId::Text(s) => s,
            WireId::Number(n) => n.to_string(),
        }
    }
}

// Participant ids come from database rows on some servers and socket ids on others.
fn participant_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    WireId::deserialize(d).map(String::from)
}

fn opt_participant_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<WireId>::deserialize(d)?.map(String::from))
}
