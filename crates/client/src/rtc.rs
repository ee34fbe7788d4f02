//! `PeerConnection` backed by webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use teleconsult_protocol::{IceCandidate, IceConfig, IceServerInfo, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::error::SessionError;
use crate::media::{H264_FMTP, LocalMedia, MediaKind};
use crate::negotiation::{LinkState, PeerConnection, PeerEvent, PeerFactory, RemoteTrack};

#[derive(Debug, Clone)]
pub struct RtcPeerFactory {
    ice_servers: Vec<IceServerInfo>,
}

impl RtcPeerFactory {
    pub fn new(ice: &IceConfig) -> Self {
        Self {
            ice_servers: ice.servers(),
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, SessionError> {
        let peer = RtcPeer::new(&self.ice_servers, events).await?;
        Ok(Arc::new(peer))
    }
}

pub struct RtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    pub async fn new(
        ice_servers: &[IceServerInfo],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, SessionError> {
        let mut media_engine = MediaEngine::default();

        // Only H.264 + Opus; the capture pipeline produces nothing else
        let h264_feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "ccm".into(),
                parameter: "fir".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "pli".into(),
            },
            RTCPFeedback {
                typ: "transport-cc".into(),
                parameter: "".into(),
            },
        ];
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: H264_FMTP.to_string(),
                        rtcp_feedback: h264_feedback,
                    },
                    payload_type: 125,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| SessionError::peer("Failed to register H.264", e))?;
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| SessionError::peer("Failed to register Opus", e))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| SessionError::peer("Failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| SessionError::peer("Failed to create peer connection", e))?,
        );

        let state_tx = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!("Peer connection failed"),
                RTCPeerConnectionState::Disconnected => warn!("Peer connection disconnected"),
                _ => info!(?state, "Peer connection state changed"),
            }
            if let Some(link) = link_state(state) {
                let _ = state_tx.send(PeerEvent::StateChanged(link));
            }
            Box::pin(async {})
        }));

        let candidate_tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        let _ = candidate_tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                            username_fragment: json.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        let track_tx = events;
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let remote = RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
                track: Some(track),
            };
            info!(id = %remote.id, stream_id = %remote.stream_id, ?kind, "Remote track arrived");
            let _ = track_tx.send(PeerEvent::RemoteTrack(remote));
            Box::pin(async {})
        }));

        Ok(Self { peer_connection })
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_local_media(&self, media: Arc<LocalMedia>) -> Result<(), SessionError> {
        for track in media.tracks() {
            let sender = self
                .peer_connection
                .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| SessionError::peer("Failed to add local track", e))?;
            debug!(id = track.id(), kind = ?track.kind(), "Local track attached");
            start_rtcp_reader(sender, track.kind(), Arc::clone(&media));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| SessionError::peer("Failed to create offer", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| SessionError::peer("Failed to create answer", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        self.peer_connection
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| SessionError::peer("Failed to set local description", e))
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), SessionError> {
        self.peer_connection
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| SessionError::peer("Failed to set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| SessionError::peer("Failed to add ICE candidate", e))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| SessionError::peer("Failed to close peer connection", e))
    }
}

fn rtc_ice_servers(servers: &[IceServerInfo]) -> Vec<RTCIceServer> {
    if servers.is_empty() {
        return vec![RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        }];
    }
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, SessionError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    };
    parsed.map_err(|e| SessionError::peer("Failed to parse SDP", e))
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
            Some(LinkState::Connecting)
        }
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected
        | RTCPeerConnectionState::Failed
        | RTCPeerConnectionState::Closed => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Drain RTCP for a local track. PLI/FIR on the video sender raise the
/// track's keyframe request flag for the capture pipeline.
fn start_rtcp_reader(sender: Arc<RTCRtpSender>, kind: MediaKind, media: Arc<LocalMedia>) {
    tokio::spawn(async move {
        while let Ok((packets, _)) = sender.read_rtcp().await {
            if kind != MediaKind::Video {
                continue;
            }
            for pkt in &packets {
                let pkt_any = pkt.as_any();
                if pkt_any.is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                    || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                {
                    debug!("Received PLI/FIR keyframe request");
                    if let Some(video) = media.video() {
                        video.request_keyframe();
                    }
                }
            }
        }
    });
}
