//! Local camera/microphone capture as a pair of WebRTC sample tracks.
//!
//! A capture pipeline feeds encoded samples into the tracks; muting or
//! turning video off flips an `enabled` flag so samples are dropped without
//! removing the track from the peer connection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use teleconsult_protocol::MediaConfig;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::SessionError;

/// H.264 Constrained Baseline; every browser offers it.
pub const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::from(&MediaConfig::default())
    }
}

impl From<&MediaConfig> for MediaConstraints {
    fn from(config: &MediaConfig) -> Self {
        Self {
            audio: config.audio,
            video: config.video,
            width: config.width,
            height: config.height,
            framerate: config.framerate,
        }
    }
}

/// One local track. Never removed from the peer connection; toggled instead.
pub struct LocalTrack {
    kind: MediaKind,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    keyframe_requested: AtomicBool,
}

impl LocalTrack {
    fn new(kind: MediaKind, stream_id: &str) -> Self {
        let (capability, id) = match kind {
            MediaKind::Audio => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio",
            ),
            // Without fmtp the track may bind to the wrong H.264 variant
            MediaKind::Video => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    sdp_fmtp_line: H264_FMTP.to_string(),
                    ..Default::default()
                },
                "video",
            ),
        };
        Self {
            kind,
            rtp: Arc::new(TrackLocalStaticSample::new(
                capability,
                id.to_string(),
                stream_id.to_string(),
            )),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            keyframe_requested: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.rtp.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// The sample track bound to the peer connection.
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }

    /// Write one encoded sample. Returns `Ok(false)` when the sample was
    /// dropped because the track is disabled or stopped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, SessionError> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtp
            .write_sample(&webrtc::media::Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| SessionError::peer("Failed to write sample", e))?;
        Ok(true)
    }

    /// Called when the remote decoder asks for a keyframe (RTCP PLI/FIR).
    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::Relaxed);
    }

    /// Consume a pending keyframe request, if any.
    pub fn take_keyframe_request(&self) -> bool {
        self.keyframe_requested.swap(false, Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.store(enabled, Ordering::Relaxed);
        enabled
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

/// The session's local audio+video stream.
pub struct LocalMedia {
    stream_id: String,
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
    released: AtomicBool,
}

impl LocalMedia {
    /// Build the tracks requested by `constraints`.
    pub fn new(constraints: &MediaConstraints) -> Result<Self, SessionError> {
        if !constraints.audio && !constraints.video {
            return Err(SessionError::MediaAccessDenied(
                "constraints request neither audio nor video".to_string(),
            ));
        }
        let stream_id = format!("teleconsult-{}", Uuid::new_v4());
        let audio = constraints
            .audio
            .then(|| LocalTrack::new(MediaKind::Audio, &stream_id));
        let video = constraints
            .video
            .then(|| LocalTrack::new(MediaKind::Video, &stream_id));
        Ok(Self {
            stream_id,
            audio,
            video,
            released: AtomicBool::new(false),
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    /// Enable or disable the microphone track. Returns the resulting state;
    /// `false` when there is no audio track.
    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.audio
            .as_ref()
            .is_some_and(|track| track.set_enabled(enabled))
    }

    /// Enable or disable the camera track. Returns the resulting state;
    /// `false` when there is no video track.
    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.video
            .as_ref()
            .is_some_and(|track| track.set_enabled(enabled))
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Stop all tracks. Safe to call any number of times.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for track in self.tracks() {
            track.stop();
        }
        info!(stream_id = %self.stream_id, "Local media released");
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field("audio", &self.audio.as_ref().map(LocalTrack::is_enabled))
            .field("video", &self.video.as_ref().map(LocalTrack::is_enabled))
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}

/// Source of local media. May suspend indefinitely while a permission
/// prompt is pending.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, SessionError>;
}

/// Media backed by capture device nodes.
///
/// When a device path is configured it must exist and be readable by this
/// process; otherwise acquisition fails with `MediaAccessDenied`.
#[derive(Debug, Clone, Default)]
pub struct CaptureDevices {
    video_device: Option<PathBuf>,
    audio_device: Option<PathBuf>,
}

impl CaptureDevices {
    pub fn new(video_device: Option<PathBuf>, audio_device: Option<PathBuf>) -> Self {
        Self {
            video_device,
            audio_device,
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(
            config.video_device.as_ref().map(PathBuf::from),
            config.audio_device.as_ref().map(PathBuf::from),
        )
    }
}

async fn probe_device(kind: &str, path: &Path) -> Result<(), SessionError> {
    match tokio::fs::File::open(path).await {
        Ok(_) => {
            debug!(device = %path.display(), "{kind} device available");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(
            SessionError::MediaAccessDenied(format!("{kind} {}: permission denied", path.display())),
        ),
        Err(e) => Err(SessionError::MediaAccessDenied(format!(
            "{kind} {}: {e}",
            path.display()
        ))),
    }
}

#[async_trait]
impl MediaDevices for CaptureDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, SessionError> {
        if constraints.video
            && let Some(path) = &self.video_device
        {
            probe_device("camera", path).await?;
        }
        if constraints.audio
            && let Some(path) = &self.audio_device
        {
            probe_device("microphone", path).await?;
        }

        let media = LocalMedia::new(constraints)?;
        info!(
            stream_id = %media.stream_id(),
            audio = constraints.audio,
            video = constraints.video,
            width = constraints.width,
            height = constraints.height,
            framerate = constraints.framerate,
            "Local media acquired"
        );
        Ok(media)
    }
}
