//! In-memory peers and media devices for controller and engine tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use teleconsult_protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::media::{LocalMedia, MediaConstraints, MediaDevices};
use crate::negotiation::{PeerConnection, PeerEvent, PeerFactory};

#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        Arc::clone(&self.peers.lock().unwrap()[index])
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, SessionError> {
        let mut peers = self.peers.lock().unwrap();
        let peer = Arc::new(FakePeer {
            index: peers.len(),
            events,
            media: Mutex::new(None),
            media_added: AtomicUsize::new(0),
            offers_created: AtomicUsize::new(0),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        peers.push(Arc::clone(&peer));
        Ok(peer)
    }
}

pub struct FakePeer {
    index: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
    media: Mutex<Option<Arc<LocalMedia>>>,
    media_added: AtomicUsize,
    offers_created: AtomicUsize,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    closes: AtomicUsize,
}

impl FakePeer {
    /// Report an event as the real stack would.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn media_added(&self) -> usize {
        self.media_added.load(Ordering::SeqCst)
    }

    pub fn media(&self) -> Option<Arc<LocalMedia>> {
        self.media.lock().unwrap().clone()
    }

    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn sdp(&self, kind: &str) -> String {
        format!(
            "v=0\r\na=ice-ufrag:fake{}{kind}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 125\r\n",
            self.index
        )
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_media(&self, media: Arc<LocalMedia>) -> Result<(), SessionError> {
        self.media_added.fetch_add(1, Ordering::SeqCst);
        *self.media.lock().unwrap() = Some(media);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(self.sdp("o")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        if self.remote.lock().unwrap().is_none() {
            return Err(SessionError::peer("Failed to create answer", "no remote offer"));
        }
        Ok(SessionDescription::answer(self.sdp("a")))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        *self.local.lock().unwrap() = Some(desc.clone());
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), SessionError> {
        *self.remote.lock().unwrap() = Some(desc.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Media devices that grant, deny, or never answer.
#[derive(Default)]
pub struct FakeDevices {
    mode: DeviceMode,
    acquired: AtomicUsize,
}

#[derive(Default, Clone, Copy, PartialEq, Eq)]
enum DeviceMode {
    #[default]
    Grant,
    Deny,
    Prompt,
}

impl FakeDevices {
    pub fn denying() -> Self {
        Self {
            mode: DeviceMode::Deny,
            ..Default::default()
        }
    }

    /// A permission prompt nobody answers.
    pub fn prompting() -> Self {
        Self {
            mode: DeviceMode::Prompt,
            ..Default::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, SessionError> {
        match self.mode {
            DeviceMode::Grant => {
                self.acquired.fetch_add(1, Ordering::SeqCst);
                LocalMedia::new(constraints)
            }
            DeviceMode::Deny => Err(SessionError::MediaAccessDenied(
                "permission denied by user".to_string(),
            )),
            DeviceMode::Prompt => std::future::pending().await,
        }
    }
}
