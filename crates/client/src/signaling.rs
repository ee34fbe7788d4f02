//! Per-session signaling channel.
//!
//! The channel is created disconnected. `connect()` asks a [`Connector`] for
//! a [`Link`] (a pair of message queues backed by some transport) and starts a
//! pump that fans inbound messages out to every subscriber. When the
//! transport goes away subscribers see exactly one
//! [`ChannelEvent::Disconnected`]; the channel never reconnects by itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use teleconsult_protocol::{
    AuthToken, AuthenticatedUser, ClientMessage, Participant, Role, ServerMessage, TimeoutConfig,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SessionError, Step};

const EVENT_CAPACITY: usize = 256;

/// Both directions of an open transport.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Opens the transport underneath a [`SignalingChannel`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Link, SessionError>;
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(ServerMessage),
    Disconnected(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RequestTimeouts {
    pub connect: Duration,
    pub auth: Duration,
    pub join: Duration,
}

impl From<&TimeoutConfig> for RequestTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            connect: config.connect(),
            auth: config.auth(),
            join: config.join(),
        }
    }
}

struct ActiveLink {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pump: JoinHandle<()>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    timeouts: RequestTimeouts,
    events: broadcast::Sender<ChannelEvent>,
    link: Mutex<Option<ActiveLink>>,
    /// Set once the disconnect event has been emitted; the channel is dead.
    closed: Arc<AtomicBool>,
}

/// Cheap to clone; all clones share one transport.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<Inner>,
}

impl SignalingChannel {
    pub fn new(connector: Arc<dyn Connector>, timeouts: RequestTimeouts) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                timeouts,
                events,
                link: Mutex::new(None),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Receive every inbound message and the disconnect event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
            && self
                .inner
                .link
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
    }

    /// Open the transport. Does not wait for authentication.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SessionError::TransportError(
                "signaling channel already closed".to_string(),
            ));
        }
        if self.is_connected() {
            return Ok(());
        }

        let Link {
            outbound,
            mut inbound,
        } = tokio::time::timeout(self.inner.timeouts.connect, self.inner.connector.open())
            .await
            .map_err(|_| SessionError::Timeout(Step::Connect))??;

        let events = self.inner.events.clone();
        let closed = Arc::clone(&self.inner.closed);
        let pump = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                // Err only means nobody is subscribed right now
                let _ = events.send(ChannelEvent::Message(message));
            }
            if !closed.swap(true, Ordering::AcqRel) {
                warn!("Signaling transport closed by remote");
                let _ = events.send(ChannelEvent::Disconnected(
                    "transport closed by remote".to_string(),
                ));
            }
        });

        let mut link = self.inner.link.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = link.replace(ActiveLink { outbound, pump }) {
            previous.pump.abort();
        }
        info!("Signaling channel connected");
        Ok(())
    }

    /// Fire-and-forget relay of one message.
    pub fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SessionError::TransportError(
                "signaling channel closed".to_string(),
            ));
        }
        let link = self.inner.link.lock().unwrap_or_else(|e| e.into_inner());
        let Some(active) = link.as_ref() else {
            return Err(SessionError::TransportError(
                "signaling channel not connected".to_string(),
            ));
        };
        debug!(event = message.event_name(), "Signaling send");
        active
            .outbound
            .send(message)
            .map_err(|_| SessionError::TransportError("signaling transport closed".to_string()))
    }

    /// Send `authenticate` and wait for `authenticated` or `auth-error`.
    pub async fn authenticate(
        &self,
        token: &AuthToken,
        room_code: &str,
    ) -> Result<AuthenticatedUser, SessionError> {
        let mut events = self.subscribe();
        self.send(ClientMessage::Authenticate {
            token: token.clone(),
            room_code: room_code.to_string(),
        })?;

        let wait = async {
            loop {
                match next_message(&mut events).await? {
                    ServerMessage::Authenticated { user } => return Ok(user.unwrap_or_default()),
                    ServerMessage::AuthError { message } => {
                        return Err(SessionError::AuthenticationFailed(message));
                    }
                    _ => continue,
                }
            }
        };
        tokio::time::timeout(self.inner.timeouts.auth, wait)
            .await
            .map_err(|_| SessionError::Timeout(Step::Authenticate))?
    }

    /// Send `join-room` and wait for `room-joined`, returning the roster.
    pub async fn join_room(
        &self,
        room_code: &str,
        role: Role,
    ) -> Result<Vec<Participant>, SessionError> {
        let mut events = self.subscribe();
        self.send(ClientMessage::JoinRoom {
            room_code: room_code.to_string(),
            role,
        })?;

        let wait = async {
            loop {
                match next_message(&mut events).await? {
                    ServerMessage::RoomJoined { participants, .. } => return Ok(participants),
                    ServerMessage::Error { message } => return Err(SessionError::Server(message)),
                    _ => continue,
                }
            }
        };
        tokio::time::timeout(self.inner.timeouts.join, wait)
            .await
            .map_err(|_| SessionError::Timeout(Step::JoinRoom))?
    }

    /// Close the transport. Idempotent.
    pub fn disconnect(&self) {
        let active = self
            .inner
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(active) = active {
            // Dropping the sender lets the transport flush and close
            drop(active.outbound);
            active.pump.abort();
        }
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            info!("Signaling channel disconnected");
            let _ = self
                .inner
                .events
                .send(ChannelEvent::Disconnected("closed locally".to_string()));
        }
    }
}

async fn next_message(
    events: &mut broadcast::Receiver<ChannelEvent>,
) -> Result<ServerMessage, SessionError> {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::Message(message)) => return Ok(message),
            Ok(ChannelEvent::Disconnected(reason)) => {
                return Err(SessionError::TransportError(reason));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Signaling subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(SessionError::TransportError(
                    "signaling channel dropped".to_string(),
                ));
            }
        }
    }
}

/// In-process transport: the other end is a [`LoopbackServer`] driven by
/// the caller. Used to run sessions without a network.
pub struct LoopbackConnector {
    link: Mutex<Option<Link>>,
}

/// Server side of a loopback link.
pub struct LoopbackServer {
    from_client: mpsc::UnboundedReceiver<ClientMessage>,
    to_client: Option<mpsc::UnboundedSender<ServerMessage>>,
}

pub fn loopback() -> (LoopbackConnector, LoopbackServer) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    (
        LoopbackConnector {
            link: Mutex::new(Some(Link {
                outbound: client_tx,
                inbound: server_rx,
            })),
        },
        LoopbackServer {
            from_client: client_rx,
            to_client: Some(server_tx),
        },
    )
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self) -> Result<Link, SessionError> {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| SessionError::TransportError("loopback link already used".to_string()))
    }
}

impl LoopbackServer {
    /// Deliver a message to the client. Returns false once the link is gone.
    pub fn push(&self, message: ServerMessage) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Next message from the client; `None` once the client closed the link.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        self.from_client.try_recv().ok()
    }

    /// Drop the server end, as if the connection was lost.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }
}
