//! Socket.IO over WebSocket transport for the signaling channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use teleconsult_protocol::packet::{self, EnginePacket, OpenHandshake, SocketPacket};
use teleconsult_protocol::{ClientMessage, ServerMessage, SignalingConfig};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::signaling::{Connector, Link};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Opens a Socket.IO session on the default namespace.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    secure: bool,
    tls_cert_path: Option<String>,
    max_message_size: usize,
}

impl WebSocketConnector {
    pub fn from_config(config: &SignalingConfig) -> Self {
        Self {
            url: config.socket_url(),
            secure: config.is_secure(),
            tls_cert_path: config.tls_cert.clone(),
            max_message_size: config.max_message_size,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Link, SessionError> {
        let connector = if self.secure {
            Some(build_tls_connector(self.tls_cert_path.as_deref())?)
        } else {
            None
        };
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(self.max_message_size);

        info!(url = %self.url, "Connecting to signaling server");
        let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
            &self.url,
            Some(ws_config),
            false,
            connector,
        )
        .await
        .map_err(|e| SessionError::transport("WebSocket connection failed", e))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let open = handshake(&mut ws_tx, &mut ws_rx).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        // Server pings every interval and gives up after interval + timeout;
        // mirror that window to detect a dead server.
        let liveness = Duration::from_millis(open.ping_interval + open.ping_timeout);
        tokio::spawn(async move {
            match run_socket(ws_tx, ws_rx, outbound_rx, inbound_tx, liveness).await {
                Ok(()) => info!("Signaling socket closed cleanly"),
                Err(e) => warn!("Signaling socket error: {e:#}"),
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Build a TLS connector, pinning the server certificate if a cert path is provided.
/// System roots are always loaded as a baseline.
fn build_tls_connector(
    tls_cert_path: Option<&str>,
) -> Result<tokio_tungstenite::Connector, SessionError> {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Could not load a platform certificate: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Failed to add pinned cert to root store: {e}");
                    } else {
                        info!("Pinned server certificate from {cert_path}");
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Failed to read TLS cert from {cert_path}: {e}, falling back to system roots"
                );
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| SessionError::transport("TLS setup failed", e))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(tokio_tungstenite::Connector::Rustls(Arc::new(tls_config)))
}

/// Engine.IO `open`, then connect to the default namespace.
async fn handshake(ws_tx: &mut WsSink, ws_rx: &mut WsSource) -> Result<OpenHandshake, SessionError> {
    let open = loop {
        match next_packet(ws_rx).await? {
            EnginePacket::Open(open) => break open,
            other => debug!(?other, "Ignoring packet before open"),
        }
    };

    send_packet(ws_tx, &EnginePacket::Message(SocketPacket::Connect(None))).await?;

    loop {
        match next_packet(ws_rx).await? {
            EnginePacket::Message(SocketPacket::Connect(_)) => break,
            EnginePacket::Message(SocketPacket::ConnectError(body)) => {
                return Err(SessionError::TransportError(format!(
                    "namespace connect refused: {body}"
                )));
            }
            EnginePacket::Ping(data) => send_packet(ws_tx, &EnginePacket::Pong(data)).await?,
            EnginePacket::Close => {
                return Err(SessionError::TransportError(
                    "server closed during handshake".to_string(),
                ));
            }
            other => debug!(?other, "Ignoring packet during namespace connect"),
        }
    }

    info!(
        sid = %open.sid,
        ping_interval_ms = open.ping_interval,
        "Connected to signaling server"
    );
    Ok(open)
}

async fn next_packet(ws_rx: &mut WsSource) -> Result<EnginePacket, SessionError> {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                return EnginePacket::decode(&text)
                    .map_err(|e| SessionError::transport("Invalid handshake packet", e));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(SessionError::TransportError(
                    "connection closed during handshake".to_string(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(SessionError::transport("WebSocket read failed", e)),
        }
    }
}

async fn send_packet(ws_tx: &mut WsSink, packet: &EnginePacket) -> Result<(), SessionError> {
    ws_tx
        .send(Message::Text(packet.encode().into()))
        .await
        .map_err(|e| SessionError::transport("WebSocket write failed", e))
}

async fn run_socket(
    mut ws_tx: WsSink,
    mut ws_rx: WsSource,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::UnboundedSender<ServerMessage>,
    liveness: Duration,
) -> anyhow::Result<()> {
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => match EnginePacket::decode(&text) {
                        Ok(EnginePacket::Ping(data)) => {
                            let pong = EnginePacket::Pong(data).encode();
                            ws_tx.send(Message::Text(pong.into())).await?;
                        }
                        Ok(EnginePacket::Message(SocketPacket::Event { name, payload, .. })) => {
                            match packet::decode_event::<ServerMessage>(&name, payload) {
                                Ok(message) => {
                                    debug!(event = %name, "Signaling receive");
                                    if inbound.send(message).is_err() {
                                        return Ok(());
                                    }
                                }
                                Err(e) => warn!(event = %name, "Unhandled signaling event: {e}"),
                            }
                        }
                        Ok(EnginePacket::Message(SocketPacket::Disconnect)) | Ok(EnginePacket::Close) => {
                            info!("Server closed the signaling session");
                            return Ok(());
                        }
                        Ok(other) => debug!(?other, "Ignoring signaling packet"),
                        Err(e) => warn!("Invalid packet from server: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(e.into());
                    }
                    _ => {}
                }
            }
            out = outbound.recv() => match out {
                Some(message) => {
                    let frame = packet::encode_event(&message)
                        .with_context(|| format!("Failed to encode {}", message.event_name()))?;
                    ws_tx.send(Message::Text(frame.into())).await?;
                }
                None => {
                    // The channel dropped its end: leave the namespace and close
                    let bye = EnginePacket::Message(SocketPacket::Disconnect).encode();
                    let _ = ws_tx.send(Message::Text(bye.into())).await;
                    let _ = ws_tx.close().await;
                    return Ok(());
                }
            },
            _ = tokio::time::sleep_until(last_seen + liveness) => {
                bail!("no traffic from server for {}ms", liveness.as_millis());
            }
        }
    }
}
