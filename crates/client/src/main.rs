mod cli;
mod config;

use std::sync::Arc;

use anyhow::Context;
use teleconsult_client::{
    CaptureDevices, Phase, RtcPeerFactory, SessionController, SessionEvent, SessionIdentity,
    WebSocketConnector,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Invocation;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Install rustls crypto provider (needed for TLS WebSocket to server)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let invocation = cli::parse_args(std::env::args().skip(1), std::env::var(cli::TOKEN_ENV).ok())?;
    let args = match invocation {
        Invocation::Run(args) => args,
        Invocation::Help => {
            cli::print_help();
            return Ok(());
        }
        Invocation::Version => {
            println!("teleconsult {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };

    let mut config = config::load_config(&args.config_path)?;
    if let Some(url) = args.server_url {
        config.signaling.url = url;
    }
    if let Some(cert) = args.tls_cert_path {
        config.signaling.tls_cert = Some(cert);
    }
    config::check(&config).context("Refusing to start")?;

    let identity = SessionIdentity {
        token: args.token,
        room_code: args.room,
        role: args.role,
        participant: args.participant,
    };
    let connector = WebSocketConnector::from_config(&config.signaling);
    info!(url = connector.url(), room = %identity.room_code, role = %identity.role, "Starting session");

    let controller = SessionController::new(
        identity,
        &config,
        Arc::new(connector),
        Arc::new(CaptureDevices::from_config(&config.media)),
        Arc::new(RtcPeerFactory::new(&config.ice)),
    );
    let events = controller.subscribe();
    let handle = controller.start();
    let printer = tokio::spawn(print_events(events));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        _ = handle.closed() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, leaving session");
            handle.leave().await;
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, leaving session");
            handle.leave().await;
        }
    }

    let state = handle.state();
    printer.abort();
    match (state.phase, state.last_error) {
        (Phase::Error, Some(e)) => Err(anyhow::anyhow!(e)).context("Session failed"),
        (_, Some(e)) => {
            info!("Session ended: {e}");
            Ok(())
        }
        _ => {
            info!("Session ended");
            Ok(())
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::PhaseChanged(phase)) => info!(%phase, "Phase"),
            Ok(SessionEvent::ConnectionChanged(connected)) => {
                info!(connected, "Peer connection changed")
            }
            Ok(SessionEvent::ParticipantsJoined(participants)) => {
                for p in participants {
                    info!(participant_id = %p.participant_id, user_type = ?p.user_type, "Participant joined");
                }
            }
            Ok(SessionEvent::ParticipantLeft(id)) => info!(participant_id = %id, "Participant left"),
            Ok(SessionEvent::LocalStream(media)) => {
                info!(stream_id = media.stream_id(), "Local stream ready")
            }
            Ok(SessionEvent::RemoteStream(remote)) => {
                info!(stream_id = remote.stream_id(), "Remote stream ready")
            }
            Ok(SessionEvent::RemoteAudioToggled { participant_id, muted }) => {
                info!(participant_id = ?participant_id, muted, "Remote audio toggled")
            }
            Ok(SessionEvent::RemoteVideoToggled {
                participant_id,
                video_off,
            }) => info!(participant_id = ?participant_id, video_off, "Remote video toggled"),
            Ok(SessionEvent::Error(e)) => error!("{e}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
