use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vidlink_session::config::CallConfig;
use vidlink_session::link::rtc::WebrtcConnector;
use vidlink_session::{CallController, CallHandle, MediaSourceProvider, SessionEvent};
use vidlink_signaling::client::SignalingClient;
use vidlink_signaling::gateway::SignalingGateway;
use vidlink_signaling::transport::tokio::TokioTransport;
use vidlink_webrtc::{ChannelCaptureDevice, RemoteFrame};

const SYSTEM_CONFIG_DIR: &str = "/etc/vidlink";

/// Headless endpoint: accepts every incoming call and optionally calls the party ID given as first
/// argument.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}=debug,vidlink_session=debug,vidlink_signaling=info,vidlink_webrtc=info",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CallConfig::parse(Some(Path::new(SYSTEM_CONFIG_DIR)))?;
    if config.signaling.party_id.is_empty() {
        anyhow::bail!("Signaling party ID is empty, set VIDLINK_SIGNALING__PARTY_ID");
    }

    let shutdown_token = CancellationToken::new();
    let transport = TokioTransport::for_party(&config.signaling.url, &config.signaling.party_id)?;
    let client = SignalingClient::new(
        transport,
        config.signaling.party_id.clone(),
        shutdown_token.child_token(),
        &tokio::runtime::Handle::current(),
    );
    let gateway = SignalingGateway::new(client.clone());
    gateway
        .connect()
        .await
        .context("Failed to connect to signaling server")?;

    // Nothing feeds the capture device, calls are negotiated with silent tracks.
    let (device, _feed) = ChannelCaptureDevice::new(config.media.frame_buffer_size);
    let (remote_frames_tx, remote_frames_rx) =
        mpsc::channel(config.media.remote_frame_buffer_size);
    let connector = WebrtcConnector::new(config.ice.clone(), remote_frames_tx);
    tokio::spawn(drain_remote_frames(remote_frames_rx));

    let controller_token = shutdown_token.child_token();
    let (handle, controller_task) = CallController::spawn(
        &config.session,
        gateway,
        MediaSourceProvider::new(Arc::new(device)),
        Arc::new(connector),
        controller_token.clone(),
    );

    let mut events = handle.subscribe();
    if let Some(target) = std::env::args().nth(1) {
        handle
            .place_call(&target)
            .await
            .with_context(|| format!("Failed to call {target}"))?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        _ = handle_events(&handle, &mut events) => {
            tracing::info!("Session events closed, shutting down");
        }
    }

    // Let the controller end a running call before the signaling connection goes away.
    controller_token.cancel();
    controller_task
        .await
        .context("Failed to join call controller")?;
    client.disconnect().await;
    shutdown_token.cancel();

    Ok(())
}

async fn handle_events(handle: &CallHandle, events: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::IncomingCall { from }) => {
                tracing::info!(?from, "Accepting incoming call");
                if let Err(err) = handle.accept_incoming().await {
                    tracing::warn!(?err, "Failed to accept incoming call");
                }
            }
            Ok(SessionEvent::CallEnded {
                remote_party_id,
                reason,
            }) if reason.is_failure() => {
                tracing::warn!(?remote_party_id, ?reason, "Call failed");
            }
            Ok(event) => tracing::info!(?event, "Session event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(?skipped, "Session event handler lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn drain_remote_frames(mut remote_frames_rx: mpsc::Receiver<RemoteFrame>) {
    let mut frames: u64 = 0;
    while let Some(frame) = remote_frames_rx.recv().await {
        frames += 1;
        if frames.is_multiple_of(500) {
            tracing::debug!(frames, track_id = ?frame.track_id, kind = ?frame.kind, "Receiving remote media");
        }
    }
}
