use crate::error::{CandidateApplicationError, NegotiationError};
use crate::link::{LinkEvents, LinkState, PeerConnector, PeerLink, RemoteDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::instrument;
use vidlink_protocol::webrtc::IceConfig;
use vidlink_webrtc::{LocalTracks, Peer, PeerConnectionState, PeerEvent, RemoteFrame};

/// [`PeerConnector`] backed by real WebRTC peer connections.
pub struct WebrtcConnector {
    ice: IceConfig,
    remote_frames_tx: mpsc::Sender<RemoteFrame>,
}

impl WebrtcConnector {
    /// Remote media of every link is forwarded to `remote_frames_tx` for rendering.
    pub fn new(ice: IceConfig, remote_frames_tx: mpsc::Sender<RemoteFrame>) -> Self {
        Self {
            ice,
            remote_frames_tx,
        }
    }
}

#[async_trait]
impl PeerConnector for WebrtcConnector {
    #[instrument(level = "debug", skip_all, fields(epoch = events.epoch()), err)]
    async fn create(
        &self,
        local_media: &LocalTracks,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let (peer, events_rx) = Peer::new(self.ice.clone(), self.remote_frames_tx.clone()).await?;

        if let Err(err) = peer.add_local_media(local_media).await {
            if let Err(close_err) = peer.close().await {
                tracing::warn!(?close_err, "Failed to close peer after attaching local media failed");
            }
            return Err(err.into());
        }

        let forwarder = tokio::spawn(forward_peer_events(events_rx, events));
        Ok(Arc::new(WebrtcLink { peer, forwarder }))
    }
}

async fn forward_peer_events(mut events_rx: broadcast::Receiver<PeerEvent>, events: LinkEvents) {
    loop {
        match events_rx.recv().await {
            Ok(PeerEvent::ConnectionState(state)) => events.state(link_state(state)),
            Ok(PeerEvent::IceCandidate(candidate)) => events.local_candidate(candidate),
            Ok(PeerEvent::RemoteTrack(info)) => events.remote_track(info),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(?skipped, epoch = events.epoch(), "Peer event forwarder lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::trace!(epoch = events.epoch(), "Peer event forwarder finished");
}

fn link_state(state: PeerConnectionState) -> LinkState {
    match state {
        PeerConnectionState::Connected => LinkState::Connected,
        PeerConnectionState::Disconnected => LinkState::Disconnected,
        PeerConnectionState::Failed => LinkState::Failed,
        PeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::Connecting,
    }
}

struct WebrtcLink {
    peer: Peer,
    forwarder: JoinHandle<()>,
}

#[async_trait]
impl PeerLink for WebrtcLink {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        Ok(self.peer.create_offer().await?)
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        Ok(self.peer.create_answer().await?)
    }

    async fn set_remote_description(
        &self,
        description: RemoteDescription,
    ) -> Result<(), NegotiationError> {
        Ok(self.peer.set_remote_description(description.sdp()).await?)
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), CandidateApplicationError> {
        Ok(self.peer.add_remote_ice_candidate(candidate).await?)
    }

    async fn close(&self) {
        self.forwarder.abort();
        if let Err(err) = self.peer.close().await {
            tracing::warn!(?err, "Failed to close peer");
        }
    }
}

impl Drop for WebrtcLink {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
