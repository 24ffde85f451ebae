pub mod rtc;

use crate::error::{CandidateApplicationError, NegotiationError};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use vidlink_webrtc::{LocalTracks, RemoteTrackInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteDescription {
    Offer(String),
    Answer(String),
}

impl RemoteDescription {
    pub fn sdp(&self) -> &str {
        match self {
            RemoteDescription::Offer(sdp) | RemoteDescription::Answer(sdp) => sdp,
        }
    }
}

/// Connection state reported by a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The link reached the connected state. Reported at most once.
    Connected,
    /// The link became unusable. Reported at most once, never followed by [`LinkEvent::Connected`].
    Terminated(LinkState),
    /// Serialized local ICE candidate to trickle to the remote party.
    LocalCandidate(String),
    RemoteTrack(RemoteTrackInfo),
}

/// Sink for the events of one peer link, tagged with the session epoch the link belongs to.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    connected: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
}

impl LinkEvents {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self {
            epoch,
            tx,
            connected: Arc::new(AtomicBool::new(false)),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Reports a connection state change, collapsing repeated states into one-time events.
    pub fn state(&self, state: LinkState) {
        match state {
            LinkState::Connected => {
                if self.terminated.load(Ordering::SeqCst)
                    || self.connected.swap(true, Ordering::SeqCst)
                {
                    return;
                }
                self.emit(LinkEvent::Connected);
            }
            state if state.is_terminal() => {
                if self.terminated.swap(true, Ordering::SeqCst) {
                    return;
                }
                self.emit(LinkEvent::Terminated(state));
            }
            state => {
                tracing::trace!(epoch = self.epoch, ?state, "Peer link connecting");
            }
        }
    }

    pub fn local_candidate(&self, candidate: String) {
        self.emit(LinkEvent::LocalCandidate(candidate));
    }

    pub fn remote_track(&self, info: RemoteTrackInfo) {
        self.emit(LinkEvent::RemoteTrack(info));
    }

    fn emit(&self, event: LinkEvent) {
        if self.tx.send((self.epoch, event)).is_err() {
            tracing::trace!(epoch = self.epoch, "Call controller gone, dropping link event");
        }
    }
}

/// One negotiated peer-to-peer media connection.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    /// Creates an offer and sets it as local description.
    async fn create_offer(&self) -> Result<String, NegotiationError>;
    /// Creates an answer to the applied remote offer and sets it as local description.
    async fn create_answer(&self) -> Result<String, NegotiationError>;
    async fn set_remote_description(
        &self,
        description: RemoteDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), CandidateApplicationError>;
    /// Stops the local tracks and releases the connection. Safe to call repeatedly.
    async fn close(&self);
}

/// Creates peer links with the local tracks already attached.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    async fn create(
        &self,
        local_media: &LocalTracks,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}
