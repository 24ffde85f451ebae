use crate::config::{IntoRtc, PEER_EVENTS_CAPACITY, RTCP_BUFFER_SIZE};
use crate::error::WebrtcError;
use crate::media::{LocalTracks, RemoteFrame, RemoteTrackInfo};
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::instrument;
use vidlink_protocol::webrtc::IceConfig;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub type PeerConnectionState = RTCPeerConnectionState;

#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionState(PeerConnectionState),
    /// Serialized [`RTCIceCandidateInit`] gathered locally, to be trickled to the remote party.
    IceCandidate(String),
    RemoteTrack(RemoteTrackInfo),
}

/// Peer connection to a single remote party.
///
/// SDP and candidates cross this boundary as JSON serialized [`RTCSessionDescription`] and
/// [`RTCIceCandidateInit`] strings, ready to be put on the signaling wire.
pub struct Peer {
    peer_connection: RTCPeerConnection,
    receiver: crate::Receiver,
    local_tracks: Mutex<Option<LocalTracks>>,
    events_tx: broadcast::Sender<PeerEvent>,
    closed: AtomicBool,
}

impl Peer {
    #[instrument(level = "debug", skip(remote_frames_tx), err)]
    pub async fn new(
        config: IceConfig,
        remote_frames_tx: mpsc::Sender<RemoteFrame>,
    ) -> Result<(Self, broadcast::Receiver<PeerEvent>), WebrtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register default interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(config.into_rtc())
            .await
            .context("Failed to create peer connection")?;

        let (events_tx, events_rx) = broadcast::channel(PEER_EVENTS_CAPACITY);

        {
            let events_tx = events_tx.clone();
            peer_connection.on_peer_connection_state_change(Box::new(
                move |state: RTCPeerConnectionState| {
                    tracing::trace!(?state, "Peer connection state changed");
                    if let Err(err) = events_tx.send(PeerEvent::ConnectionState(state)) {
                        tracing::warn!(?err, "Failed to send peer connection state event");
                    }
                    Box::pin(async {})
                },
            ));
        }

        {
            let events_tx = events_tx.clone();
            peer_connection.on_ice_candidate(Box::new(
                move |candidate: Option<RTCIceCandidate>| {
                    tracing::trace!(?candidate, "ICE candidate gathered");
                    if let Some(candidate) = candidate {
                        match candidate
                            .to_json()
                            .map_err(anyhow::Error::from)
                            .and_then(|init| serde_json::to_string(&init).map_err(Into::into))
                        {
                            Ok(init) => {
                                if let Err(err) = events_tx.send(PeerEvent::IceCandidate(init)) {
                                    tracing::warn!(?err, "Failed to send ICE candidate event");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(?err, "Failed to serialize ICE candidate");
                            }
                        }
                    }
                    Box::pin(async {})
                },
            ));
        }

        let receiver = crate::Receiver::new(&peer_connection, events_tx.clone(), remote_frames_tx);

        Ok((
            Self {
                peer_connection,
                receiver,
                local_tracks: Mutex::new(None),
                events_tx,
                closed: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Attaches the local audio and video tracks. The tracks are stopped once the peer closes.
    #[instrument(level = "debug", skip_all, err)]
    pub async fn add_local_media(&self, tracks: &LocalTracks) -> Result<(), WebrtcError> {
        self.ensure_open()?;
        if self.local_tracks.lock().is_some() {
            return Err(WebrtcError::InvalidState(
                "local media already attached".to_string(),
            ));
        }

        for track in [&tracks.audio, &tracks.video] {
            self.add_track(track).await?;
        }

        *self.local_tracks.lock() = Some(tracks.clone());
        tracing::trace!("Attached local media");
        Ok(())
    }

    async fn add_track(&self, track: &Arc<TrackLocalStaticSample>) -> Result<(), WebrtcError> {
        let rtp_sender = self
            .peer_connection
            .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add track to peer connection")?;

        // RTCP has to be read for interceptors (NACK, reports) to do their work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
            while rtp_sender.read(&mut buf).await.is_ok() {}
            tracing::trace!("RTCP reader finished");
        });
        Ok(())
    }

    #[instrument(level = "trace", skip(self), err)]
    pub async fn create_offer(&self) -> Result<String, WebrtcError> {
        self.ensure_open()?;
        tracing::trace!("Creating SDP offer");

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .context("Failed to set offer as local description")?;

        let sdp = self.serialized_local_description().await?;
        tracing::trace!("Created SDP offer");
        Ok(sdp)
    }

    /// Creates an answer to the previously applied remote offer.
    #[instrument(level = "trace", skip(self), err)]
    pub async fn create_answer(&self) -> Result<String, WebrtcError> {
        self.ensure_open()?;
        tracing::trace!("Creating SDP answer");

        if self.peer_connection.remote_description().await.is_none() {
            return Err(WebrtcError::InvalidState(
                "cannot answer without remote offer".to_string(),
            ));
        }

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .context("Failed to set answer as local description")?;

        let sdp = self.serialized_local_description().await?;
        tracing::trace!("Created SDP answer");
        Ok(sdp)
    }

    #[instrument(level = "trace", skip(self, sdp), err)]
    pub async fn set_remote_description(&self, sdp: &str) -> Result<(), WebrtcError> {
        self.ensure_open()?;
        tracing::trace!("Applying remote SDP");

        let description = serde_json::from_str::<RTCSessionDescription>(sdp)
            .context("Failed to deserialize SDP")?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .context("Failed to set remote description")?;

        tracing::trace!("Applied remote SDP");
        Ok(())
    }

    #[instrument(level = "trace", skip(self, candidate), err)]
    pub async fn add_remote_ice_candidate(&self, candidate: &str) -> Result<(), WebrtcError> {
        self.ensure_open()?;
        tracing::trace!("Adding remote ICE candidate");

        self.peer_connection
            .add_ice_candidate(
                serde_json::from_str::<RTCIceCandidateInit>(candidate)
                    .context("Failed to deserialize candidate")?,
            )
            .await
            .context("Failed to add remote ICE candidate")?;

        tracing::trace!("Added remote ICE candidate");
        Ok(())
    }

    /// Stops the local tracks and closes the connection. Closing an already closed peer is a no-op.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn close(&self) -> Result<(), WebrtcError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::trace!("Peer already closed");
            return Ok(());
        }

        tracing::debug!("Closing peer");
        if let Some(tracks) = self.local_tracks.lock().take() {
            tracks.stop();
        }
        self.receiver.shutdown();

        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;

        tracing::trace!("Successfully closed peer connection");
        Ok(())
    }

    async fn serialized_local_description(&self) -> Result<String, WebrtcError> {
        let local_description = self
            .peer_connection
            .local_description()
            .await
            .context("Failed to get local description")?;

        Ok(serde_json::to_string(&local_description)
            .context("Failed to serialize local description")?)
    }

    fn ensure_open(&self) -> Result<(), WebrtcError> {
        if self.is_closed() {
            return Err(WebrtcError::Closed);
        }
        Ok(())
    }
}
