use crate::media::{MediaKind, RemoteFrame, RemoteTrackInfo};
use crate::peer::PeerEvent;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::instrument;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Announces remote tracks and forwards their RTP payloads to the host renderer.
pub struct Receiver {
    shutdown_tx: watch::Sender<()>,
}

impl Receiver {
    #[instrument(level = "trace", skip_all)]
    pub fn new(
        peer_connection: &RTCPeerConnection,
        events_tx: broadcast::Sender<PeerEvent>,
        output_tx: mpsc::Sender<RemoteFrame>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        peer_connection.on_track(Box::new(move |track, _, _| {
            let output_tx = output_tx.clone();
            let events_tx = events_tx.clone();
            let mut shutdown_rx = shutdown_rx.clone();

            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    other => {
                        tracing::warn!(?other, "Ignoring remote track of unsupported kind");
                        return;
                    }
                };
                let info = RemoteTrackInfo {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                };
                tracing::debug!(?info, "Remote track received");
                if let Err(err) = events_tx.send(PeerEvent::RemoteTrack(info.clone())) {
                    tracing::warn!(?err, "Failed to send remote track event");
                }

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => {
                                tracing::trace!(track_id = ?info.id, "Shutdown signalled, stopping receiver");
                                break;
                            }
                            rtp = track.read_rtp() => {
                                match rtp {
                                    Ok((packet, _)) => {
                                        let frame = RemoteFrame {
                                            track_id: info.id.clone(),
                                            kind: info.kind,
                                            payload: packet.payload,
                                        };
                                        if output_tx.send(frame).await.is_err() {
                                            tracing::warn!("Failed to send received RTP packet to output");
                                            break;
                                        }
                                    }
                                    Err(err) => {
                                        tracing::debug!(?err, track_id = ?info.id, "Failed to read RTP packet, remote track ended");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                });
            })
        }));

        Self { shutdown_tx }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
