use crate::media::MediaFrame;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};
use webrtc::media::Sample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Pumps captured frames into a local track until cancelled or the capture stream ends.
pub struct Sender {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Sender {
    #[instrument(level = "trace", skip_all, fields(track_id = %track.id()))]
    pub fn new(
        track: Arc<TrackLocalStaticSample>,
        mut input_rx: mpsc::Receiver<MediaFrame>,
        cancel: CancellationToken,
    ) -> Self {
        let task_cancel = cancel.clone();
        let task = tokio::runtime::Handle::current().spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => {
                        tracing::trace!("Shutdown signalled, stopping sending");
                        break;
                    }
                    frame = input_rx.recv() => {
                        match frame {
                            Some(frame) => {
                                let sample = Sample {
                                    data: frame.data,
                                    duration: frame.duration,
                                    ..Default::default()
                                };

                                if let Err(err) = track.write_sample(&sample).await {
                                    tracing::warn!(?err, "Failed to write sample to track");
                                }
                            }
                            None => {
                                tracing::trace!("Capture stream ended, stopping sending");
                                break;
                            }
                        }
                    }
                }
            }
        }.instrument(tracing::Span::current()));

        Self { cancel, task }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[instrument(level = "trace", skip(self), err)]
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        tracing::trace!("Waiting for sender task to finish");
        self.task.await.context("Failed to join sender task")
    }
}
