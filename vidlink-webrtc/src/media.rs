use crate::Sender;
use crate::config::{
    AUDIO_TRACK_ID, LOCAL_STREAM_ID, OPUS_CHANNELS, OPUS_CLOCK_RATE, VIDEO_TRACK_ID,
    VP8_CLOCK_RATE,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Encoded frame produced by a capture device (Opus for audio, VP8 for video).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

impl MediaFrame {
    pub fn new(data: impl Into<Bytes>, duration: Duration) -> Self {
        Self {
            data: data.into(),
            duration,
        }
    }
}

/// Announcement of a track received from the remote party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

/// RTP payload received on a remote track, handed to the host renderer.
#[derive(Debug, Clone)]
pub struct RemoteFrame {
    pub track_id: String,
    pub kind: MediaKind,
    pub payload: Bytes,
}

/// Identifiers the host needs to bind the local preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPreview {
    pub stream_id: String,
    pub audio_track_id: String,
    pub video_track_id: String,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error(transparent)]
    Other(#[from] Box<anyhow::Error>),
}

impl From<anyhow::Error> for CaptureError {
    fn from(err: anyhow::Error) -> Self {
        CaptureError::Other(Box::new(err))
    }
}

/// Frame streams handed out by a [`CaptureDevice`]. A stream is `None` if it was not requested.
#[derive(Debug, Default)]
pub struct CaptureStreams {
    pub audio: Option<mpsc::Receiver<MediaFrame>>,
    pub video: Option<mpsc::Receiver<MediaFrame>>,
}

/// Local camera and microphone.
#[async_trait]
pub trait CaptureDevice: Send + Sync + 'static {
    /// Starts capturing the requested kinds. Capture ends once the returned streams are dropped.
    async fn request_capture(&self, audio: bool, video: bool)
    -> Result<CaptureStreams, CaptureError>;
}

#[derive(Default)]
struct FeedState {
    permission_denied: bool,
    unavailable: Option<String>,
    audio_tx: Option<mpsc::Sender<MediaFrame>>,
    video_tx: Option<mpsc::Sender<MediaFrame>>,
}

/// [`CaptureDevice`] fed by the host application through a [`CaptureFeed`].
pub struct ChannelCaptureDevice {
    frame_buffer: usize,
    state: Arc<Mutex<FeedState>>,
}

impl ChannelCaptureDevice {
    pub fn new(frame_buffer: usize) -> (Self, CaptureFeed) {
        let state = Arc::new(Mutex::new(FeedState::default()));
        (
            Self {
                frame_buffer: frame_buffer.max(1),
                state: state.clone(),
            },
            CaptureFeed { state },
        )
    }
}

#[async_trait]
impl CaptureDevice for ChannelCaptureDevice {
    #[instrument(level = "debug", skip(self), err)]
    async fn request_capture(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<CaptureStreams, CaptureError> {
        let mut state = self.state.lock();
        if state.permission_denied {
            return Err(CaptureError::PermissionDenied);
        }
        if let Some(reason) = &state.unavailable {
            return Err(CaptureError::DeviceUnavailable(reason.clone()));
        }

        let mut streams = CaptureStreams::default();
        if audio {
            let (tx, rx) = mpsc::channel(self.frame_buffer);
            state.audio_tx = Some(tx);
            streams.audio = Some(rx);
        }
        if video {
            let (tx, rx) = mpsc::channel(self.frame_buffer);
            state.video_tx = Some(tx);
            streams.video = Some(rx);
        }

        tracing::debug!("Capture started");
        Ok(streams)
    }
}

/// Host side of a [`ChannelCaptureDevice`].
#[derive(Clone)]
pub struct CaptureFeed {
    state: Arc<Mutex<FeedState>>,
}

impl CaptureFeed {
    /// Pushes an encoded audio frame to the active capture. Returns `false` if the frame was
    /// dropped because nothing is capturing or the consumer is lagging behind.
    pub fn push_audio(&self, frame: MediaFrame) -> bool {
        self.push(MediaKind::Audio, frame)
    }

    /// Pushes an encoded video frame to the active capture, see [`CaptureFeed::push_audio`].
    pub fn push_video(&self, frame: MediaFrame) -> bool {
        self.push(MediaKind::Video, frame)
    }

    /// Grants or revokes capture permission. Revoking does not end an already running capture.
    pub fn set_permission(&self, granted: bool) {
        self.state.lock().permission_denied = !granted;
    }

    pub fn set_unavailable(&self, reason: Option<String>) {
        self.state.lock().unavailable = reason;
    }

    pub fn is_capturing(&self, kind: MediaKind) -> bool {
        let state = self.state.lock();
        let tx = match kind {
            MediaKind::Audio => &state.audio_tx,
            MediaKind::Video => &state.video_tx,
        };
        tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn push(&self, kind: MediaKind, frame: MediaFrame) -> bool {
        let mut state = self.state.lock();
        let slot = match kind {
            MediaKind::Audio => &mut state.audio_tx,
            MediaKind::Video => &mut state.video_tx,
        };
        let Some(tx) = slot.as_ref() else {
            return false;
        };

        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!(?kind, "Capture consumer lagging, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!(?kind, "Capture stream closed");
                slot.take();
                false
            }
        }
    }
}

/// Handles to the local tracks, shared with every peer connection the tracks are attached to.
#[derive(Clone)]
pub struct LocalTracks {
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
    stop_token: CancellationToken,
}

impl LocalTracks {
    /// Stops feeding both tracks. Safe to call repeatedly.
    pub fn stop(&self) {
        self.stop_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_token.is_cancelled()
    }
}

impl Debug for LocalTracks {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTracks")
            .field("audio", &self.audio.id())
            .field("video", &self.video.id())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Captured local audio and video, exclusively owned by one call session.
///
/// Dropping [`LocalMedia`] stops all tracks.
pub struct LocalMedia {
    tracks: LocalTracks,
    senders: Vec<Sender>,
}

impl LocalMedia {
    #[instrument(level = "debug", skip_all)]
    pub fn start(streams: CaptureStreams) -> Self {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: OPUS_CHANNELS,
                ..Default::default()
            },
            AUDIO_TRACK_ID.to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: VP8_CLOCK_RATE,
                ..Default::default()
            },
            VIDEO_TRACK_ID.to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        let stop_token = CancellationToken::new();

        let mut senders = Vec::with_capacity(2);
        if let Some(audio_rx) = streams.audio {
            senders.push(Sender::new(
                audio.clone(),
                audio_rx,
                stop_token.child_token(),
            ));
        }
        if let Some(video_rx) = streams.video {
            senders.push(Sender::new(
                video.clone(),
                video_rx,
                stop_token.child_token(),
            ));
        }
        tracing::debug!(senders = senders.len(), "Local media started");

        Self {
            tracks: LocalTracks {
                audio,
                video,
                stop_token,
            },
            senders,
        }
    }

    pub fn tracks(&self) -> LocalTracks {
        self.tracks.clone()
    }

    pub fn preview(&self) -> MediaPreview {
        MediaPreview {
            stream_id: LOCAL_STREAM_ID.to_string(),
            audio_track_id: self.tracks.audio.id().to_string(),
            video_track_id: self.tracks.video.id().to_string(),
        }
    }

    /// Stops all tracks. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.tracks.is_stopped() {
            tracing::debug!("Stopping local media");
            self.tracks.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.is_stopped()
    }

    /// Returns whether every sender task has exited.
    pub fn is_drained(&self) -> bool {
        self.senders.iter().all(Sender::is_finished)
    }
}

impl Debug for LocalMedia {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("tracks", &self.tracks)
            .field("senders", &self.senders.len())
            .finish()
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}
