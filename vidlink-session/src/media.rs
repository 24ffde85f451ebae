use crate::error::MediaAcquisitionError;
use std::sync::Arc;
use tracing::instrument;
use vidlink_webrtc::{CaptureDevice, LocalMedia};

/// Acquires local camera and microphone for a call session.
#[derive(Clone)]
pub struct MediaSourceProvider {
    device: Arc<dyn CaptureDevice>,
}

impl MediaSourceProvider {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self { device }
    }

    /// Requests audio and video. Denied permission or a missing device is returned as error, the
    /// caller decides how the session continues.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn acquire(&self) -> Result<LocalMedia, MediaAcquisitionError> {
        let streams = self.device.request_capture(true, true).await?;
        let media = LocalMedia::start(streams);
        tracing::debug!(preview = ?media.preview(), "Acquired local media");
        Ok(media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use vidlink_webrtc::{CaptureError, ChannelCaptureDevice, MediaKind};

    #[test(tokio::test)]
    async fn acquire_requests_audio_and_video() {
        let (device, feed) = ChannelCaptureDevice::new(4);
        let provider = MediaSourceProvider::new(Arc::new(device));

        let media = provider.acquire().await.unwrap();
        assert!(feed.is_capturing(MediaKind::Audio));
        assert!(feed.is_capturing(MediaKind::Video));
        assert!(!media.is_stopped());
    }

    #[test(tokio::test)]
    async fn acquire_denied() {
        let (device, feed) = ChannelCaptureDevice::new(4);
        feed.set_permission(false);
        let provider = MediaSourceProvider::new(Arc::new(device));

        let err = provider.acquire().await.unwrap_err();
        assert!(matches!(err, MediaAcquisitionError(CaptureError::PermissionDenied)));
    }
}
