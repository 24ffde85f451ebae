use vidlink_protocol::webrtc::{IceConfig, IceServer};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub const PEER_EVENTS_CAPACITY: usize = 64;

pub const LOCAL_STREAM_ID: &str = "vidlink-local";
pub const AUDIO_TRACK_ID: &str = "vidlink-audio";
pub const VIDEO_TRACK_ID: &str = "vidlink-video";

pub const OPUS_CLOCK_RATE: u32 = 48_000;
pub const OPUS_CHANNELS: u16 = 2;
pub const VP8_CLOCK_RATE: u32 = 90_000;

/// Size of the buffer used to drain RTCP packets from each RTP sender.
pub const RTCP_BUFFER_SIZE: usize = 1500;

pub trait IntoRtc<T> {
    fn into_rtc(self) -> T;
}

impl IntoRtc<RTCIceServer> for IceServer {
    fn into_rtc(self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls,
            username: self.username.unwrap_or_default(),
            credential: self.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl IntoRtc<RTCConfiguration> for IceConfig {
    fn into_rtc(self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .into_iter()
                .map(IntoRtc::into_rtc)
                .collect(),
            ..Default::default()
        }
    }
}
