pub mod config;
pub mod error;
pub mod media;
mod peer;
mod receiver;
mod sender;

pub use media::{
    CaptureDevice, CaptureError, CaptureFeed, CaptureStreams, ChannelCaptureDevice, LocalMedia,
    LocalTracks, MediaFrame, MediaKind, MediaPreview, RemoteFrame, RemoteTrackInfo,
};
pub use peer::Peer;
pub use peer::PeerConnectionState;
pub use peer::PeerEvent;
pub use receiver::Receiver;
pub use sender::Sender;
