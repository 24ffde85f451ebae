#[cfg(feature = "webrtc")]
pub mod webrtc;
#[cfg(feature = "ws")]
pub mod ws;

#[cfg(feature = "ws")]
pub use ws::{Envelope, MessageKind, SignalingMessage};
