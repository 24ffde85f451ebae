pub mod config;
pub mod controller;
pub mod error;
pub mod link;
pub mod media;
pub mod observer;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use controller::CallController;
pub use error::{
    CallError, CandidateApplicationError, MediaAcquisitionError, NegotiationError,
};
pub use link::{LinkEvent, LinkEvents, LinkState, PeerConnector, PeerLink, RemoteDescription};
pub use media::MediaSourceProvider;
pub use observer::{CallHandle, CallIntent, CallSnapshot, EndReason, SessionEvent};
pub use session::CallPhase;
