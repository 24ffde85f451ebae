use crate::observer::CallIntent;
use crate::session::CallPhase;
use thiserror::Error;
use vidlink_signaling::error::SignalingError;
use vidlink_webrtc::CaptureError;
use vidlink_webrtc::error::WebrtcError;

/// Errors returned to the caller of a user intent.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("cannot {intent} while {phase}")]
    InvalidPhase { intent: CallIntent, phase: CallPhase },
    #[error("cannot call yourself")]
    SelfCall,
    #[error("invalid party id: {0:?}")]
    InvalidPartyId(String),
    #[error("signaling error: {0}")]
    Signaling(#[from] Box<SignalingError>),
    #[error("call controller is not running")]
    ControllerClosed,
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::Signaling(Box::new(err))
    }
}

/// Local camera or microphone could not be acquired (permission denied or device unavailable).
#[derive(Debug, Error)]
#[error("failed to acquire local media: {0}")]
pub struct MediaAcquisitionError(#[from] pub CaptureError);

/// Session description could not be created or applied.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer link closed")]
    LinkClosed,
    #[error("invalid peer link state: {0}")]
    InvalidState(String),
    #[error("WebRTC error: {0}")]
    Webrtc(#[from] Box<WebrtcError>),
    #[error("failed to send negotiation artifact: {0}")]
    Signaling(#[from] Box<SignalingError>),
    #[error(transparent)]
    Other(#[from] Box<anyhow::Error>),
}

impl From<SignalingError> for NegotiationError {
    fn from(err: SignalingError) -> Self {
        NegotiationError::Signaling(Box::new(err))
    }
}

impl From<WebrtcError> for NegotiationError {
    fn from(err: WebrtcError) -> Self {
        match err {
            WebrtcError::Closed => NegotiationError::LinkClosed,
            WebrtcError::InvalidState(reason) => NegotiationError::InvalidState(reason),
            err => NegotiationError::Webrtc(Box::new(err)),
        }
    }
}

impl From<anyhow::Error> for NegotiationError {
    fn from(err: anyhow::Error) -> Self {
        NegotiationError::Other(Box::new(err))
    }
}

/// A remote ICE candidate was rejected by the peer link. Never fatal to the call.
#[derive(Debug, Error)]
#[error("failed to apply ICE candidate: {0}")]
pub struct CandidateApplicationError(pub String);

impl From<WebrtcError> for CandidateApplicationError {
    fn from(err: WebrtcError) -> Self {
        CandidateApplicationError(err.to_string())
    }
}
