use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("transport error: {0}")]
    Transport(#[from] Box<anyhow::Error>),
    #[error("invalid signaling endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error(transparent)]
    Runtime(#[from] SignalingRuntimeError),
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for SignalingError {
    fn from(err: anyhow::Error) -> Self {
        SignalingError::Transport(Box::new(err))
    }
}

/// Errors raised while the signaling connection is running, broadcast to subscribers as
/// [`crate::client::SignalingEvent::Error`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingRuntimeError {
    #[error("disconnected")]
    Disconnected,
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("transport error: {0}")]
    Transport(TransportFailureReason),
}

impl SignalingRuntimeError {
    /// Fatal errors leave the signaling connection unusable and force a disconnect.
    pub fn is_fatal(&self) -> bool {
        match self {
            SignalingRuntimeError::Disconnected => true,
            SignalingRuntimeError::SerializationError(_) => false,
            SignalingRuntimeError::Transport(_) => true,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportFailureReason {
    #[error("failed to send: {0}")]
    Send(String),
    #[error("failed to receive: {0}")]
    Receive(String),
    #[error("failed to close: {0}")]
    Close(String),
}
