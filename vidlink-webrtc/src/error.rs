use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebrtcError {
    #[error("peer connection closed")]
    Closed,
    #[error("invalid peer state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Other(#[from] Box<anyhow::Error>),
}

impl From<anyhow::Error> for WebrtcError {
    fn from(err: anyhow::Error) -> Self {
        WebrtcError::Other(Box::new(err))
    }
}
