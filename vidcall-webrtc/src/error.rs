use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebrtcError {
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error(transparent)]
    Other(#[from] Box<anyhow::Error>),
}

impl From<anyhow::Error> for WebrtcError {
    fn from(err: anyhow::Error) -> Self {
        WebrtcError::Other(Box::new(err))
    }
}
