use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("publish timeout")]
    PublishTimeout,

    #[error("publish rejected: {0}")]
    PublishRejected(String),

    #[error("publish already pending for this event id")]
    DuplicatePublish,

    #[error("relay connection task is gone")]
    ConnectionGone,

    #[error("bad frame: {0}")]
    BadFrame(String),
}
