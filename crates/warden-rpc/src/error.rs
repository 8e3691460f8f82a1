use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Bad request")]
    BadRequest,

    #[error("Unknown method")]
    UnknownMethod,

    #[error("Forbidden")]
    Forbidden,

    #[error("Invalid importer")]
    InvalidImporter,

    #[error("Unknown key")]
    UnknownKey,

    #[error("Request timeout")]
    Timeout,

    #[error("{0}")]
    Method(String),

    #[error("transport: {0}")]
    Transport(String),
}

impl From<warden_core::CoreError> for RpcError {
    fn from(e: warden_core::CoreError) -> Self {
        RpcError::Method(e.to_string())
    }
}

impl From<warden_relay::RelayError> for RpcError {
    fn from(e: warden_relay::RelayError) -> Self {
        RpcError::Transport(e.to_string())
    }
}
