use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors shared by the event model and the crypto seams.
///
/// Display implementations never contain key material; decryption
/// failures use a generic message to avoid oracle behavior.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("attestation error: {0}")]
    Attestation(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
