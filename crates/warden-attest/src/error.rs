use thiserror::Error;

pub type AttestResult<T> = Result<T, AttestError>;

#[derive(Debug, Error)]
pub enum AttestError {
    #[error("bad attestation document: {0}")]
    BadDocument(String),

    #[error("attestation document has no PCR{0}")]
    MissingPcr(u8),

    #[error("build certificate invalid: {0}")]
    CertInvalid(String),

    #[error("build mismatch: {0}")]
    BuildMismatch(String),

    #[error("instance mismatch: {0}")]
    InstanceMismatch(String),

    #[error("{0} is not tagged for production")]
    NotProduction(&'static str),

    #[error("no announce relay accepted the event")]
    AnnounceFailed,

    #[error(transparent)]
    Core(#[from] warden_core::CoreError),
}
