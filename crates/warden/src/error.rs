use thiserror::Error;

pub type WardenResult<T> = Result<T, WardenError>;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("parent handshake failed: {0}")]
    Parent(String),

    #[error(transparent)]
    Core(#[from] warden_core::CoreError),

    #[error(transparent)]
    Relay(#[from] warden_relay::RelayError),

    #[error(transparent)]
    Rpc(#[from] warden_rpc::RpcError),

    #[error(transparent)]
    Attest(#[from] warden_attest::AttestError),
}
