//! The warden service: a remote signer custodying Nostr keys behind a
//! permission engine, with enclave attestation when the platform
//! provides it.

pub mod config;
pub mod error;
pub mod listeners;
pub mod registry;
pub mod service;

pub use config::Config;
pub use error::{WardenError, WardenResult};
pub use registry::KeyRegistry;
pub use service::{get_info, run, ParentInfo};
