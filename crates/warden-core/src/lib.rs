//! Core types for the warden remote signer.
//!
//! Everything the other crates share lives here: the event model with
//! canonical ids and schnorr signatures, the `Signer` capability trait
//! (signing + envelope encryption between two pubkeys), and the
//! `AttestationSource` seam the enclave hardware is reached through.

pub mod error;
pub mod event;
pub mod kinds;
pub mod signer;

pub use error::{CoreError, CoreResult};
pub use event::{now, Event, EventTemplate};
pub use signer::{AttestationSource, LocalSigner, NoAttestation, Signer};
