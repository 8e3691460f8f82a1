//! Enclave attestation chain.
//!
//! Parses the hardware attestation document, verifies build and
//! instance records against the enclave's own measurements, and keeps
//! the instance announced on public relays.

pub mod announce;
pub mod doc;
pub mod error;
pub mod verify;

pub use announce::{Announcer, ANNOUNCE_INTERVAL};
pub use doc::AttestationDoc;
pub use error::{AttestError, AttestResult};
pub use verify::{pcr_extend_digest, require_prod, verify_build, verify_instance};
