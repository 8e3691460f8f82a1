//! Permission policy engine.
//!
//! Stores per-(signer, application) permission state, merges
//! peer-supplied updates that may arrive out of order and more than
//! once, and computes the allow/disallow/ignore/ask decision for each
//! RPC request.

pub mod engine;
pub mod types;

pub use engine::Perms;
pub use types::{Decision, MergeOutcome, Perm, PermRecord, PermRequest};
