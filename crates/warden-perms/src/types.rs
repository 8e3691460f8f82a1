use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Decision — the engine's verdict on one RPC request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Disallow,
    /// No reply is sent at all; to the caller this is indistinguishable
    /// from packet loss.
    Ignore,
    /// The caller is redirected to an out-of-band approval prompt.
    Ask,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => write!(f, "allow"),
            Decision::Disallow => write!(f, "disallow"),
            Decision::Ignore => write!(f, "ignore"),
            Decision::Ask => write!(f, "ask"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire record — decrypted payload of a permission-storage event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermEntry {
    #[serde(default)]
    pub perm: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermRecord {
    /// Signer pubkey the grants apply to.
    #[serde(default)]
    pub signer: String,
    /// Application pubkey the grants were issued for.
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub created_at: u64,
    /// Version of the app info fields.
    #[serde(default)]
    pub info_updated_at: u64,
    /// Version of the perm list, independent of the info version.
    #[serde(default)]
    pub perms_updated_at: u64,
    #[serde(default)]
    pub perms: Vec<PermEntry>,
    #[serde(default)]
    pub deleted: bool,
}

impl PermRecord {
    /// A record is either a well-formed deletion or a well-formed full
    /// record with a non-empty perm list.
    pub fn is_valid(&self) -> bool {
        if self.signer.is_empty() || self.app.is_empty() || self.info_updated_at == 0 {
            return false;
        }
        if self.deleted {
            return true;
        }
        if self.created_at == 0 || self.perms_updated_at == 0 || self.perms.is_empty() {
            return false;
        }
        self.perms
            .iter()
            .all(|p| !p.perm.is_empty() && p.updated_at > 0)
    }
}

// ---------------------------------------------------------------------------
// Stored state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Perm {
    pub name: String,
    pub value: String,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct App {
    pub created_at: u64,
    pub info_updated_at: u64,
    pub perms_updated_at: u64,
    pub perms: Vec<Perm>,
}

/// Outcome of merging one permission-update event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// The event id was already processed.
    Duplicate,
    /// The record failed shape validation and was dropped.
    Invalid,
}

/// The request shape the decision algorithm consumes.
#[derive(Debug, Clone, Copy)]
pub struct PermRequest<'a> {
    pub client_pubkey: &'a str,
    pub method: &'a str,
    pub params: &'a [String],
}
