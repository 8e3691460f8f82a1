//! Protocol-defined event kinds and tag markers.

/// Administrative channel: key lifecycle requests to this instance.
pub const KIND_ADMIN: u32 = 24134;

/// Per-user signer channel (remote signing requests).
pub const KIND_SIGNER: u32 = 24133;

/// Permission-storage channel: application-scoped key-value list.
pub const KIND_PERMS: u32 = 30078;

/// Instance self-announcement channel.
pub const KIND_INSTANCE: u32 = 13196;

/// Profile metadata.
pub const KIND_PROFILE: u32 = 0;

/// Public marker tag identifying permission-storage events.
pub const PERM_APP_TAG: &str = "warden/perm";
