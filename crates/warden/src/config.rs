use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{WardenError, WardenResult};

/// Top-level configuration for the warden service.
///
/// Loaded from a TOML file (typically `~/.warden/config.toml`); every
/// field has a default so an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Inbox relay carrying signer and admin requests.
    #[serde(default = "default_inbox_relay")]
    pub inbox_relay_url: String,

    /// Relays watched for permission-storage events.
    #[serde(default = "default_perm_relays")]
    pub perm_relays: Vec<String>,

    /// Relays the instance announces itself on.
    #[serde(default = "default_announce_relays")]
    pub announce_relays: Vec<String>,

    /// Websocket endpoint of the enclave parent process.
    #[serde(default = "default_parent_url")]
    pub parent_url: String,

    /// Require production-tagged build and instance records.
    #[serde(default)]
    pub production: bool,

    /// Pubkeys per batched subscription.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Base URL of the approval surface, when one is deployed.
    #[serde(default)]
    pub approval_base: Option<String>,

    /// Attestation document dropped by the platform, for deployments
    /// where the measurement device is not directly readable. Unset
    /// means no attestation (debug mode).
    #[serde(default)]
    pub attestation_doc: Option<PathBuf>,

    /// Source repository advertised in announcements.
    #[serde(default = "default_repo")]
    pub repo: String,
}

fn default_inbox_relay() -> String {
    "wss://relay.nsec.app".to_string()
}

fn default_perm_relays() -> Vec<String> {
    vec![
        "wss://relay.damus.io".to_string(),
        "wss://nos.lol".to_string(),
        "wss://relay.primal.net".to_string(),
    ]
}

fn default_announce_relays() -> Vec<String> {
    vec![
        "wss://relay.nostr.band".to_string(),
        "wss://relay.damus.io".to_string(),
        "wss://relay.primal.net".to_string(),
    ]
}

fn default_parent_url() -> String {
    "ws://127.0.0.1:2080".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_repo() -> String {
    env!("CARGO_PKG_REPOSITORY").to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inbox_relay_url: default_inbox_relay(),
            perm_relays: default_perm_relays(),
            announce_relays: default_announce_relays(),
            parent_url: default_parent_url(),
            production: false,
            batch_size: default_batch_size(),
            approval_base: None,
            attestation_doc: None,
            repo: default_repo(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file; a missing file yields the
    /// defaults.
    pub fn load(path: &Path) -> WardenResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WardenResult<()> {
        if self.inbox_relay_url.is_empty() {
            return Err(WardenError::Config("inbox_relay_url must be set".into()));
        }
        if self.perm_relays.is_empty() {
            return Err(WardenError::Config("perm_relays must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(WardenError::Config("batch_size must be > 0".into()));
        }
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".warden/config.toml"))
            .unwrap_or_else(|_| PathBuf::from(".warden/config.toml"))
    }
}
