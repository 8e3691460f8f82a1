//! The signed event model.
//!
//! An event is an immutable, signed, timestamped record with a numeric
//! kind, tag list and content body. Its id is the SHA-256 of the
//! canonical JSON array `[0, pubkey, created_at, kind, tags, content]`,
//! and the signature is BIP-340 schnorr over that id.

use k256::schnorr::signature::{Signer as _, Verifier as _};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CoreError, CoreResult};

/// Current unix time, seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Event — signed wire representation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// An unsigned event, waiting for a `Signer` to finalize it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Canonical serialization hashed into the event id.
fn event_digest(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> CoreResult<[u8; 32]> {
    let canonical = serde_json::to_string(&serde_json::json!([
        0, pubkey, created_at, kind, tags, content
    ]))?;
    Ok(Sha256::digest(canonical.as_bytes()).into())
}

impl Event {
    /// Compute the canonical id for this event's fields.
    pub fn compute_id(&self) -> CoreResult<String> {
        let digest = event_digest(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        Ok(hex::encode(digest))
    }

    /// Shape check: hex fields of the right length, id matches content.
    pub fn validate(&self) -> CoreResult<()> {
        if self.pubkey.len() != 64 || hex::decode(&self.pubkey).is_err() {
            return Err(CoreError::InvalidEvent("bad pubkey".into()));
        }
        if self.id.len() != 64 || hex::decode(&self.id).is_err() {
            return Err(CoreError::InvalidEvent("bad id".into()));
        }
        if self.sig.len() != 128 || hex::decode(&self.sig).is_err() {
            return Err(CoreError::InvalidEvent("bad sig".into()));
        }
        if self.compute_id()? != self.id {
            return Err(CoreError::InvalidEvent("id mismatch".into()));
        }
        Ok(())
    }

    /// Verify the schnorr signature against the event id.
    pub fn verify(&self) -> CoreResult<()> {
        let pubkey_bytes =
            hex::decode(&self.pubkey).map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        let key = VerifyingKey::from_bytes(&pubkey_bytes)
            .map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        let sig_bytes =
            hex::decode(&self.sig).map_err(|_| CoreError::InvalidSignature)?;
        let sig =
            Signature::try_from(sig_bytes.as_slice()).map_err(|_| CoreError::InvalidSignature)?;
        let id_bytes = hex::decode(&self.id).map_err(|_| CoreError::InvalidSignature)?;
        key.verify(&id_bytes, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }

    /// First value of the first tag with the given name.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() > 1 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// The pubkey this event is addressed to (first `p` tag).
    pub fn p_tag(&self) -> Option<&str> {
        self.tag_value("p")
    }

    /// Whether any tag with the given name carries the given value.
    pub fn has_tag(&self, name: &str, value: &str) -> bool {
        self.tags
            .iter()
            .any(|t| t.len() > 1 && t[0] == name && t[1] == value)
    }
}

impl EventTemplate {
    pub fn new(kind: u32, content: impl Into<String>, tags: Vec<Vec<String>>) -> Self {
        Self {
            created_at: now(),
            kind,
            tags,
            content: content.into(),
        }
    }

    /// Finalize with the given signing key: fill pubkey, id and sig.
    pub(crate) fn finalize(self, key: &SigningKey) -> CoreResult<Event> {
        let pubkey = hex::encode(key.verifying_key().to_bytes());
        let digest = event_digest(&pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        let sig: Signature = key.sign(&digest);
        Ok(Event {
            id: hex::encode(digest),
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.to_bytes()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::schnorr::SigningKey;
    use rand::rngs::OsRng;

    fn signed_event() -> Event {
        let key = SigningKey::random(&mut OsRng);
        EventTemplate::new(1, "hello", vec![vec!["p".into(), "ab".into()]])
            .finalize(&key)
            .unwrap()
    }

    #[test]
    fn test_finalized_event_validates_and_verifies() {
        let e = signed_event();
        e.validate().unwrap();
        e.verify().unwrap();
    }

    #[test]
    fn test_tampered_content_fails_validation() {
        let mut e = signed_event();
        e.content = "tampered".into();
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_tampered_id_fails_verification() {
        let mut e = signed_event();
        // keep the id consistent with content but break the signature
        e.sig = hex::encode([0u8; 64]);
        assert!(e.verify().is_err());
    }

    #[test]
    fn test_id_is_deterministic() {
        let e = signed_event();
        assert_eq!(e.compute_id().unwrap(), e.id);
    }

    #[test]
    fn test_tag_helpers() {
        let e = signed_event();
        assert_eq!(e.p_tag(), Some("ab"));
        assert_eq!(e.tag_value("q"), None);
        assert!(e.has_tag("p", "ab"));
        assert!(!e.has_tag("p", "cd"));
    }
}
