//! Capability seams: the `Signer` trait and the `AttestationSource` trait.
//!
//! The RPC engine and the attestation chain consume both as opaque
//! capabilities. `LocalSigner` is the in-process implementation backed
//! by a secp256k1 key; enclave deployments construct the
//! `AttestationSource` once at startup and pass it by reference into
//! every component that needs it.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use k256::schnorr::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use crate::error::{CoreError, CoreResult};
use crate::event::{Event, EventTemplate};

/// Envelope version byte prefixed to every ciphertext payload.
const ENVELOPE_VERSION: u8 = 2;

// ---------------------------------------------------------------------------
// Signer — signing and envelope encryption between two pubkeys
// ---------------------------------------------------------------------------

pub trait Signer: Send + Sync {
    /// Hex-encoded x-only public key.
    fn public_key(&self) -> String;

    fn sign_event(&self, template: EventTemplate) -> CoreResult<Event>;

    fn nip04_encrypt(&self, pubkey: &str, plaintext: &str) -> CoreResult<String>;
    fn nip04_decrypt(&self, pubkey: &str, payload: &str) -> CoreResult<String>;
    fn nip44_encrypt(&self, pubkey: &str, plaintext: &str) -> CoreResult<String>;
    fn nip44_decrypt(&self, pubkey: &str, payload: &str) -> CoreResult<String>;
}

// ---------------------------------------------------------------------------
// AttestationSource — hardware attestation retrieval
// ---------------------------------------------------------------------------

pub trait AttestationSource: Send + Sync {
    /// Retrieve a signed attestation document, optionally binding the
    /// given public key into it. Returns an empty document when the
    /// platform is unmeasured (debug mode).
    fn attest(&self, public_key: Option<&[u8]>) -> CoreResult<Vec<u8>>;
}

/// Debug-mode source: no hardware, always empty.
pub struct NoAttestation;

impl AttestationSource for NoAttestation {
    fn attest(&self, _public_key: Option<&[u8]>) -> CoreResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// LocalSigner — in-process secp256k1 signer
// ---------------------------------------------------------------------------

pub struct LocalSigner {
    key: SigningKey,
    pubkey: String,
}

impl LocalSigner {
    pub fn generate() -> Self {
        Self::from_key(SigningKey::random(&mut OsRng))
    }

    pub fn from_secret_hex(secret: &str) -> CoreResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(secret).map_err(|e| CoreError::InvalidKey(e.to_string()))?,
        );
        Self::from_secret_bytes(&bytes)
    }

    pub fn from_secret_bytes(secret: &[u8]) -> CoreResult<Self> {
        let key =
            SigningKey::from_bytes(secret).map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        Ok(Self::from_key(key))
    }

    fn from_key(key: SigningKey) -> Self {
        let pubkey = hex::encode(key.verifying_key().to_bytes());
        Self { key, pubkey }
    }

    /// ECDH over the x coordinate, expanded into a symmetric key.
    ///
    /// Only the x coordinate of the shared point is used, so both
    /// directions of a conversation derive the same key regardless of
    /// which parity the x-only pubkeys lift to.
    fn conversation_key(&self, their_pubkey: &str) -> CoreResult<Zeroizing<[u8; 32]>> {
        let x = hex::decode(their_pubkey).map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        if x.len() != 32 {
            return Err(CoreError::InvalidKey("bad pubkey length".into()));
        }
        let mut sec1 = [0u8; 33];
        sec1[0] = 0x02;
        sec1[1..].copy_from_slice(&x);
        let point = k256::PublicKey::from_sec1_bytes(&sec1)
            .map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        let shared =
            k256::ecdh::diffie_hellman(self.key.as_nonzero_scalar(), point.as_affine());
        let hk = Hkdf::<Sha256>::new(Some(b"warden-envelope-v2"), shared.raw_secret_bytes());
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(b"", okm.as_mut())
            .map_err(|_| CoreError::EncryptionFailed)?;
        Ok(okm)
    }

    fn envelope_encrypt(&self, pubkey: &str, plaintext: &str) -> CoreResult<String> {
        let key = self.conversation_key(pubkey)?;
        let cipher = ChaCha20Poly1305::new(key.as_ref().into());
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CoreError::EncryptionFailed)?;
        let mut payload = Vec::with_capacity(1 + nonce.len() + ciphertext.len());
        payload.push(ENVELOPE_VERSION);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(B64.encode(payload))
    }

    fn envelope_decrypt(&self, pubkey: &str, payload: &str) -> CoreResult<String> {
        let raw = B64.decode(payload).map_err(|_| CoreError::DecryptionFailed)?;
        if raw.len() < 1 + 12 + 16 || raw[0] != ENVELOPE_VERSION {
            return Err(CoreError::DecryptionFailed);
        }
        let key = self.conversation_key(pubkey)?;
        let cipher = ChaCha20Poly1305::new(key.as_ref().into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&raw[1..13]), &raw[13..])
            .map_err(|_| CoreError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CoreError::DecryptionFailed)
    }
}

impl Signer for LocalSigner {
    fn public_key(&self) -> String {
        self.pubkey.clone()
    }

    fn sign_event(&self, template: EventTemplate) -> CoreResult<Event> {
        template.finalize(&self.key)
    }

    // The legacy nip04 method names share the same envelope; callers
    // that still request nip04 get the modern scheme.
    fn nip04_encrypt(&self, pubkey: &str, plaintext: &str) -> CoreResult<String> {
        self.envelope_encrypt(pubkey, plaintext)
    }

    fn nip04_decrypt(&self, pubkey: &str, payload: &str) -> CoreResult<String> {
        self.envelope_decrypt(pubkey, payload)
    }

    fn nip44_encrypt(&self, pubkey: &str, plaintext: &str) -> CoreResult<String> {
        self.envelope_encrypt(pubkey, plaintext)
    }

    fn nip44_decrypt(&self, pubkey: &str, payload: &str) -> CoreResult<String> {
        self.envelope_decrypt(pubkey, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Object safety: responders hold `&dyn Signer`.
    fn _assert_signer_object_safe(_: &dyn Signer) {}
    fn _assert_attestation_object_safe(_: &dyn AttestationSource) {}

    #[test]
    fn test_envelope_roundtrip_both_directions() {
        let a = LocalSigner::generate();
        let b = LocalSigner::generate();

        let ct = a.nip44_encrypt(&b.public_key(), "secret request").unwrap();
        assert_eq!(b.nip44_decrypt(&a.public_key(), &ct).unwrap(), "secret request");

        let ct = b.nip44_encrypt(&a.public_key(), "secret reply").unwrap();
        assert_eq!(a.nip44_decrypt(&b.public_key(), &ct).unwrap(), "secret reply");
    }

    #[test]
    fn test_wrong_recipient_cannot_decrypt() {
        let a = LocalSigner::generate();
        let b = LocalSigner::generate();
        let c = LocalSigner::generate();

        let ct = a.nip44_encrypt(&b.public_key(), "for b only").unwrap();
        assert!(c.nip44_decrypt(&a.public_key(), &ct).is_err());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let a = LocalSigner::generate();
        let b = LocalSigner::generate();
        let ct = a.nip44_encrypt(&b.public_key(), "payload").unwrap();
        let mut raw = B64.decode(&ct).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(b.nip44_decrypt(&a.public_key(), &B64.encode(raw)).is_err());
    }

    #[test]
    fn test_secret_hex_roundtrip() {
        let a = LocalSigner::generate();
        let sk = SigningKey::random(&mut OsRng);
        let secret = hex::encode(sk.to_bytes());
        let restored = LocalSigner::from_secret_hex(&secret).unwrap();
        assert_eq!(restored.public_key(), hex::encode(sk.verifying_key().to_bytes()));
        assert_ne!(restored.public_key(), a.public_key());
    }

    #[test]
    fn test_no_attestation_is_empty() {
        assert!(NoAttestation.attest(None).unwrap().is_empty());
    }
}
