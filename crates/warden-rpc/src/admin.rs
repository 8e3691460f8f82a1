//! The key-lifecycle responder on the administrative channel.
//!
//! Admin requests are always decided Allow; the security boundary is
//! proof of possession instead. `import_key` only succeeds when the
//! request was signed by the very key being imported, so nobody can
//! plant a key they do not hold.

use std::sync::Arc;

use warden_core::kinds::KIND_ADMIN;
use warden_core::{LocalSigner, Signer};
use warden_perms::Decision;

use crate::envelope::RpcRequest;
use crate::error::{RpcError, RpcResult};
use crate::responder::Responder;

// ---------------------------------------------------------------------------
// KeyStore — registry mutation seam
// ---------------------------------------------------------------------------

/// The mutations an admin call may apply to the service's key
/// registry. The registry side decides what "adding a key" entails
/// (spinning up responders, wiring subscriptions).
pub trait KeyStore: Send + Sync {
    /// Add a custodied key; returns its public key.
    fn import(&self, secret_hex: &str) -> RpcResult<String>;

    /// Import plus an immediate grant of the listed perms to the
    /// importing application.
    fn connect(&self, secret_hex: &str, perms: &[String]) -> RpcResult<String>;

    fn delete(&self, pubkey: &str) -> RpcResult<()>;

    fn has(&self, pubkey: &str) -> bool;

    /// Mint a throwaway key that the registry drops after its
    /// time-box elapses; returns its public key.
    fn generate_test_key(&self) -> RpcResult<String>;
}

// ---------------------------------------------------------------------------
// AdminResponder
// ---------------------------------------------------------------------------

pub struct AdminResponder {
    signer: Arc<dyn Signer>,
    store: Arc<dyn KeyStore>,
}

impl AdminResponder {
    pub fn new(signer: Arc<dyn Signer>, store: Arc<dyn KeyStore>) -> Self {
        Self { signer, store }
    }

    /// Proof of possession: the caller must be the key it submits.
    fn verify_importer(req: &RpcRequest) -> RpcResult<String> {
        let secret = req.params.first().ok_or(RpcError::BadRequest)?;
        let derived = LocalSigner::from_secret_hex(secret)
            .map_err(|_| RpcError::BadRequest)?
            .public_key();
        if derived != req.client_pubkey {
            return Err(RpcError::InvalidImporter);
        }
        Ok(secret.clone())
    }
}

impl Responder for AdminResponder {
    fn kind(&self) -> u32 {
        KIND_ADMIN
    }

    fn signer(&self) -> &dyn Signer {
        self.signer.as_ref()
    }

    fn check(&self, _req: &RpcRequest) -> Decision {
        Decision::Allow
    }

    fn handle(&self, req: &RpcRequest) -> RpcResult<String> {
        match req.method.as_str() {
            "import_key" => {
                let secret = Self::verify_importer(req)?;
                self.store.import(&secret)?;
                Ok("ok".into())
            }
            "connect_key" => {
                let secret = Self::verify_importer(req)?;
                self.store.connect(&secret, &req.params[1..])?;
                Ok("ok".into())
            }
            "delete_key" => {
                let target = req.params.first().ok_or(RpcError::BadRequest)?;
                // only the key itself may remove itself
                if target != &req.client_pubkey {
                    return Err(RpcError::Forbidden);
                }
                self.store.delete(target)?;
                Ok("ok".into())
            }
            "has_key" => {
                let target = req.params.first().ok_or(RpcError::BadRequest)?;
                Ok(self.store.has(target).to_string())
            }
            "generate_test_key" => self.store.generate_test_key(),
            _ => Err(RpcError::UnknownMethod),
        }
    }

    fn approval_url(&self, _req_id: &str) -> Option<String> {
        None
    }
}
