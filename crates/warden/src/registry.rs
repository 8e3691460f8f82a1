//! The key registry.
//!
//! One entry per custodied key: its signer plus the responder serving
//! its channel. The registry is the `KeyStore` the admin responder
//! mutates; newly added keys are pushed over a channel so the service
//! loop can wire their request and permission subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{info, warn};

use warden_core::{now, LocalSigner, Signer};
use warden_perms::Perms;
use warden_rpc::{KeyStore, Responder, RpcError, RpcResult, UserResponder};

/// Test keys are dropped after an hour.
const TEST_KEY_TTL: u64 = 3600;

struct KeyEntry {
    signer: Arc<dyn Signer>,
    responder: Arc<dyn Responder>,
    /// Unix time after which the key is swept away (test keys only).
    expires_at: Option<u64>,
}

pub struct KeyRegistry {
    perms: Arc<Mutex<Perms>>,
    approval_base: Option<String>,
    admin_pubkey: String,
    keys: Mutex<HashMap<String, KeyEntry>>,
    added_tx: mpsc::UnboundedSender<String>,
}

impl KeyRegistry {
    /// Returns the registry and the stream of newly added pubkeys.
    pub fn new(
        perms: Arc<Mutex<Perms>>,
        approval_base: Option<String>,
        admin_pubkey: String,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (added_tx, added_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            perms,
            approval_base,
            admin_pubkey,
            keys: Mutex::new(HashMap::new()),
            added_tx,
        });
        (registry, added_rx)
    }

    /// Register the admin responder under the admin pubkey. The admin
    /// key never participates in permission storage.
    pub fn insert_admin(&self, signer: Arc<dyn Signer>, responder: Arc<dyn Responder>) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.insert(
                self.admin_pubkey.clone(),
                KeyEntry { signer, responder, expires_at: None },
            );
        }
    }

    pub fn responder_for(&self, pubkey: &str) -> Option<Arc<dyn Responder>> {
        self.keys
            .lock()
            .ok()?
            .get(pubkey)
            .map(|e| e.responder.clone())
    }

    /// The signer able to decrypt a key's own permission events. The
    /// admin key is excluded on purpose.
    pub fn signer_for(&self, pubkey: &str) -> Option<Arc<dyn Signer>> {
        if pubkey == self.admin_pubkey {
            return None;
        }
        self.keys.lock().ok()?.get(pubkey).map(|e| e.signer.clone())
    }

    pub fn key_count(&self) -> usize {
        self.keys.lock().map(|k| k.len()).unwrap_or(0)
    }

    fn add_key(&self, signer: LocalSigner, expires_at: Option<u64>) -> RpcResult<String> {
        let pubkey = signer.public_key();
        if pubkey == self.admin_pubkey {
            warn!("refusing to import the admin key as a user key");
            return Ok(pubkey);
        }
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| RpcError::Transport("registry poisoned".into()))?;
        if keys.contains_key(&pubkey) {
            info!(pubkey = %pubkey, "key already present");
            return Ok(pubkey);
        }
        let signer: Arc<dyn Signer> = Arc::new(signer);
        let responder = Arc::new(UserResponder::new(
            signer.clone(),
            self.perms.clone(),
            self.approval_base.clone(),
        ));
        keys.insert(
            pubkey.clone(),
            KeyEntry { signer, responder, expires_at },
        );
        drop(keys);
        info!(pubkey = %pubkey, "added key");
        let _ = self.added_tx.send(pubkey.clone());
        Ok(pubkey)
    }

    /// Store a locally issued grant of the given perms (value "1") for
    /// the app on this signer.
    fn grant(&self, signer_pubkey: &str, app_pubkey: &str, perm_names: &[String]) {
        if perm_names.is_empty() {
            return;
        }
        let ts = now();
        let record = serde_json::json!({
            "signer": signer_pubkey,
            "app": app_pubkey,
            "created_at": ts,
            "info_updated_at": ts,
            "perms_updated_at": ts,
            "perms": perm_names.iter().map(|p| serde_json::json!({
                "perm": p, "value": "1", "updated_at": ts
            })).collect::<Vec<_>>(),
        })
        .to_string();
        if let Ok(mut perms) = self.perms.lock() {
            let id = format!("local:{}:{}", signer_pubkey, ts);
            perms.apply_update(&id, &record);
        }
    }

    /// Drop every test key whose time box has elapsed.
    pub fn expire_test_keys(&self, at: u64) -> usize {
        let Ok(mut keys) = self.keys.lock() else {
            return 0;
        };
        let expired: Vec<String> = keys
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|t| t <= at))
            .map(|(pk, _)| pk.clone())
            .collect();
        for pubkey in &expired {
            keys.remove(pubkey);
            info!(pubkey = %pubkey, "expired test key");
        }
        expired.len()
    }
}

impl KeyStore for KeyRegistry {
    fn import(&self, secret_hex: &str) -> RpcResult<String> {
        let signer =
            LocalSigner::from_secret_hex(secret_hex).map_err(|_| RpcError::BadRequest)?;
        self.add_key(signer, None)
    }

    fn connect(&self, secret_hex: &str, perms: &[String]) -> RpcResult<String> {
        let pubkey = self.import(secret_hex)?;
        // the importer holds the key, so the grant is to the key's own
        // pubkey acting as the connecting app
        self.grant(&pubkey, &pubkey, perms);
        Ok(pubkey)
    }

    fn delete(&self, pubkey: &str) -> RpcResult<()> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| RpcError::Transport("registry poisoned".into()))?;
        if keys.remove(pubkey).is_none() {
            return Err(RpcError::UnknownKey);
        }
        info!(pubkey = %pubkey, "deleted key");
        Ok(())
    }

    fn has(&self, pubkey: &str) -> bool {
        self.keys
            .lock()
            .map(|k| k.contains_key(pubkey))
            .unwrap_or(false)
    }

    fn generate_test_key(&self) -> RpcResult<String> {
        self.add_key(LocalSigner::generate(), Some(now() + TEST_KEY_TTL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_perms::{Decision, PermRequest};

    fn registry() -> (Arc<KeyRegistry>, mpsc::UnboundedReceiver<String>, Arc<Mutex<Perms>>) {
        let perms = Arc::new(Mutex::new(Perms::new()));
        let admin = LocalSigner::generate().public_key();
        let (registry, rx) = KeyRegistry::new(perms.clone(), None, admin);
        (registry, rx, perms)
    }

    fn secret() -> (String, String) {
        let sk = k256::schnorr::SigningKey::random(&mut rand::rngs::OsRng);
        (
            hex::encode(sk.to_bytes()),
            hex::encode(sk.verifying_key().to_bytes()),
        )
    }

    #[test]
    fn test_import_registers_and_notifies() {
        let (registry, mut rx, _) = registry();
        let (sk, pk) = secret();
        assert_eq!(registry.import(&sk).unwrap(), pk);
        assert!(registry.has(&pk));
        assert!(registry.responder_for(&pk).is_some());
        assert!(registry.signer_for(&pk).is_some());
        assert_eq!(rx.try_recv().unwrap(), pk);

        // re-import is a no-op and does not notify again
        registry.import(&sk).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.key_count(), 1);
    }

    #[test]
    fn test_admin_entry_has_no_perm_signer() {
        let (registry, _rx, _) = registry();
        let admin = Arc::new(LocalSigner::generate());
        let store: Arc<dyn KeyStore> = registry.clone();
        let responder = Arc::new(warden_rpc::AdminResponder::new(admin.clone(), store));
        registry.insert_admin(admin.clone(), responder);

        let admin_pk = registry.admin_pubkey.clone();
        assert!(registry.responder_for(&admin_pk).is_some());
        assert!(registry.signer_for(&admin_pk).is_none());
    }

    #[test]
    fn test_connect_grants_listed_perms() {
        let (registry, _rx, perms) = registry();
        let (sk, pk) = secret();
        registry
            .connect(&sk, &["basic".to_string()])
            .unwrap();
        let decision = perms.lock().unwrap().check(
            &pk,
            &PermRequest { client_pubkey: &pk, method: "nip44_encrypt", params: &[] },
        );
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn test_delete_and_unknown_key() {
        let (registry, _rx, _) = registry();
        let (sk, pk) = secret();
        registry.import(&sk).unwrap();
        registry.delete(&pk).unwrap();
        assert!(!registry.has(&pk));
        assert!(matches!(registry.delete(&pk), Err(RpcError::UnknownKey)));
    }

    #[test]
    fn test_test_keys_expire() {
        let (registry, _rx, _) = registry();
        let pk = registry.generate_test_key().unwrap();
        assert!(registry.has(&pk));
        // before the box elapses nothing is swept
        assert_eq!(registry.expire_test_keys(now()), 0);
        assert_eq!(registry.expire_test_keys(now() + TEST_KEY_TTL + 1), 1);
        assert!(!registry.has(&pk));
    }
}
