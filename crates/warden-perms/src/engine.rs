//! Merge and decision algorithms.
//!
//! Merge invariant: app info and the perm list are versioned
//! independently and merged independently, so a stale info update can
//! never roll back a newer perm list, and vice versa. The final state
//! depends only on the maximum info version and the maximum perm-list
//! version seen, which makes the merge order-independent.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::types::{App, Decision, MergeOutcome, Perm, PermRecord, PermRequest};

/// Grants implicitly covered by a stored `basic` package perm:
/// low-risk methods and a fixed set of signing kinds.
const BASIC_PACKAGE: &[&str] = &[
    "connect",
    "get_public_key",
    "nip04_decrypt",
    "nip04_encrypt",
    "nip44_decrypt",
    "nip44_encrypt",
    "sign_event:0",
    "sign_event:1",
    "sign_event:3",
    "sign_event:6",
    "sign_event:7",
    "sign_event:9734",
    "sign_event:10002",
    "sign_event:30023",
    "sign_event:10000",
    "sign_event:27235",
];

#[derive(Default)]
pub struct Perms {
    /// (signer pubkey, app pubkey) -> state
    apps: HashMap<(String, String), App>,
    /// Processed event ids; the same update is applied at most once.
    seen: HashSet<String>,
}

impl Perms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one peer-supplied permission update, keyed by event id.
    pub fn apply_update(&mut self, event_id: &str, payload: &str) -> MergeOutcome {
        if !self.seen.insert(event_id.to_owned()) {
            return MergeOutcome::Duplicate;
        }
        let record: PermRecord = match serde_json::from_str(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(event = %event_id, error = %e, "bad perm record");
                return MergeOutcome::Invalid;
            }
        };
        if !record.is_valid() {
            warn!(event = %event_id, "dropping invalid perm record");
            return MergeOutcome::Invalid;
        }
        self.merge(record);
        MergeOutcome::Applied
    }

    fn merge(&mut self, record: PermRecord) {
        let id = (record.signer.clone(), record.app.clone());
        let existing = self.apps.get(&id);
        let new_info = existing.map_or(true, |a| a.info_updated_at < record.info_updated_at);
        let new_perms = existing.map_or(true, |a| a.perms_updated_at < record.perms_updated_at);

        match existing {
            None if record.deleted => {
                debug!(signer = %record.signer, app = %record.app, "already deleted");
                return;
            }
            None => {
                debug!(signer = %record.signer, app = %record.app, "new app");
                self.apps.insert(
                    id.clone(),
                    App {
                        created_at: record.created_at,
                        info_updated_at: record.info_updated_at,
                        perms_updated_at: 0,
                        perms: Vec::new(),
                    },
                );
            }
            Some(_) if new_info => {
                if record.deleted {
                    debug!(signer = %record.signer, app = %record.app, "deleted app");
                    self.apps.remove(&id);
                    return;
                }
                let app = self.apps.get_mut(&id).expect("checked above");
                app.info_updated_at = record.info_updated_at;
            }
            Some(_) => {
                debug!(signer = %record.signer, app = %record.app, "stale app info");
            }
        }

        let app = self.apps.get_mut(&id).expect("present unless deleted");

        // oldest creation timestamp wins, so re-delivery of an old
        // creation record cannot forget true history
        if record.created_at > 0 {
            app.created_at = app.created_at.min(record.created_at);
        }

        // full-list replacement, never a per-entry merge
        if new_perms && !record.deleted {
            app.perms = record
                .perms
                .into_iter()
                .map(|p| Perm {
                    name: p.perm,
                    value: p.value,
                    updated_at: p.updated_at,
                })
                .collect();
            app.perms_updated_at = record.perms_updated_at;
        }
    }

    /// The permission string a request maps to: the method name, or
    /// `sign_event:{kind}` when the kind is recoverable.
    fn request_perm(req: &PermRequest<'_>) -> String {
        if req.method == "sign_event" {
            if let Some(kind) = req
                .params
                .first()
                .and_then(|p| serde_json::from_str::<serde_json::Value>(p).ok())
                .and_then(|v| v.get("kind").and_then(|k| k.as_u64()))
            {
                return format!("sign_event:{kind}");
            }
        }
        req.method.to_owned()
    }

    fn is_package_perm(stored: &str, requested: &str) -> bool {
        stored == "basic" && BASIC_PACKAGE.contains(&requested)
    }

    /// Decide one request. Pure over the currently stored perms.
    pub fn check(&self, signer_pubkey: &str, req: &PermRequest<'_>) -> Decision {
        let requested = Self::request_perm(req);
        let id = (signer_pubkey.to_owned(), req.client_pubkey.to_owned());
        let perms = match self.apps.get(&id) {
            Some(app) if !app.perms.is_empty() => &app.perms,
            // nothing stored: the user has to be asked
            _ => return Decision::Ask,
        };

        let matched = perms
            .iter()
            .find(|p| p.name == requested)
            .or_else(|| perms.iter().find(|p| Self::is_package_perm(&p.name, &requested)));

        if let Some(perm) = matched {
            debug!(perm = %perm.name, value = %perm.value, requested = %requested, "perm matched");
            // a blocked app gets silence on connect, not a refusal
            if perm.name == "connect" && perm.value == "0" {
                return Decision::Ignore;
            }
            return if perm.value == "1" {
                Decision::Allow
            } else {
                Decision::Disallow
            };
        }

        // an explicitly blocked app is ignored across the board
        if perms.iter().any(|p| p.name == "connect" && p.value == "0") {
            debug!(requested = %requested, "ignored by denied connect");
            return Decision::Ignore;
        }

        Decision::Ask
    }

    /// Number of apps currently tracked (all signers).
    pub fn app_count(&self) -> usize {
        self.apps.len()
    }
}
