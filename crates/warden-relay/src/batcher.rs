//! Packs subject pubkeys into bounded-size subscription filters.
//!
//! Keeps the number of live subscriptions proportional to
//! ⌈subjects / batch_size⌉ per scope instead of one per subject. A
//! filter id is reused across additions until it is full; re-issuing a
//! REQ under the same id replaces the previous filter on the relay.

use std::collections::{HashMap, HashSet};

use rand::RngCore;

/// Random 12-char hex identifier for filters and correlation ids.
pub fn random_id() -> String {
    let mut bytes = [0u8; 6];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct SubscriptionBatcher {
    batch_size: usize,
    /// subject -> scopes it was added under
    subject_scopes: HashMap<String, HashSet<String>>,
    /// scope -> filter id -> subjects in that filter
    scope_filters: HashMap<String, HashMap<String, Vec<String>>>,
}

impl SubscriptionBatcher {
    pub fn new(batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        Self {
            batch_size,
            subject_scopes: HashMap::new(),
            scope_filters: HashMap::new(),
        }
    }

    /// Add a subject under a scope (one scope per relay URL).
    ///
    /// Returns the filter id to (re-)issue and the full subject list
    /// now in that filter, or `None` if the subject was already added
    /// under this scope.
    pub fn add(&mut self, subject: &str, scope: &str) -> Option<(String, Vec<String>)> {
        let scopes = self.subject_scopes.entry(subject.to_owned()).or_default();
        if !scopes.insert(scope.to_owned()) {
            return None;
        }

        let filters = self.scope_filters.entry(scope.to_owned()).or_default();
        let id = filters
            .iter()
            .find(|(_, subjects)| subjects.len() < self.batch_size)
            .map(|(id, _)| id.clone())
            .unwrap_or_else(|| {
                let id = random_id();
                filters.insert(id.clone(), Vec::new());
                id
            });
        let subjects = filters.get_mut(&id).expect("filter just ensured");
        subjects.push(subject.to_owned());
        Some((id, subjects.clone()))
    }

    /// Is this subject one we manage (under any scope)?
    pub fn has(&self, subject: &str) -> bool {
        self.subject_scopes.contains_key(subject)
    }
}
