//! Inbox and permission listeners.
//!
//! Both listeners batch pubkeys into shared subscriptions so the
//! relay-side filter count stays bounded as keys are imported. The
//! request listener serves the signer and admin channels on the inbox
//! relay; the perm listener tracks permission-storage events for each
//! custodied key across the perm relay set.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use warden_core::kinds::{KIND_ADMIN, KIND_PERMS, KIND_SIGNER, PERM_APP_TAG};
use warden_core::{now, Event};
use warden_perms::Perms;
use warden_relay::{Filter, Relay, SubMode, SubUpdate, SubscriptionBatcher};

use crate::registry::KeyRegistry;

/// Cap on the one-shot backlog fetch per key.
const PERM_FETCH_LIMIT: u32 = 100;

// ---------------------------------------------------------------------------
// RequestListener — signer + admin channels on the inbox relay
// ---------------------------------------------------------------------------

pub struct RequestListener {
    relay: Relay,
    registry: Arc<KeyRegistry>,
    batcher: Mutex<SubscriptionBatcher>,
}

impl RequestListener {
    pub fn new(relay: Relay, registry: Arc<KeyRegistry>, batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            relay,
            registry,
            batcher: Mutex::new(SubscriptionBatcher::new(batch_size)),
        })
    }

    /// Watch requests addressed to one more pubkey.
    pub fn add_pubkey(self: &Arc<Self>, pubkey: &str) {
        let batch = {
            let Ok(mut batcher) = self.batcher.lock() else {
                return;
            };
            batcher.add(pubkey, self.relay.url())
        };
        let Some((id, pubkeys)) = batch else {
            return; // already watched
        };
        let filter = Filter {
            kinds: Some(vec![KIND_SIGNER, KIND_ADMIN]),
            p_tags: Some(pubkeys),
            since: Some(now().saturating_sub(10)),
            ..Default::default()
        };
        let mut rx = self.relay.subscribe(&id, filter, SubMode::Watch);
        let listener = self.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                match update {
                    SubUpdate::Event(event) => listener.dispatch(event).await,
                    SubUpdate::Eose => {}
                    SubUpdate::Closed(reason) => {
                        warn!(sub = %id, reason = %reason, "request subscription closed");
                        return;
                    }
                }
            }
        });
    }

    async fn dispatch(&self, event: Event) {
        let Some(target) = event.p_tag().map(str::to_owned) else {
            return;
        };
        let Some(responder) = self.registry.responder_for(&target) else {
            debug!(pubkey = %target, "request for unknown key");
            return;
        };
        let Some(reply) = responder.process(&event) else {
            return; // ignored
        };
        if let Err(e) = self.relay.publish(reply).await {
            warn!(error = %e, "failed to publish reply");
        }
    }
}

// ---------------------------------------------------------------------------
// PermListener — permission-storage events on the perm relays
// ---------------------------------------------------------------------------

pub struct PermListener {
    relays: Vec<Relay>,
    registry: Arc<KeyRegistry>,
    perms: Arc<Mutex<Perms>>,
    batcher: Mutex<SubscriptionBatcher>,
}

impl PermListener {
    pub fn new(
        relays: Vec<Relay>,
        registry: Arc<KeyRegistry>,
        perms: Arc<Mutex<Perms>>,
        batch_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            relays,
            registry,
            perms,
            batcher: Mutex::new(SubscriptionBatcher::new(batch_size)),
        })
    }

    /// Track the permission events a key publishes about its apps:
    /// one bounded backlog fetch, plus membership in the shared watch
    /// subscription, on every perm relay.
    pub fn add_pubkey(self: &Arc<Self>, pubkey: &str) {
        for relay in &self.relays {
            let fetch_id = format!("fetch:{}", &pubkey[..pubkey.len().min(6)]);
            let fetch = Filter {
                kinds: Some(vec![KIND_PERMS]),
                authors: Some(vec![pubkey.to_owned()]),
                t_tags: Some(vec![PERM_APP_TAG.to_owned()]),
                limit: Some(PERM_FETCH_LIMIT),
                ..Default::default()
            };
            self.consume(relay.subscribe(&fetch_id, fetch, SubMode::Fetch));

            let batch = {
                let Ok(mut batcher) = self.batcher.lock() else {
                    return;
                };
                batcher.add(pubkey, relay.url())
            };
            if let Some((id, pubkeys)) = batch {
                let watch = Filter {
                    kinds: Some(vec![KIND_PERMS]),
                    authors: Some(pubkeys),
                    t_tags: Some(vec![PERM_APP_TAG.to_owned()]),
                    since: Some(now().saturating_sub(10)),
                    ..Default::default()
                };
                self.consume(relay.subscribe(&id, watch, SubMode::Watch));
            }
        }
    }

    fn consume(self: &Arc<Self>, mut rx: tokio::sync::mpsc::UnboundedReceiver<SubUpdate>) {
        let listener = self.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let SubUpdate::Event(event) = update {
                    listener.on_perm_event(&event);
                }
            }
        });
    }

    /// Decrypt a key's own permission record and merge it. Events for
    /// keys we do not custody are dropped.
    fn on_perm_event(&self, event: &Event) {
        let Some(signer) = self.registry.signer_for(&event.pubkey) else {
            debug!(pubkey = %event.pubkey, "perm event for unknown key");
            return;
        };
        let payload = match signer.nip04_decrypt(&event.pubkey, &event.content) {
            Ok(p) => p,
            Err(e) => {
                warn!(event = %event.id, error = %e, "undecryptable perm event");
                return;
            }
        };
        if let Ok(mut perms) = self.perms.lock() {
            perms.apply_update(&event.id, &payload);
        }
    }
}
