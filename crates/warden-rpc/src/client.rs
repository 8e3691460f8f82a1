//! The caller role.
//!
//! An `RpcClient` sends encrypted requests to one remote responder
//! pubkey and matches replies by correlation id. Outstanding calls
//! live in an explicit deadline table swept by one background task;
//! there is no per-call wall-clock timer, so a call either resolves
//! through its oneshot or expires at its recorded deadline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use warden_core::{now, Event, EventTemplate, Signer};
use warden_relay::batcher::random_id;
use warden_relay::{Filter, Relay, SubMode, SubUpdate};

use crate::envelope::{self, RpcReply, AUTH_URL};
use crate::error::{RpcError, RpcResult};

/// Default wait for a reply before the pending call expires.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// PendingTable — outstanding calls keyed by correlation id
// ---------------------------------------------------------------------------

struct PendingCall {
    deadline: Instant,
    tx: oneshot::Sender<RpcResult<String>>,
}

#[derive(Default)]
struct PendingTable {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingTable {
    fn register(
        &self,
        id: String,
        deadline: Instant,
    ) -> RpcResult<oneshot::Receiver<RpcResult<String>>> {
        let (tx, rx) = oneshot::channel();
        let mut calls = self
            .calls
            .lock()
            .map_err(|_| RpcError::Transport("pending table poisoned".into()))?;
        calls.insert(id, PendingCall { deadline, tx });
        Ok(rx)
    }

    /// Resolve one call; false when the id is unknown or expired.
    fn resolve(&self, id: &str, outcome: RpcResult<String>) -> bool {
        let Ok(mut calls) = self.calls.lock() else {
            return false;
        };
        match calls.remove(id) {
            Some(call) => {
                let _ = call.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    fn forget(&self, id: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.remove(id);
        }
    }

    /// Expire every call whose deadline has passed.
    fn sweep(&self, at: Instant) -> usize {
        let Ok(mut calls) = self.calls.lock() else {
            return 0;
        };
        let expired: Vec<String> = calls
            .iter()
            .filter(|(_, call)| call.deadline <= at)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(call) = calls.remove(id) {
                let _ = call.tx.send(Err(RpcError::Timeout));
            }
        }
        expired.len()
    }
}

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

pub struct RpcClient {
    relay: Relay,
    signer: Arc<dyn Signer>,
    remote_pubkey: String,
    kind: u32,
    timeout: Duration,
    pending: Arc<PendingTable>,
    sub_id: String,
    /// Dropped with the client; ends the reader and sweeper tasks.
    shutdown: watch::Sender<()>,
}

impl RpcClient {
    /// Subscribe to replies from the remote responder and start the
    /// deadline sweeper.
    pub fn start(relay: Relay, signer: Arc<dyn Signer>, remote_pubkey: &str, kind: u32) -> Self {
        Self::start_with_timeout(relay, signer, remote_pubkey, kind, CALL_TIMEOUT)
    }

    pub fn start_with_timeout(
        relay: Relay,
        signer: Arc<dyn Signer>,
        remote_pubkey: &str,
        kind: u32,
        timeout: Duration,
    ) -> Self {
        let pending = Arc::new(PendingTable::default());
        let sub_id = random_id();
        let filter = Filter {
            kinds: Some(vec![kind]),
            authors: Some(vec![remote_pubkey.to_owned()]),
            p_tags: Some(vec![signer.public_key()]),
            since: Some(now().saturating_sub(10)),
            ..Default::default()
        };
        let replies = relay.subscribe(&sub_id, filter, SubMode::Watch);
        let (shutdown, _) = watch::channel(());
        let client = Self {
            relay,
            signer,
            remote_pubkey: remote_pubkey.to_owned(),
            kind,
            timeout,
            pending,
            sub_id,
            shutdown,
        };
        client.spawn_reader(replies);
        client.spawn_sweeper();
        client
    }

    fn spawn_reader(&self, mut replies: tokio::sync::mpsc::UnboundedReceiver<SubUpdate>) {
        let pending = self.pending.clone();
        let signer = self.signer.clone();
        let remote = self.remote_pubkey.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = replies.recv() => match update {
                        Some(SubUpdate::Event(event)) => {
                            Self::on_reply(&pending, signer.as_ref(), &remote, &event)
                        }
                        Some(SubUpdate::Eose) => {}
                        Some(SubUpdate::Closed(reason)) => {
                            warn!(reason = %reason, "reply subscription closed");
                            return;
                        }
                        None => return,
                    },
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    fn spawn_sweeper(&self) {
        let pending = self.pending.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    at = tick.tick() => {
                        let expired = pending.sweep(at);
                        if expired > 0 {
                            debug!(expired, "expired pending calls");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    fn on_reply(pending: &PendingTable, signer: &dyn Signer, remote: &str, event: &Event) {
        if event.pubkey != remote {
            return;
        }
        let body = match signer.nip44_decrypt(remote, &event.content) {
            Ok(b) => b,
            Err(e) => {
                debug!(event = %event.id, error = %e, "undecryptable reply");
                return;
            }
        };
        let reply: RpcReply = match serde_json::from_str(&body) {
            Ok(r) => r,
            Err(e) => {
                debug!(event = %event.id, error = %e, "malformed reply");
                return;
            }
        };
        // approval redirect: the call stays pending until the user
        // acts and the real reply arrives (or the deadline passes)
        if reply.result == AUTH_URL {
            info!(id = %reply.id, url = %reply.error, "approval required");
            return;
        }
        let outcome = if reply.error.is_empty() {
            Ok(reply.result)
        } else {
            Err(RpcError::Method(reply.error))
        };
        if !pending.resolve(&reply.id, outcome) {
            debug!(id = %reply.id, "reply for unknown call");
        }
    }

    /// Issue one call and wait for its reply or deadline.
    pub async fn call(&self, method: &str, params: &[String]) -> RpcResult<String> {
        let id = random_id();
        let payload = envelope::request_payload(&id, method, params);
        let content = self.signer.nip44_encrypt(&self.remote_pubkey, &payload)?;
        let event = self.signer.sign_event(EventTemplate::new(
            self.kind,
            content,
            vec![vec!["p".into(), self.remote_pubkey.clone()]],
        ))?;

        let rx = self
            .pending
            .register(id.clone(), Instant::now() + self.timeout)?;
        if let Err(e) = self.relay.publish(event).await {
            self.pending.forget(&id);
            return Err(e.into());
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    pub fn stop(&self) {
        self.relay.close(&self.sub_id);
    }
}
