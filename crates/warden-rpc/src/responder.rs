//! The request/decision/reply engine.
//!
//! A `Responder` owns one signing identity and answers encrypted RPC
//! events addressed to it. The flow for every inbound event is fixed:
//! decrypt, parse, run the permission check, then either handle the
//! call, refuse it, redirect the caller to an approval URL, or stay
//! silent. Method dispatch is the only part each responder supplies.

use tracing::{debug, warn};

use warden_core::{Event, EventTemplate, Signer};
use warden_perms::Decision;

use crate::envelope::{self, RpcReply, RpcRequest, AUTH_URL};
use crate::error::RpcResult;

pub trait Responder: Send + Sync {
    /// Event kind this responder listens on.
    fn kind(&self) -> u32;

    fn signer(&self) -> &dyn Signer;

    /// Permission decision for a parsed request.
    fn check(&self, req: &RpcRequest) -> Decision;

    /// Execute an allowed call; the Ok value is the `result` string.
    fn handle(&self, req: &RpcRequest) -> RpcResult<String>;

    /// Where the user can approve a pending request, or None when the
    /// deployment has no approval surface.
    fn approval_url(&self, req_id: &str) -> Option<String>;

    /// Run one inbound event through the full pipeline. Returns the
    /// signed reply event to publish, or None when the event is not
    /// for us, is undecryptable, carries no recoverable id, or the
    /// decision is to ignore the caller.
    fn process(&self, event: &Event) -> Option<Event> {
        if event.kind != self.kind() {
            return None;
        }
        let signer = self.signer();
        if event.p_tag() != Some(signer.public_key().as_str()) {
            return None;
        }

        let payload = match signer.nip44_decrypt(&event.pubkey, &event.content) {
            Ok(p) => p,
            Err(e) => {
                debug!(event = %event.id, error = %e, "undecryptable request");
                return None;
            }
        };

        // With no correlation id there is nothing a reply could be
        // matched against, so the event is dropped outright.
        let reply = match envelope::parse_request(&event.pubkey, &payload) {
            Ok(req) => self.respond(&req)?,
            Err(_) => {
                // when requester and responder are the same pubkey the
                // relay echoes our reply back; answering it would feed
                // an endless error-reply cycle
                if envelope::is_reply(&payload) {
                    debug!(event = %event.id, "reply echo dropped");
                    return None;
                }
                let id = envelope::recover_id(&payload)?;
                warn!(event = %event.id, "malformed request");
                RpcReply {
                    id,
                    error: "invalid request".into(),
                    ..Default::default()
                }
            }
        };

        self.seal(&event.pubkey, &reply)
    }

    /// Decide and handle one parsed request.
    fn respond(&self, req: &RpcRequest) -> Option<RpcReply> {
        let decision = self.check(req);
        debug!(
            method = %req.method,
            client = %req.client_pubkey,
            decision = %decision,
            "request"
        );
        match decision {
            Decision::Ignore => None,
            Decision::Disallow => Some(RpcReply {
                id: req.id.clone(),
                error: "Disallowed".into(),
                ..Default::default()
            }),
            Decision::Ask => {
                let url = self.approval_url(&req.id)?;
                Some(RpcReply {
                    id: req.id.clone(),
                    result: AUTH_URL.into(),
                    error: url,
                })
            }
            Decision::Allow => Some(match self.handle(req) {
                Ok(result) => RpcReply {
                    id: req.id.clone(),
                    result,
                    ..Default::default()
                },
                Err(e) => RpcReply {
                    id: req.id.clone(),
                    error: e.to_string(),
                    ..Default::default()
                },
            }),
        }
    }

    /// Encrypt, tag and sign a reply back to the requester.
    fn seal(&self, recipient: &str, reply: &RpcReply) -> Option<Event> {
        let signer = self.signer();
        let body = match serde_json::to_string(reply) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "unserializable reply");
                return None;
            }
        };
        let content = match signer.nip44_encrypt(recipient, &body) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "reply encryption failed");
                return None;
            }
        };
        let template = EventTemplate::new(
            self.kind(),
            content,
            vec![vec!["p".into(), recipient.into()]],
        );
        match signer.sign_event(template) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "reply signing failed");
                None
            }
        }
    }
}
