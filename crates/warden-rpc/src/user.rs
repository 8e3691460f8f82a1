//! The per-user signing responder.
//!
//! One `UserResponder` fronts one custodied key on the signer channel.
//! Every method is gated by the shared permission engine; the only
//! hard-coded refusal is signing a permission-storage event, which
//! would let an application grant itself its own permissions.

use std::sync::{Arc, Mutex};

use serde::Deserialize;

use warden_core::kinds::{KIND_PERMS, KIND_SIGNER, PERM_APP_TAG};
use warden_core::{now, EventTemplate, Signer};
use warden_perms::{Decision, PermRequest, Perms};

use crate::envelope::RpcRequest;
use crate::error::{RpcError, RpcResult};
use crate::responder::Responder;

pub struct UserResponder {
    signer: Arc<dyn Signer>,
    perms: Arc<Mutex<Perms>>,
    /// Base URL of the approval surface, e.g. `https://use.example.com`.
    approval_base: Option<String>,
}

/// `sign_event` request payload: a template where everything but the
/// kind may be omitted.
#[derive(Deserialize)]
struct LooseTemplate {
    kind: u32,
    #[serde(default)]
    created_at: Option<u64>,
    #[serde(default)]
    tags: Vec<Vec<String>>,
    #[serde(default)]
    content: String,
}

impl UserResponder {
    pub fn new(
        signer: Arc<dyn Signer>,
        perms: Arc<Mutex<Perms>>,
        approval_base: Option<String>,
    ) -> Self {
        Self {
            signer,
            perms,
            approval_base,
        }
    }

    fn param<'a>(req: &'a RpcRequest, idx: usize) -> RpcResult<&'a str> {
        req.params
            .get(idx)
            .map(String::as_str)
            .ok_or(RpcError::BadRequest)
    }

    fn connect(&self, req: &RpcRequest) -> RpcResult<String> {
        // the optional second param is a secret the caller wants echoed
        match req.params.get(1) {
            Some(secret) if !secret.is_empty() => Ok(secret.clone()),
            _ => Ok("ack".into()),
        }
    }

    fn sign(&self, req: &RpcRequest) -> RpcResult<String> {
        let loose: LooseTemplate =
            serde_json::from_str(Self::param(req, 0)?).map_err(|_| RpcError::BadRequest)?;
        if loose.kind == KIND_PERMS
            && loose
                .tags
                .iter()
                .any(|t| t.len() > 1 && t[0] == "t" && t[1] == PERM_APP_TAG)
        {
            return Err(RpcError::Forbidden);
        }
        let template = EventTemplate {
            created_at: loose.created_at.unwrap_or_else(now),
            kind: loose.kind,
            tags: loose.tags,
            content: loose.content,
        };
        let event = self.signer.sign_event(template)?;
        Ok(serde_json::to_string(&event).map_err(warden_core::CoreError::from)?)
    }
}

impl Responder for UserResponder {
    fn kind(&self) -> u32 {
        KIND_SIGNER
    }

    fn signer(&self) -> &dyn Signer {
        self.signer.as_ref()
    }

    fn check(&self, req: &RpcRequest) -> Decision {
        // possession of the key itself is full authority; the key's
        // own requests need no stored grants
        if req.client_pubkey == self.signer.public_key() {
            return Decision::Allow;
        }
        let perms = match self.perms.lock() {
            Ok(p) => p,
            Err(_) => return Decision::Ignore,
        };
        perms.check(
            &self.signer.public_key(),
            &PermRequest {
                client_pubkey: &req.client_pubkey,
                method: &req.method,
                params: &req.params,
            },
        )
    }

    fn handle(&self, req: &RpcRequest) -> RpcResult<String> {
        match req.method.as_str() {
            "connect" => self.connect(req),
            "get_public_key" => Ok(self.signer.public_key()),
            "sign_event" => self.sign(req),
            "ping" => Ok("pong".into()),
            "nip04_encrypt" => Ok(self
                .signer
                .nip04_encrypt(Self::param(req, 0)?, Self::param(req, 1)?)?),
            "nip04_decrypt" => Ok(self
                .signer
                .nip04_decrypt(Self::param(req, 0)?, Self::param(req, 1)?)?),
            "nip44_encrypt" => Ok(self
                .signer
                .nip44_encrypt(Self::param(req, 0)?, Self::param(req, 1)?)?),
            "nip44_decrypt" => Ok(self
                .signer
                .nip44_decrypt(Self::param(req, 0)?, Self::param(req, 1)?)?),
            _ => Err(RpcError::UnknownMethod),
        }
    }

    fn approval_url(&self, req_id: &str) -> Option<String> {
        let base = self.approval_base.as_deref()?;
        Some(format!(
            "{}/confirm?rid={}&signer={}",
            base.trim_end_matches('/'),
            req_id,
            self.signer.public_key()
        ))
    }
}
