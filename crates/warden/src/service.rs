//! Service startup and the parent handshake.
//!
//! The parent process is the only collaborator reachable before any
//! relay: it hands over the build and instance records in exchange for
//! our attestation. In production the records are verified against the
//! local measurements before anything else starts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use warden_attest::{require_prod, verify_build, verify_instance, Announcer, AttestationDoc, ANNOUNCE_INTERVAL};
use warden_core::{AttestationSource, CoreError, CoreResult, Event, LocalSigner, NoAttestation, Signer};
use warden_perms::Perms;
use warden_relay::Relay;
use warden_rpc::{AdminResponder, KeyStore, RpcReply};

use crate::config::Config;
use crate::error::{WardenError, WardenResult};
use crate::listeners::{PermListener, RequestListener};
use crate::registry::KeyRegistry;

const PARENT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const PARENT_RETRY_PAUSE: Duration = Duration::from_secs(3);

/// Sweep cadence for expired test keys.
const EXPIRY_SWEEP: Duration = Duration::from_secs(60);

/// What the parent hands over at startup.
#[derive(Debug, Clone, Default)]
pub struct ParentInfo {
    pub build: Option<Event>,
    pub instance: Option<Event>,
    pub announce_relays: Vec<String>,
}

#[derive(Deserialize)]
struct ParentInfoWire {
    build: Event,
    instance: Event,
    #[serde(rename = "instanceAnnounceRelays", default)]
    instance_announce_relays: Vec<String>,
}

/// File-backed attestation for platforms where the measurement device
/// is exposed as a document dropped by the launcher.
pub struct FileAttestation {
    path: std::path::PathBuf,
}

impl FileAttestation {
    pub fn new(path: std::path::PathBuf) -> Self {
        Self { path }
    }
}

impl AttestationSource for FileAttestation {
    fn attest(&self, _public_key: Option<&[u8]>) -> CoreResult<Vec<u8>> {
        std::fs::read(&self.path).map_err(|e| CoreError::Attestation(e.to_string()))
    }
}

/// One handshake attempt; `Ok(None)` means the parent went quiet and
/// the caller should retry.
async fn parent_round(parent_url: &str, att_b64: &str) -> WardenResult<Option<ParentInfoWire>> {
    let (mut ws, _) = connect_async(parent_url)
        .await
        .map_err(|e| WardenError::Parent(e.to_string()))?;
    let request = serde_json::json!({
        "id": "start",
        "method": "start",
        "params": [att_b64],
    })
    .to_string();
    ws.send(Message::Text(request))
        .await
        .map_err(|e| WardenError::Parent(e.to_string()))?;

    let reply = tokio::time::timeout(PARENT_REPLY_TIMEOUT, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(raw)) => return Some(raw),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    })
    .await;

    let Ok(Some(raw)) = reply else {
        return Ok(None); // timeout or closed socket, retry
    };
    let reply: RpcReply =
        serde_json::from_str(&raw).map_err(|e| WardenError::Parent(e.to_string()))?;
    if reply.id != "start" {
        return Err(WardenError::Parent("bad reply id".into()));
    }
    if !reply.error.is_empty() {
        return Err(WardenError::Parent(reply.error));
    }
    let info: ParentInfoWire =
        serde_json::from_str(&reply.result).map_err(|e| WardenError::Parent(e.to_string()))?;
    Ok(Some(info))
}

/// Fetch build and instance records from the parent, verifying them
/// against our own attestation when the platform is measured. Retries
/// until the parent answers.
pub async fn get_info(
    parent_url: &str,
    source: &dyn AttestationSource,
) -> WardenResult<ParentInfo> {
    let raw = source.attest(None)?;
    if raw.is_empty() {
        // unmeasured platform: nothing to prove, nothing to verify
        info!("no attestation, skipping parent handshake");
        return Ok(ParentInfo::default());
    }
    let doc = AttestationDoc::parse(&raw)?;
    let att_b64 = B64.encode(&raw);

    loop {
        match parent_round(parent_url, &att_b64).await {
            Ok(Some(wire)) => {
                if !doc.is_debug() {
                    verify_build(&doc, &wire.build)?;
                    verify_instance(&doc, &wire.instance)?;
                }
                info!(build = %wire.build.id, instance = %wire.instance.id, "got parent records");
                return Ok(ParentInfo {
                    build: Some(wire.build),
                    instance: Some(wire.instance),
                    announce_relays: wire.instance_announce_relays,
                });
            }
            Ok(None) => {
                info!("parent not answering, will retry");
            }
            Err(e) => {
                warn!(error = %e, "parent handshake attempt failed");
            }
        }
        tokio::time::sleep(PARENT_RETRY_PAUSE).await;
    }
}

/// Assemble everything and serve until shutdown.
pub async fn run(config: Config) -> WardenResult<()> {
    let source: Arc<dyn AttestationSource> = match &config.attestation_doc {
        Some(path) => Arc::new(FileAttestation::new(path.clone())),
        None => Arc::new(NoAttestation),
    };

    let parent = get_info(&config.parent_url, source.as_ref()).await?;
    if config.production {
        let build = parent
            .build
            .as_ref()
            .ok_or_else(|| WardenError::Config("production requires a build record".into()))?;
        require_prod(build, "build")?;
        let instance = parent
            .instance
            .as_ref()
            .ok_or_else(|| WardenError::Config("production requires an instance record".into()))?;
        require_prod(instance, "instance")?;
    }

    // fresh admin identity on every start
    let admin: Arc<dyn Signer> = Arc::new(LocalSigner::generate());
    let admin_pubkey = admin.public_key();
    info!(admin = %admin_pubkey, "admin key generated");

    let perms = Arc::new(Mutex::new(Perms::new()));
    let (registry, mut added_rx) =
        KeyRegistry::new(perms.clone(), config.approval_base.clone(), admin_pubkey.clone());
    let store: Arc<dyn KeyStore> = registry.clone();
    registry.insert_admin(
        admin.clone(),
        Arc::new(AdminResponder::new(admin.clone(), store)),
    );

    let inbox = Relay::connect(&config.inbox_relay_url);
    let perm_relays: Vec<Relay> = config.perm_relays.iter().map(|u| Relay::connect(u)).collect();

    let request_listener = RequestListener::new(inbox.clone(), registry.clone(), config.batch_size);
    let perm_listener = PermListener::new(
        perm_relays,
        registry.clone(),
        perms.clone(),
        config.batch_size,
    );

    // the admin channel is served but its perms are never tracked
    request_listener.add_pubkey(&admin_pubkey);

    // wire every imported key into both listeners
    {
        let request_listener = request_listener.clone();
        let perm_listener = perm_listener.clone();
        tokio::spawn(async move {
            while let Some(pubkey) = added_rx.recv().await {
                request_listener.add_pubkey(&pubkey);
                perm_listener.add_pubkey(&pubkey);
            }
        });
    }

    // test keys are time-boxed
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EXPIRY_SWEEP);
            loop {
                tick.tick().await;
                registry.expire_test_keys(warden_core::now());
            }
        });
    }

    let announce_relays = if parent.announce_relays.is_empty() {
        config.announce_relays.clone()
    } else {
        parent.announce_relays.clone()
    };
    let announcer = Announcer {
        signer: admin,
        source,
        repo: config.repo.clone(),
        name: env!("CARGO_PKG_NAME").to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        inbox_relay_url: config.inbox_relay_url.clone(),
        announce_relays,
        build: parent.build,
        instance: parent.instance,
        production: config.production,
        interval: ANNOUNCE_INTERVAL,
    };
    tokio::spawn(announcer.run());

    info!(relay = %config.inbox_relay_url, "warden serving");
    tokio::signal::ctrl_c()
        .await
        .map_err(WardenError::Io)?;
    info!("shutting down");
    inbox.dispose();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn record(tags: Vec<Vec<String>>) -> Event {
        LocalSigner::generate()
            .sign_event(warden_core::EventTemplate::new(1, "", tags))
            .unwrap()
    }

    struct FixedDoc(Vec<u8>);

    impl AttestationSource for FixedDoc {
        fn attest(&self, _pk: Option<&[u8]>) -> CoreResult<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    fn debug_doc() -> Vec<u8> {
        use ciborium::value::Value;
        let payload_map = Value::Map(vec![
            (Value::Text("module_id".into()), Value::Text("i-test".into())),
            (
                Value::Text("pcrs".into()),
                Value::Map(vec![(
                    Value::Integer(0.into()),
                    Value::Bytes(vec![0u8; 48]),
                )]),
            ),
        ]);
        let mut payload = Vec::new();
        ciborium::ser::into_writer(&payload_map, &mut payload).unwrap();
        let cose = Value::Array(vec![
            Value::Bytes(vec![]),
            Value::Map(vec![]),
            Value::Bytes(payload),
            Value::Bytes(vec![]),
        ]);
        let mut raw = Vec::new();
        ciborium::ser::into_writer(&cose, &mut raw).unwrap();
        raw
    }

    #[tokio::test]
    async fn test_no_attestation_skips_handshake() {
        // no parent is listening anywhere; this must not try to connect
        let info = get_info("ws://127.0.0.1:1", &NoAttestation).await.unwrap();
        assert!(info.build.is_none());
        assert!(info.instance.is_none());
    }

    #[tokio::test]
    async fn test_handshake_returns_parent_records() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let build = record(vec![vec!["t".into(), "dev".into()]]);
        let instance = record(vec![]);
        let result = serde_json::json!({
            "build": build.clone(),
            "instance": instance.clone(),
            "instanceAnnounceRelays": ["wss://a.example"],
        })
        .to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let msg = ws.next().await.unwrap().unwrap();
            let req: serde_json::Value =
                serde_json::from_str(msg.to_text().unwrap()).unwrap();
            assert_eq!(req["method"], "start");
            assert!(req["params"][0].as_str().unwrap().len() > 10);
            ws.send(Message::Text(
                serde_json::json!({"id": "start", "result": result, "error": ""}).to_string(),
            ))
            .await
            .unwrap();
        });

        // debug doc: the records are accepted without chain checks
        let source = FixedDoc(debug_doc());
        let info = get_info(&url, &source).await.unwrap();
        assert_eq!(info.build.unwrap().id, build.id);
        assert_eq!(info.instance.unwrap().id, instance.id);
        assert_eq!(info.announce_relays, vec!["wss://a.example"]);
    }

    #[tokio::test]
    async fn test_parent_error_reply_is_retried_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let build = record(vec![]);
        let instance = record(vec![]);
        let result = serde_json::json!({"build": build, "instance": instance}).to_string();

        tokio::spawn(async move {
            // first round: an error reply
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            ws.send(Message::Text(
                serde_json::json!({"id": "start", "result": "", "error": "not ready"})
                    .to_string(),
            ))
            .await
            .unwrap();
            drop(ws);

            // second round succeeds
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            ws.send(Message::Text(
                serde_json::json!({"id": "start", "result": result, "error": ""}).to_string(),
            ))
            .await
            .unwrap();
        });

        let source = FixedDoc(debug_doc());
        let info = tokio::time::timeout(Duration::from_secs(30), get_info(&url, &source))
            .await
            .unwrap()
            .unwrap();
        assert!(info.build.is_some());
    }
}
