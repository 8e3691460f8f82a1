//! Caller-to-responder flow over an in-process fake relay.
//!
//! The test plays the relay: it accepts the caller's REQ and EVENT
//! frames, feeds each published request through a real responder, and
//! delivers the responder's reply on the caller's subscription.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use warden_core::kinds::KIND_SIGNER;
use warden_core::{Event, LocalSigner, Signer};
use warden_perms::Perms;
use warden_relay::Relay;
use warden_rpc::{Responder, RpcClient, RpcError, UserResponder};

type ServerWs = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn next_text(ws: &mut ServerWs) -> String {
    loop {
        match ws.next().await.expect("socket closed").unwrap() {
            Message::Text(t) => return t,
            _ => continue,
        }
    }
}

/// Read frames until an EVENT publish arrives; ack it and return the
/// event together with the caller's subscription id.
async fn next_published(ws: &mut ServerWs, sub_id: &mut Option<String>) -> Event {
    loop {
        let raw = next_text(ws).await;
        let frame: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        match frame[0].as_str().unwrap() {
            "REQ" => *sub_id = Some(frame[1].as_str().unwrap().to_owned()),
            "EVENT" => {
                let event: Event = serde_json::from_value(frame[1].clone()).unwrap();
                ws.send(Message::Text(
                    serde_json::json!(["OK", event.id, true, ""]).to_string(),
                ))
                .await
                .unwrap();
                return event;
            }
            _ => {}
        }
    }
}

async fn deliver(ws: &mut ServerWs, sub_id: &str, event: &Event) {
    ws.send(Message::Text(
        serde_json::json!(["EVENT", sub_id, event]).to_string(),
    ))
    .await
    .unwrap();
}

fn grant_all(perms: &mut Perms, signer: &str, app: &str) {
    let record = serde_json::json!({
        "signer": signer,
        "app": app,
        "created_at": 1,
        "info_updated_at": 1,
        "perms_updated_at": 1,
        "perms": [{"perm": "basic", "value": "1", "updated_at": 1}],
    })
    .to_string();
    perms.apply_update("grant", &record);
}

#[tokio::test]
async fn call_roundtrip_through_responder() {
    let (listener, url) = bind().await;

    let user_key: Arc<dyn Signer> = Arc::new(LocalSigner::generate());
    let app_key: Arc<dyn Signer> = Arc::new(LocalSigner::generate());
    let mut perms = Perms::new();
    grant_all(&mut perms, &user_key.public_key(), &app_key.public_key());
    let responder = UserResponder::new(user_key.clone(), Arc::new(Mutex::new(perms)), None);

    let relay = Relay::connect(&url);
    let client = RpcClient::start(relay.clone(), app_key, &user_key.public_key(), KIND_SIGNER);

    let mut ws = tokio_tungstenite::accept_async(listener.accept().await.unwrap().0)
        .await
        .unwrap();

    let call = tokio::spawn(async move { client.call("get_public_key", &[]).await });

    let mut sub_id = None;
    let request = next_published(&mut ws, &mut sub_id).await;
    assert_eq!(request.kind, KIND_SIGNER);
    let reply = responder.process(&request).expect("responder must reply");
    deliver(&mut ws, sub_id.as_deref().unwrap(), &reply).await;

    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result, user_key.public_key());
    relay.dispose();
}

#[tokio::test]
async fn disallowed_call_surfaces_the_refusal() {
    let (listener, url) = bind().await;

    let user_key: Arc<dyn Signer> = Arc::new(LocalSigner::generate());
    let app_key: Arc<dyn Signer> = Arc::new(LocalSigner::generate());
    let mut perms = Perms::new();
    let record = serde_json::json!({
        "signer": user_key.public_key(),
        "app": app_key.public_key(),
        "created_at": 1,
        "info_updated_at": 1,
        "perms_updated_at": 1,
        "perms": [{"perm": "get_public_key", "value": "0", "updated_at": 1}],
    })
    .to_string();
    perms.apply_update("grant", &record);
    let responder = UserResponder::new(user_key.clone(), Arc::new(Mutex::new(perms)), None);

    let relay = Relay::connect(&url);
    let client = RpcClient::start(relay.clone(), app_key, &user_key.public_key(), KIND_SIGNER);

    let mut ws = tokio_tungstenite::accept_async(listener.accept().await.unwrap().0)
        .await
        .unwrap();

    let call = tokio::spawn(async move { client.call("get_public_key", &[]).await });

    let mut sub_id = None;
    let request = next_published(&mut ws, &mut sub_id).await;
    let reply = responder.process(&request).expect("refusal is still a reply");
    deliver(&mut ws, sub_id.as_deref().unwrap(), &reply).await;

    match tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap()
    {
        Err(RpcError::Method(msg)) => assert_eq!(msg, "Disallowed"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    relay.dispose();
}

#[tokio::test]
async fn unanswered_call_expires_at_its_deadline() {
    let (listener, url) = bind().await;

    let user_key: Arc<dyn Signer> = Arc::new(LocalSigner::generate());
    let app_key: Arc<dyn Signer> = Arc::new(LocalSigner::generate());

    let relay = Relay::connect(&url);
    let client = RpcClient::start_with_timeout(
        relay.clone(),
        app_key,
        &user_key.public_key(),
        KIND_SIGNER,
        Duration::from_millis(500),
    );

    let mut ws = tokio_tungstenite::accept_async(listener.accept().await.unwrap().0)
        .await
        .unwrap();

    let call = tokio::spawn(async move { client.call("ping", &[]).await });

    // ack the publish but never answer
    let mut sub_id = None;
    next_published(&mut ws, &mut sub_id).await;

    match tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap()
    {
        Err(RpcError::Timeout) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    relay.dispose();
}
