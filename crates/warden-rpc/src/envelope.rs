//! The encrypted request/reply envelope.

use serde::{Deserialize, Serialize};

use crate::error::{RpcError, RpcResult};

/// Reserved `result` value signaling an out-of-band approval redirect;
/// the URL travels in `error`.
pub const AUTH_URL: &str = "auth_url";

/// A decrypted RPC request, bound to the pubkey that sent it.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub client_pubkey: String,
    pub id: String,
    pub method: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error: String,
}

/// Does the payload look like a reply envelope rather than a request?
/// Replies carry `result`/`error` and no `method`; a relay echoes a
/// responder's own replies back when requester and responder share a
/// pubkey, and those must never be answered.
pub fn is_reply(payload: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
        return false;
    };
    value.get("method").is_none()
        && (value.get("result").is_some() || value.get("error").is_some())
}

/// Recover just the correlation id, if the payload carries one.
pub fn recover_id(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let id = value.get("id")?.as_str()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_owned())
    }
}

/// Parse a full request envelope; every field must be present.
pub fn parse_request(client_pubkey: &str, payload: &str) -> RpcResult<RpcRequest> {
    #[derive(Deserialize)]
    struct Wire {
        id: String,
        method: String,
        params: Vec<String>,
    }
    let wire: Wire = serde_json::from_str(payload).map_err(|_| RpcError::BadRequest)?;
    if wire.id.is_empty() || wire.method.is_empty() {
        return Err(RpcError::BadRequest);
    }
    Ok(RpcRequest {
        client_pubkey: client_pubkey.to_owned(),
        id: wire.id,
        method: wire.method,
        params: wire.params,
    })
}

pub fn request_payload(id: &str, method: &str, params: &[String]) -> String {
    serde_json::json!({ "id": id, "method": method, "params": params }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_requires_all_fields() {
        assert!(parse_request("pk", r#"{"id":"1","method":"m","params":[]}"#).is_ok());
        assert!(parse_request("pk", r#"{"id":"","method":"m","params":[]}"#).is_err());
        assert!(parse_request("pk", r#"{"id":"1","params":[]}"#).is_err());
        assert!(parse_request("pk", r#"{"id":"1","method":"m"}"#).is_err());
        assert!(parse_request("pk", "garbage").is_err());
    }

    #[test]
    fn test_reply_shapes_recognized() {
        assert!(is_reply(r#"{"id":"1","result":"pk","error":""}"#));
        assert!(is_reply(r#"{"id":"1","error":"Disallowed"}"#));
        assert!(!is_reply(r#"{"id":"1","method":"ping","params":[]}"#));
        assert!(!is_reply(r#"{"id":"1","params":[]}"#));
        assert!(!is_reply("garbage"));
    }

    #[test]
    fn test_recover_id() {
        assert_eq!(recover_id(r#"{"id":"abc"}"#), Some("abc".to_owned()));
        assert_eq!(recover_id(r#"{"id":""}"#), None);
        assert_eq!(recover_id("nope"), None);
    }

    #[test]
    fn test_payload_roundtrip() {
        let payload = request_payload("7", "sign_event", &["{}".to_owned()]);
        let req = parse_request("pk", &payload).unwrap();
        assert_eq!(req.id, "7");
        assert_eq!(req.method, "sign_event");
        assert_eq!(req.params, vec!["{}"]);
    }
}
