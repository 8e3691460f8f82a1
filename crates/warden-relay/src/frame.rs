//! Wire frames of the relay protocol.
//!
//! Outbound: `["REQ", id, filter]`, `["CLOSE", id]`, `["EVENT", event]`.
//! Inbound: `["EVENT", id, event]`, `["EOSE", id]`,
//! `["CLOSED", id, reason]`, `["NOTICE", text]`,
//! `["OK", event_id, accepted, message]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use warden_core::Event;

use crate::error::{RelayError, RelayResult};

/// Subscription filter. Only the fields this system uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    #[serde(rename = "#t", skip_serializing_if = "Option::is_none")]
    pub t_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Event { sub_id: String, event: Event },
    Eose { sub_id: String },
    Closed { sub_id: String, reason: String },
    Notice { text: String },
    Ok { event_id: String, accepted: bool, message: String },
}

pub fn parse_frame(raw: &str) -> RelayResult<Frame> {
    let cmd: Vec<Value> =
        serde_json::from_str(raw).map_err(|e| RelayError::BadFrame(e.to_string()))?;
    let name = cmd
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::BadFrame("empty message".into()))?;

    let str_at = |i: usize| -> RelayResult<String> {
        cmd.get(i)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RelayError::BadFrame(format!("missing field {i}")))
    };

    match name {
        "EVENT" => {
            let event: Event = serde_json::from_value(
                cmd.get(2)
                    .cloned()
                    .ok_or_else(|| RelayError::BadFrame("EVENT without body".into()))?,
            )
            .map_err(|e| RelayError::BadFrame(e.to_string()))?;
            Ok(Frame::Event { sub_id: str_at(1)?, event })
        }
        "EOSE" => Ok(Frame::Eose { sub_id: str_at(1)? }),
        "CLOSED" => Ok(Frame::Closed {
            sub_id: str_at(1)?,
            reason: str_at(2).unwrap_or_default(),
        }),
        "NOTICE" => Ok(Frame::Notice { text: str_at(1).unwrap_or_default() }),
        "OK" => Ok(Frame::Ok {
            event_id: str_at(1)?,
            accepted: cmd.get(2).and_then(Value::as_bool).unwrap_or(false),
            message: str_at(3).unwrap_or_default(),
        }),
        other => Err(RelayError::BadFrame(format!("unknown frame {other}"))),
    }
}

pub fn req_frame(sub_id: &str, filter: &Filter) -> String {
    serde_json::json!(["REQ", sub_id, filter]).to_string()
}

pub fn close_frame(sub_id: &str) -> String {
    serde_json::json!(["CLOSE", sub_id]).to_string()
}

pub fn publish_frame(event: &Event) -> String {
    serde_json::json!(["EVENT", event]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::{EventTemplate, LocalSigner, Signer};

    fn event() -> Event {
        LocalSigner::generate()
            .sign_event(EventTemplate::new(1, "x", vec![]))
            .unwrap()
    }

    #[test]
    fn test_parse_event_frame() {
        let e = event();
        let raw = serde_json::json!(["EVENT", "sub1", e]).to_string();
        match parse_frame(&raw).unwrap() {
            Frame::Event { sub_id, event } => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(event, e);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_ok_and_closed() {
        let ok = parse_frame(r#"["OK","abcd",true,""]"#).unwrap();
        assert_eq!(
            ok,
            Frame::Ok { event_id: "abcd".into(), accepted: true, message: "".into() }
        );
        let closed = parse_frame(r#"["CLOSED","sub1","auth-required: nope"]"#).unwrap();
        assert_eq!(
            closed,
            Frame::Closed { sub_id: "sub1".into(), reason: "auth-required: nope".into() }
        );
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(parse_frame("{}").is_err());
        assert!(parse_frame("[]").is_err());
        assert!(parse_frame(r#"["WHAT","x"]"#).is_err());
        assert!(parse_frame(r#"["EVENT","sub1"]"#).is_err());
        assert!(parse_frame("not json").is_err());
    }

    #[test]
    fn test_req_frame_omits_empty_fields() {
        let filter = Filter {
            kinds: Some(vec![1]),
            since: Some(100),
            ..Default::default()
        };
        let raw = req_frame("abc", &filter);
        assert_eq!(raw, r#"["REQ","abc",{"kinds":[1],"since":100}]"#);
    }
}
