//! JSON hub protocol.
//!
//! Messages are objects with an integer `type` field, each followed by the
//! record separator.

use serde_json::{Map, Value, json};

use crate::constants::kind;
use crate::framing::TextFraming;
use crate::messages::{
    CloseMessage, CompletionMessage, CompletionOutcome, HubMessage, InvocationMessage,
};
use crate::ProtocolError;

pub fn write_message(message: &HubMessage) -> Result<Vec<u8>, ProtocolError> {
    let value = match message {
        HubMessage::Invocation(inv) => {
            let mut obj = Map::new();
            obj.insert("type".into(), json!(kind::INVOCATION));
            if let Some(id) = &inv.invocation_id {
                obj.insert("invocationId".into(), json!(id));
            }
            obj.insert("target".into(), json!(inv.target));
            obj.insert("arguments".into(), Value::Array(inv.arguments.clone()));
            Value::Object(obj)
        }
        HubMessage::Completion(c) => {
            let mut obj = Map::new();
            obj.insert("type".into(), json!(kind::COMPLETION));
            obj.insert("invocationId".into(), json!(c.invocation_id));
            match &c.outcome {
                CompletionOutcome::Void => {}
                CompletionOutcome::Result(v) => {
                    obj.insert("result".into(), v.clone());
                }
                CompletionOutcome::Error(e) => {
                    obj.insert("error".into(), json!(e));
                }
            }
            Value::Object(obj)
        }
        HubMessage::Ping => json!({ "type": kind::PING }),
        HubMessage::Close(close) => {
            let mut obj = Map::new();
            obj.insert("type".into(), json!(kind::CLOSE));
            if let Some(err) = &close.error {
                obj.insert("error".into(), json!(err));
            }
            if close.allow_reconnect {
                obj.insert("allowReconnect".into(), json!(true));
            }
            Value::Object(obj)
        }
        HubMessage::Other { kind } => {
            return Err(ProtocolError::Malformed(format!(
                "cannot encode message type {kind}"
            )));
        }
    };
    Ok(TextFraming::write(serde_json::to_vec(&value)?))
}

pub fn parse_messages(payload: &[u8]) -> Result<Vec<HubMessage>, ProtocolError> {
    TextFraming::split(payload)?
        .into_iter()
        .map(parse_one)
        .collect()
}

fn parse_one(raw: &[u8]) -> Result<HubMessage, ProtocolError> {
    let value: Value = serde_json::from_slice(raw)?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("message is not an object".into()))?;
    let msg_type = obj
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::Malformed("missing 'type' field".into()))?;

    match msg_type {
        kind::INVOCATION => {
            let target = string_field(obj, "target")?
                .ok_or_else(|| ProtocolError::Malformed("missing 'target'".into()))?;
            let arguments = match obj.get("arguments") {
                Some(Value::Array(args)) => args.clone(),
                None | Some(Value::Null) => Vec::new(),
                Some(_) => {
                    return Err(ProtocolError::Malformed("'arguments' is not an array".into()));
                }
            };
            Ok(HubMessage::Invocation(InvocationMessage {
                invocation_id: string_field(obj, "invocationId")?,
                target,
                arguments,
            }))
        }
        kind::COMPLETION => {
            let invocation_id = string_field(obj, "invocationId")?
                .ok_or_else(|| ProtocolError::Malformed("missing 'invocationId'".into()))?;
            let outcome = if let Some(err) = string_field(obj, "error")? {
                CompletionOutcome::Error(err)
            } else {
                match obj.get("result") {
                    Some(v) if !v.is_null() => CompletionOutcome::Result(v.clone()),
                    _ => CompletionOutcome::Void,
                }
            };
            Ok(HubMessage::Completion(CompletionMessage {
                invocation_id,
                outcome,
            }))
        }
        kind::PING => Ok(HubMessage::Ping),
        kind::CLOSE => Ok(HubMessage::Close(CloseMessage {
            error: string_field(obj, "error")?,
            allow_reconnect: obj
                .get("allowReconnect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })),
        kind::STREAM_ITEM
        | kind::STREAM_INVOCATION
        | kind::CANCEL_INVOCATION
        | kind::ACK
        | kind::SEQUENCE => Ok(HubMessage::Other { kind: msg_type }),
        other => Err(ProtocolError::Malformed(format!(
            "unknown message type {other}"
        ))),
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Result<Option<String>, ProtocolError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ProtocolError::Malformed(format!("'{key}' is not a string"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(msg: HubMessage) -> String {
        String::from_utf8(write_message(&msg).unwrap()).unwrap()
    }

    #[test]
    fn invocation_wire_format() {
        let s = encode(HubMessage::Invocation(InvocationMessage::call(
            "7",
            "Hi",
            vec![json!("ping")],
        )));
        assert!(s.ends_with('\x1e'));
        let value: Value = serde_json::from_str(s.trim_end_matches('\x1e')).unwrap();
        assert_eq!(
            value,
            json!({"type": 1, "invocationId": "7", "target": "Hi", "arguments": ["ping"]})
        );
    }

    #[test]
    fn push_omits_invocation_id() {
        let s = encode(HubMessage::Invocation(InvocationMessage::notify(
            "Receive",
            vec![json!("hello")],
        )));
        assert!(!s.contains("invocationId"));
    }

    #[test]
    fn completion_variants() {
        let s = encode(HubMessage::Completion(CompletionMessage::with_result(
            "1",
            json!(true),
        )));
        assert!(s.contains("\"result\":true"));

        let s = encode(HubMessage::Completion(CompletionMessage::with_result(
            "1",
            Value::Null,
        )));
        assert!(!s.contains("result"));
        assert!(!s.contains("error"));

        let s = encode(HubMessage::Completion(CompletionMessage::with_error(
            "1", "boom",
        )));
        assert!(s.contains("\"error\":\"boom\""));
    }

    #[test]
    fn parse_batch_of_messages() {
        let payload = b"{\"type\":6}\x1e{\"type\":3,\"invocationId\":\"2\",\"result\":42}\x1e";
        let msgs = parse_messages(payload).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], HubMessage::Ping);
        match &msgs[1] {
            HubMessage::Completion(c) => {
                assert_eq!(c.invocation_id, "2");
                assert_eq!(c.outcome, CompletionOutcome::Result(json!(42)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_close_with_reconnect() {
        let msgs =
            parse_messages(b"{\"type\":7,\"error\":\"bye\",\"allowReconnect\":true}\x1e").unwrap();
        assert_eq!(
            msgs[0],
            HubMessage::Close(CloseMessage {
                error: Some("bye".into()),
                allow_reconnect: true,
            })
        );
    }

    #[test]
    fn stream_types_are_recognised() {
        let msgs = parse_messages(b"{\"type\":2,\"invocationId\":\"1\",\"item\":1}\x1e").unwrap();
        assert_eq!(msgs[0], HubMessage::Other { kind: 2 });
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = parse_messages(b"{\"type\":42}\x1e").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn invocation_without_target_is_malformed() {
        let err = parse_messages(b"{\"type\":1,\"arguments\":[]}\x1e").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
