//! MessagePack hub protocol.
//!
//! Every message is a MessagePack array behind a varint length prefix. The
//! array layouts follow the message kind:
//!
//! - invocation `[1, headers, id | nil, target, arguments, stream_ids]`
//! - completion `[3, headers, id, 1, error]`, `[3, headers, id, 2]` or
//!   `[3, headers, id, 3, result]`
//! - ping `[6]`
//! - close `[7, error | nil, allow_reconnect]`

use serde_json::{Map, Value, json};

use crate::ProtocolError;
use crate::constants::kind;
use crate::framing::BinaryFraming;
use crate::messages::{
    CloseMessage, CompletionMessage, CompletionOutcome, HubMessage, InvocationMessage,
};

const RESULT_ERROR: u64 = 1;
const RESULT_VOID: u64 = 2;
const RESULT_VALUE: u64 = 3;

pub fn write_message(message: &HubMessage) -> Result<Vec<u8>, ProtocolError> {
    let headers = Value::Object(Map::new());
    let array = match message {
        HubMessage::Invocation(inv) => json!([
            kind::INVOCATION,
            headers,
            inv.invocation_id,
            inv.target,
            inv.arguments,
            []
        ]),
        HubMessage::Completion(c) => match &c.outcome {
            CompletionOutcome::Error(e) => {
                json!([kind::COMPLETION, headers, c.invocation_id, RESULT_ERROR, e])
            }
            CompletionOutcome::Void => {
                json!([kind::COMPLETION, headers, c.invocation_id, RESULT_VOID])
            }
            CompletionOutcome::Result(v) => {
                json!([kind::COMPLETION, headers, c.invocation_id, RESULT_VALUE, v])
            }
        },
        HubMessage::Ping => json!([kind::PING]),
        HubMessage::Close(close) => json!([kind::CLOSE, close.error, close.allow_reconnect]),
        HubMessage::Other { kind } => {
            return Err(ProtocolError::Malformed(format!(
                "cannot encode message type {kind}"
            )));
        }
    };
    let body = rmp_serde::to_vec(&array)?;
    Ok(BinaryFraming::write(&body))
}

pub fn parse_messages(payload: &[u8]) -> Result<Vec<HubMessage>, ProtocolError> {
    BinaryFraming::split(payload)?
        .into_iter()
        .map(parse_one)
        .collect()
}

fn parse_one(raw: &[u8]) -> Result<HubMessage, ProtocolError> {
    let items: Vec<Value> = rmp_serde::from_slice(raw)?;
    let msg_type = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::Malformed("missing message type".into()))?;

    match msg_type {
        kind::INVOCATION => {
            let target = items
                .get(3)
                .and_then(Value::as_str)
                .ok_or_else(|| ProtocolError::Malformed("missing target".into()))?
                .to_string();
            let arguments = match items.get(4) {
                Some(Value::Array(args)) => args.clone(),
                _ => return Err(ProtocolError::Malformed("missing arguments".into())),
            };
            Ok(HubMessage::Invocation(InvocationMessage {
                invocation_id: optional_string(items.get(2))?,
                target,
                arguments,
            }))
        }
        kind::COMPLETION => {
            let invocation_id = items
                .get(2)
                .and_then(Value::as_str)
                .ok_or_else(|| ProtocolError::Malformed("missing invocation id".into()))?
                .to_string();
            let outcome = match items.get(3).and_then(Value::as_u64) {
                Some(RESULT_ERROR) => CompletionOutcome::Error(
                    items
                        .get(4)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                ),
                Some(RESULT_VOID) => CompletionOutcome::Void,
                Some(RESULT_VALUE) => match items.get(4) {
                    Some(v) if !v.is_null() => CompletionOutcome::Result(v.clone()),
                    _ => CompletionOutcome::Void,
                },
                _ => return Err(ProtocolError::Malformed("invalid result kind".into())),
            };
            Ok(HubMessage::Completion(CompletionMessage {
                invocation_id,
                outcome,
            }))
        }
        kind::PING => Ok(HubMessage::Ping),
        kind::CLOSE => Ok(HubMessage::Close(CloseMessage {
            error: optional_string(items.get(1))?,
            allow_reconnect: items.get(2).and_then(Value::as_bool).unwrap_or(false),
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

fn optional_string(value: Option<&Value>) -> Result<Option<String>, ProtocolError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ProtocolError::Malformed("expected string or nil".into())),
    }
}
