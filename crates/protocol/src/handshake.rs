//! The handshake exchanged once per transport before any hub message.
//!
//! Both sides always frame the handshake as JSON text terminated by the
//! record separator, whatever hub protocol is being negotiated.

use serde::{Deserialize, Serialize};

use crate::constants::{HUB_PROTOCOL_VERSION, RECORD_SEPARATOR};
use crate::framing::TextFraming;
use crate::{HubProtocol, ProtocolError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl HandshakeRequest {
    pub fn new(protocol: HubProtocol) -> Self {
        Self {
            protocol: protocol.name().to_string(),
            version: HUB_PROTOCOL_VERSION,
        }
    }

    /// Checks the requested protocol against those this side speaks.
    pub fn resolve(&self) -> Result<HubProtocol, ProtocolError> {
        let protocol = HubProtocol::from_name(&self.protocol)
            .ok_or_else(|| ProtocolError::UnsupportedProtocol(self.protocol.clone()))?;
        if self.version != HUB_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(
                self.version,
                self.protocol.clone(),
            ));
        }
        Ok(protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }
}

/// Serializes a handshake message and appends the record separator.
pub fn write<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(TextFraming::write(serde_json::to_vec(message)?))
}

/// Parses a handshake message from the front of `payload`.
///
/// Returns the message and whatever bytes followed it; transports may
/// coalesce the handshake with the first hub messages.
pub fn parse<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<(T, &[u8]), ProtocolError> {
    let end = payload
        .iter()
        .position(|b| *b == RECORD_SEPARATOR)
        .ok_or(ProtocolError::IncompleteMessage)?;
    let message = serde_json::from_slice(&payload[..end])?;
    Ok((message, &payload[end + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format() {
        let bytes = write(&HandshakeRequest::new(HubProtocol::Json)).unwrap();
        assert_eq!(bytes, b"{\"protocol\":\"json\",\"version\":1}\x1e");
    }

    #[test]
    fn ok_response_is_empty_object() {
        let bytes = write(&HandshakeResponse::ok()).unwrap();
        assert_eq!(bytes, b"{}\x1e");
    }

    #[test]
    fn parse_keeps_trailing_bytes() {
        let payload = b"{\"protocol\":\"messagepack\",\"version\":1}\x1e\x02\x91\x06";
        let (req, rest): (HandshakeRequest, _) = parse(payload).unwrap();
        assert_eq!(req.resolve().unwrap(), HubProtocol::MessagePack);
        assert_eq!(rest, &[0x02, 0x91, 0x06]);
    }

    #[test]
    fn parse_error_response() {
        let (resp, rest): (HandshakeResponse, _) =
            parse(b"{\"error\":\"nope\"}\x1e").unwrap();
        assert_eq!(resp.error.as_deref(), Some("nope"));
        assert!(rest.is_empty());
    }

    #[test]
    fn resolve_rejects_unknown_protocol_and_version() {
        let req = HandshakeRequest {
            protocol: "xml".into(),
            version: 1,
        };
        assert!(matches!(
            req.resolve(),
            Err(ProtocolError::UnsupportedProtocol(_))
        ));
        let req = HandshakeRequest {
            protocol: "json".into(),
            version: 2,
        };
        assert!(matches!(
            req.resolve(),
            Err(ProtocolError::UnsupportedVersion(2, _))
        ));
    }

    #[test]
    fn parse_without_separator_is_incomplete() {
        let res: Result<(HandshakeResponse, _), _> = parse(b"{}");
        assert!(matches!(res, Err(ProtocolError::IncompleteMessage)));
    }
}
