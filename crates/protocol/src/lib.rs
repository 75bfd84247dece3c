pub mod arguments;
pub mod constants;
pub mod framing;
pub mod handshake;
pub mod json;
pub mod messages;
pub mod msgpack;
pub mod negotiate;

use constants::TransferFormat;

// Re-export primary types for convenience.
pub use arguments::{FromArguments, IntoArguments};
pub use constants::TransportKind;
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use messages::{CloseMessage, CompletionMessage, CompletionOutcome, HubMessage, InvocationMessage};
pub use negotiate::{AvailableTransport, NegotiateResponse};

/// Errors raised while framing, encoding or decoding hub traffic.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("messagepack encode: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("messagepack decode: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message is incomplete")]
    IncompleteMessage,

    #[error("invalid length prefix")]
    InvalidLengthPrefix,

    #[error("the protocol '{0}' is not supported")]
    UnsupportedProtocol(String),

    #[error("the server does not support version {0} of the '{1}' protocol")]
    UnsupportedVersion(u32, String),

    #[error("Invocation provides {actual} argument(s) but target expects {expected}.")]
    ArgumentCount { expected: usize, actual: usize },

    #[error("failed to bind argument {index}: {reason}")]
    ArgumentType { index: usize, reason: String },
}

/// Hub protocols selectable in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HubProtocol {
    #[default]
    Json,
    MessagePack,
}

impl HubProtocol {
    /// Name used in the handshake request.
    pub fn name(self) -> &'static str {
        match self {
            HubProtocol::Json => "json",
            HubProtocol::MessagePack => "messagepack",
        }
    }

    /// Looks up a protocol by its handshake name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("json") {
            Some(HubProtocol::Json)
        } else if name.eq_ignore_ascii_case("messagepack") {
            Some(HubProtocol::MessagePack)
        } else {
            None
        }
    }

    pub fn transfer_format(self) -> TransferFormat {
        match self {
            HubProtocol::Json => TransferFormat::Text,
            HubProtocol::MessagePack => TransferFormat::Binary,
        }
    }

    /// Encodes one message, framing included.
    pub fn write(self, message: &HubMessage) -> Result<Vec<u8>, ProtocolError> {
        match self {
            HubProtocol::Json => json::write_message(message),
            HubProtocol::MessagePack => msgpack::write_message(message),
        }
    }

    /// Decodes every message contained in a transport payload.
    pub fn parse(self, payload: &[u8]) -> Result<Vec<HubMessage>, ProtocolError> {
        match self {
            HubProtocol::Json => json::parse_messages(payload),
            HubProtocol::MessagePack => msgpack::parse_messages(payload),
        }
    }
}

impl std::fmt::Display for HubProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names_are_case_insensitive() {
        assert_eq!(HubProtocol::from_name("JSON"), Some(HubProtocol::Json));
        assert_eq!(
            HubProtocol::from_name("MessagePack"),
            Some(HubProtocol::MessagePack)
        );
        assert_eq!(HubProtocol::from_name("xml"), None);
    }

    #[test]
    fn argument_count_message() {
        let err = ProtocolError::ArgumentCount {
            expected: 1,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "Invocation provides 2 argument(s) but target expects 1."
        );
    }

    #[test]
    fn both_protocols_encode_ping() {
        let json = HubProtocol::Json.write(&HubMessage::Ping).unwrap();
        assert_eq!(json, b"{\"type\":6}\x1e");
        let mp = HubProtocol::MessagePack.write(&HubMessage::Ping).unwrap();
        assert_eq!(mp, vec![0x02, 0x91, 0x06]);
    }
}
