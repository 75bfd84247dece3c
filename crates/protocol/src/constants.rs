use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hub protocol version spoken in the handshake.
pub const HUB_PROTOCOL_VERSION: u32 = 1;

/// Negotiation protocol version (1 = separate connection id and token).
pub const NEGOTIATE_VERSION: u32 = 1;

/// Terminates every JSON-encoded message and the handshake.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// How often a peer sends a ping while connected.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Client-side read deadline: if nothing arrives from the server within
/// this window the transport is considered dead.
///
/// Should be at least double the server's keep-alive interval.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-side read deadline for a single connection.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for negotiate + transport connect + handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a long-poll request is held open when nothing is queued.
pub const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(90);

/// How long a detached stateful connection waits for its client to resume.
pub const DEFAULT_RECONNECT_WINDOW: Duration = Duration::from_secs(30);

/// Maximum size of a single transport payload in bytes (1 MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Numeric message kinds shared by both hub protocols.
pub mod kind {
    pub const INVOCATION: u64 = 1;
    pub const STREAM_ITEM: u64 = 2;
    pub const COMPLETION: u64 = 3;
    pub const STREAM_INVOCATION: u64 = 4;
    pub const CANCEL_INVOCATION: u64 = 5;
    pub const PING: u64 = 6;
    pub const CLOSE: u64 = 7;
    pub const ACK: u64 = 8;
    pub const SEQUENCE: u64 = 9;
}

/// A transport a client can use to reach the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Full-duplex socket.
    #[serde(alias = "socket", alias = "webSockets", alias = "websockets")]
    WebSockets,
    /// Server-to-client event stream, client-to-server over POST.
    #[serde(alias = "streaming", alias = "serverSentEvents", alias = "sse")]
    ServerSentEvents,
    /// Held GET requests for server-to-client, POST for client-to-server.
    #[serde(alias = "polling", alias = "longPolling")]
    LongPolling,
}

impl TransportKind {
    /// All transports in default preference order.
    pub const ALL: [TransportKind; 3] = [
        TransportKind::WebSockets,
        TransportKind::ServerSentEvents,
        TransportKind::LongPolling,
    ];

    /// Transfer formats this transport can carry.
    pub fn transfer_formats(self) -> &'static [TransferFormat] {
        match self {
            TransportKind::WebSockets | TransportKind::LongPolling => {
                &[TransferFormat::Text, TransferFormat::Binary]
            }
            TransportKind::ServerSentEvents => &[TransferFormat::Text],
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::WebSockets => "WebSockets",
            TransportKind::ServerSentEvents => "ServerSentEvents",
            TransportKind::LongPolling => "LongPolling",
        };
        f.write_str(name)
    }
}

/// Whether payloads are UTF-8 text or raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferFormat {
    Text,
    Binary,
}
