//! Hub client.
//!
//! Negotiates with a hub endpoint, picks a transport, performs the
//! handshake and then invokes hub methods, sends fire-and-forget messages
//! and dispatches server pushes to registered handlers.

mod connection;
mod handlers;
mod invocation;
mod negotiate;
mod pumps;
mod reconnection;
mod session;
mod transport;
pub mod types;

pub use connection::HubConnection;
pub use hubline_protocol::{HubProtocol, TransportKind};
pub use types::{
    ConnectionEvent, ConnectionOptions, ConnectionState, HubConnectionBuilder, ReconnectConfig,
};

use tokio_tungstenite::tungstenite;

/// Errors from the hub client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("connection failed: {0}")]
    Connection(String),

    /// The server completed the invocation with an error.
    #[error("{0}")]
    Invocation(String),

    #[error("invocation timed out")]
    Timeout,

    #[error("invocation cancelled: connection closed")]
    Cancelled,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] hubline_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Folds transport internals into a [`ClientError::Connection`].
    pub(crate) fn into_connection(self) -> Self {
        match self {
            ClientError::Connection(_) => self,
            other => ClientError::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "invocation timed out");
        assert_eq!(
            ClientError::Invocation("boom".into()).to_string(),
            "boom"
        );
        assert!(
            ClientError::Connection("refused".into())
                .to_string()
                .contains("refused")
        );
    }

    #[test]
    fn internals_fold_into_connection() {
        let err = ClientError::Protocol(hubline_protocol::ProtocolError::IncompleteMessage);
        match err.into_connection() {
            ClientError::Connection(msg) => assert_eq!(msg, "protocol error: message is incomplete"),
            other => panic!("expected connection error, got {other:?}"),
        }
        let err = ClientError::Connection("x".into()).into_connection();
        assert!(matches!(err, ClientError::Connection(m) if m == "x"));
    }
}
