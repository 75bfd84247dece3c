//! Realtime hub server.
//!
//! Serves a single hub endpoint over WebSockets, Server-Sent Events and
//! Long Polling. Clients negotiate a connection, perform the protocol
//! handshake and then invoke named handlers registered with
//! [`HubServer::on_invoke`]. The server pushes named messages to any set of
//! connections through [`HubServer::push`].
//!
//! When a relay connection string is configured, negotiation redirects
//! clients to the relay and pushes are forwarded to its REST API.

mod clients;
mod connection;
mod handler;
mod negotiate;
mod relay;
mod server;
mod transport;

pub use clients::Target;
pub use handler::{HandlerFuture, HubContext};
pub use relay::{RELAY_CONNECTION_STRING_ENV, RelayConnectionString};
pub use server::{HubServer, ServerConfig};

/// Per-connection outbound queue capacity.
///
/// Pushes are enqueued with `try_send()`; a slow client that lets this
/// many messages pile up starts losing them.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Errors produced by the hub server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] hubline_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("connection not found: {0}")]
    NotFound(String),
}
