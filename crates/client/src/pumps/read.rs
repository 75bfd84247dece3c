//! Read pump: decodes transport payloads and dispatches hub messages.

use std::time::Duration;

use hubline_protocol::{CloseMessage, HubMessage, HubProtocol};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::handlers::PushHandlers;
use crate::invocation::PendingInvocations;
use crate::transport::TransportEvent;

/// Why a transport stopped being read.
#[derive(Debug, PartialEq)]
pub(crate) enum LinkEnd {
    /// The session was cancelled locally.
    Stopped,
    /// The server sent a Close message.
    ServerClosed(CloseMessage),
    /// The transport failed or went quiet.
    Lost(String),
}

/// Everything the read pump dispatches to.
pub(crate) struct Dispatch<'a> {
    pub protocol: HubProtocol,
    pub handlers: &'a PushHandlers,
    pub pending: &'a PendingInvocations,
}

/// Reads transport events until the transport ends, the session is
/// cancelled or nothing arrives within `server_timeout`.
///
/// Any payload resets the deadline; the server pings while idle.
pub(crate) async fn read_pump(
    incoming: &mut mpsc::Receiver<TransportEvent>,
    dispatch: Dispatch<'_>,
    leftover: Vec<u8>,
    server_timeout: Duration,
    cancel: &CancellationToken,
) -> LinkEnd {
    if !leftover.is_empty() {
        if let Some(end) = dispatch.payload(&leftover) {
            return end;
        }
    }

    let deadline = tokio::time::sleep(server_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return LinkEnd::Stopped,

            () = &mut deadline => {
                warn!("no message from the server within {server_timeout:?}, closing");
                return LinkEnd::Lost(
                    "server timeout elapsed without receiving a message from the server".into(),
                );
            }

            event = incoming.recv() => match event {
                Some(TransportEvent::Payload(payload)) => {
                    deadline.as_mut().reset(tokio::time::Instant::now() + server_timeout);
                    if let Some(end) = dispatch.payload(&payload) {
                        return end;
                    }
                }
                Some(TransportEvent::Closed(reason)) => {
                    debug!(?reason, "transport closed");
                    return LinkEnd::Lost(reason.unwrap_or_else(|| "transport closed".into()));
                }
                None => return LinkEnd::Lost("transport closed".into()),
            }
        }
    }
}

impl Dispatch<'_> {
    /// Dispatches every message in `payload`; returns early on a Close
    /// message or an undecodable payload.
    fn payload(&self, payload: &[u8]) -> Option<LinkEnd> {
        let messages = match self.protocol.parse(payload) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("invalid payload from server: {e}");
                return Some(LinkEnd::Lost(format!("invalid payload from server: {e}")));
            }
        };
        for message in messages {
            match message {
                HubMessage::Invocation(invocation) => {
                    if invocation.invocation_id.is_some() {
                        warn!(target = %invocation.target, "server invocations with results are not supported; ignoring the id");
                    }
                    self.handlers.dispatch(&invocation);
                }
                HubMessage::Completion(completion) => self.pending.complete(completion),
                HubMessage::Ping => trace!("received ping"),
                HubMessage::Close(close) => {
                    debug!(error = ?close.error, "server closed the connection");
                    return Some(LinkEnd::ServerClosed(close));
                }
                HubMessage::Other { kind } => trace!(kind, "ignoring message"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubline_protocol::{CompletionMessage, InvocationMessage};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn encode(messages: &[HubMessage]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| HubProtocol::Json.write(m).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn dispatches_pushes_in_order_and_completions() {
        let handlers = PushHandlers::default();
        let pending = PendingInvocations::default();
        pending.open();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        handlers.insert("Receive", move |(m,): (String,)| s.lock().push(m));
        let (id, done) = pending.register().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        tx.send(TransportEvent::Payload(encode(&[
            HubMessage::Invocation(InvocationMessage::notify("Receive", vec![json!("a")])),
            HubMessage::Ping,
            HubMessage::Invocation(InvocationMessage::notify("Receive", vec![json!("b")])),
        ])))
        .await
        .unwrap();
        tx.send(TransportEvent::Payload(encode(&[HubMessage::Completion(
            CompletionMessage::with_result(id, json!(true)),
        )])))
        .await
        .unwrap();
        tx.send(TransportEvent::Closed(None)).await.unwrap();

        let dispatch = Dispatch {
            protocol: HubProtocol::Json,
            handlers: &handlers,
            pending: &pending,
        };
        let end = read_pump(
            &mut rx,
            dispatch,
            Vec::new(),
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(end, LinkEnd::Lost("transport closed".into()));
        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(done.await.unwrap().unwrap(), json!(true));
    }

    #[tokio::test]
    async fn close_message_ends_the_link() {
        let handlers = PushHandlers::default();
        let pending = PendingInvocations::default();
        let (_tx, mut rx) = mpsc::channel(16);
        let leftover = encode(&[HubMessage::Close(CloseMessage {
            error: Some("bye".into()),
            allow_reconnect: false,
        })]);

        let end = read_pump(
            &mut rx,
            Dispatch {
                protocol: HubProtocol::Json,
                handlers: &handlers,
                pending: &pending,
            },
            leftover,
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(end, LinkEnd::ServerClosed(c) if c.error.as_deref() == Some("bye")));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_server_timeout_is_lost() {
        let handlers = PushHandlers::default();
        let pending = PendingInvocations::default();
        let (_tx, mut rx) = mpsc::channel::<TransportEvent>(16);

        let end = read_pump(
            &mut rx,
            Dispatch {
                protocol: HubProtocol::Json,
                handlers: &handlers,
                pending: &pending,
            },
            Vec::new(),
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(end, LinkEnd::Lost(reason) if reason.contains("server timeout")));
    }

    #[tokio::test]
    async fn cancel_stops_the_pump() {
        let handlers = PushHandlers::default();
        let pending = PendingInvocations::default();
        let (_tx, mut rx) = mpsc::channel::<TransportEvent>(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let end = read_pump(
            &mut rx,
            Dispatch {
                protocol: HubProtocol::Json,
                handlers: &handlers,
                pending: &pending,
            },
            Vec::new(),
            Duration::from_secs(30),
            &cancel,
        )
        .await;
        assert_eq!(end, LinkEnd::Stopped);
    }

    #[tokio::test]
    async fn garbage_is_a_lost_link() {
        let handlers = PushHandlers::default();
        let pending = PendingInvocations::default();
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(TransportEvent::Payload(b"not json\x1e".to_vec()))
            .await
            .unwrap();

        let end = read_pump(
            &mut rx,
            Dispatch {
                protocol: HubProtocol::Json,
                handlers: &handlers,
                pending: &pending,
            },
            Vec::new(),
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(end, LinkEnd::Lost(reason) if reason.contains("invalid payload")));
    }
}
