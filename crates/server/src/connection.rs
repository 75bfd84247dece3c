//! Server-side connection state: identity, handshake, outbound queue and
//! liveness.
//!
//! A connection outlives its transport attachments. The outbound queue
//! belongs to the connection, so messages queued while a stateful
//! connection is detached are delivered once a new WebSocket attaches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hubline_protocol::constants::{TransferFormat, TransportKind};
use hubline_protocol::framing::TextFraming;
use hubline_protocol::handshake::{self, HandshakeRequest, HandshakeResponse};
use hubline_protocol::{CloseMessage, HubMessage, HubProtocol};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::server::HubServer;

/// Outbound queue receiver, shared by successive transport attachments.
pub(crate) type Outbound = Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>;

#[derive(Debug, Default)]
struct State {
    protocol: Option<HubProtocol>,
    handshaken: bool,
    transport: Option<TransportKind>,
    attached: bool,
    /// Incremented on every attach so a stale detach is ignored.
    epoch: u64,
}

/// Why a transport could not be bound to a connection.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AttachError {
    /// The connection already uses another transport kind.
    TransportMismatch,
    /// A transport of the same kind is already attached.
    AlreadyAttached,
}

pub(crate) enum HandshakeOutcome<'a> {
    Accepted {
        response: Vec<u8>,
        /// False when a stateful connection handshakes again on reattach.
        first: bool,
        rest: &'a [u8],
    },
    Rejected {
        response: Vec<u8>,
        reason: String,
    },
}

pub(crate) struct Connection {
    pub id: String,
    pub token: String,
    pub stateful: bool,
    created: Instant,
    state: Mutex<State>,
    last_seen: Mutex<Instant>,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Outbound,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        id: String,
        token: String,
        stateful: bool,
        server_cancel: &CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let now = Instant::now();
        Arc::new(Self {
            id,
            token,
            stateful,
            created: now,
            state: Mutex::new(State::default()),
            last_seen: Mutex::new(now),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            cancel: server_cancel.child_token(),
            closed: AtomicBool::new(false),
        })
    }

    /// Records that a payload arrived from the client.
    pub(crate) fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub(crate) fn protocol(&self) -> Option<HubProtocol> {
        self.state.lock().protocol
    }

    pub(crate) fn transport(&self) -> Option<TransportKind> {
        self.state.lock().transport
    }

    pub(crate) fn is_handshaken(&self) -> bool {
        self.state.lock().handshaken
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Whether the client is expected to be sending right now. A detached
    /// stateful WebSocket is governed by the reconnect window instead.
    pub(crate) fn expects_traffic(&self) -> bool {
        let state = self.state.lock();
        state.handshaken
            && (state.attached || state.transport != Some(TransportKind::WebSockets))
    }

    /// Handshaken and not yet closed: eligible for pushes.
    pub(crate) fn is_live(&self) -> bool {
        !self.is_closed() && self.is_handshaken()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flags the connection closed. Returns `true` for the first caller only.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn outbound(&self) -> Outbound {
        Arc::clone(&self.rx)
    }

    /// Claims the connection for a new transport attachment.
    pub(crate) fn attach(&self, kind: TransportKind) -> Result<u64, AttachError> {
        let mut state = self.state.lock();
        if state.transport.is_some_and(|existing| existing != kind) {
            return Err(AttachError::TransportMismatch);
        }
        if state.attached {
            return Err(AttachError::AlreadyAttached);
        }
        state.transport = Some(kind);
        state.attached = true;
        state.epoch += 1;
        // A fresh transport starts a fresh client-timeout period.
        self.touch();
        Ok(state.epoch)
    }

    /// Releases the attachment identified by `epoch`. A newer attachment
    /// is left alone.
    pub(crate) fn detach(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch == epoch && state.attached {
            state.attached = false;
            true
        } else {
            false
        }
    }

    /// Processes the handshake request at the front of `payload`.
    pub(crate) fn handshake<'a>(&self, payload: &'a [u8]) -> HandshakeOutcome<'a> {
        let (request, rest) = match handshake::parse::<HandshakeRequest>(payload) {
            Ok(parsed) => parsed,
            Err(e) => return rejected(format!("Handshake was malformed: {e}")),
        };
        let protocol = match request.resolve() {
            Ok(p) => p,
            Err(e) => return rejected(e.to_string()),
        };

        let mut state = self.state.lock();
        if state.transport == Some(TransportKind::ServerSentEvents)
            && protocol.transfer_format() == TransferFormat::Binary
        {
            return rejected(format!(
                "the '{protocol}' protocol is not supported by the ServerSentEvents transport"
            ));
        }
        if let Some(previous) = state.protocol.filter(|p| *p != protocol) {
            return rejected(format!(
                "the connection was established with the '{previous}' protocol"
            ));
        }
        let first = !state.handshaken;
        state.protocol = Some(protocol);
        state.handshaken = true;
        drop(state);

        HandshakeOutcome::Accepted {
            response: encode_handshake(&HandshakeResponse::ok()),
            first,
            rest,
        }
    }

    /// Encodes `message` with the negotiated protocol and queues it.
    pub(crate) fn send_message(&self, message: &HubMessage) -> bool {
        let Some(protocol) = self.protocol() else {
            tracing::warn!(connection_id = %self.id, "dropping message before handshake");
            return false;
        };
        match protocol.write(message) {
            Ok(bytes) => self.enqueue(bytes),
            Err(e) => {
                tracing::error!(connection_id = %self.id, "failed to encode message: {e}");
                false
            }
        }
    }

    /// Queues an already-encoded payload without waiting.
    pub(crate) fn enqueue(&self, payload: Vec<u8>) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %self.id, "send buffer full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

fn rejected<'a>(reason: String) -> HandshakeOutcome<'a> {
    HandshakeOutcome::Rejected {
        response: encode_handshake(&HandshakeResponse::error(reason.clone())),
        reason,
    }
}

fn encode_handshake(response: &HandshakeResponse) -> Vec<u8> {
    handshake::write(response).unwrap_or_else(|_| TextFraming::write(b"{}".to_vec()))
}

/// Drains whatever is queued right now without waiting.
pub(crate) fn drain_ready(rx: &mut mpsc::Receiver<Vec<u8>>, out: &mut Vec<u8>) -> usize {
    let mut count = 0;
    while let Ok(payload) = rx.try_recv() {
        out.extend_from_slice(&payload);
        count += 1;
    }
    count
}

/// Per-connection liveness: handshake deadline, keep-alive pings and the
/// client timeout.
pub(crate) async fn liveness(server: Arc<HubServer>, conn: Arc<Connection>) {
    let config = server.config();
    let mut ping = tokio::time::interval(config.keep_alive_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        let deadline = if !conn.is_handshaken() {
            conn.created + config.handshake_timeout
        } else if conn.expects_traffic() {
            Instant::now() + config.client_timeout.saturating_sub(conn.idle_for())
        } else {
            // Detached: the reconnect window decides; check back later.
            Instant::now() + config.client_timeout
        };

        tokio::select! {
            _ = conn.cancel.cancelled() => break,

            _ = tokio::time::sleep_until(deadline) => {
                if !conn.is_handshaken() {
                    if conn.created.elapsed() >= config.handshake_timeout {
                        tracing::warn!(connection_id = %conn.id, "handshake not received in time");
                        server.close_connection(&conn, Some("handshake timeout".into()), None);
                        break;
                    }
                } else if conn.expects_traffic() && conn.idle_for() >= config.client_timeout {
                    tracing::warn!(connection_id = %conn.id, "client timeout, closing connection");
                    let close = CloseMessage {
                        error: Some("Server timeout elapsed without receiving a message from the client.".into()),
                        allow_reconnect: false,
                    };
                    server.close_connection(&conn, Some("client timeout".into()), Some(close));
                    break;
                }
            }

            _ = ping.tick() => {
                if conn.expects_traffic() {
                    conn.send_message(&HubMessage::Ping);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Arc<Connection> {
        Connection::new("id".into(), "tok".into(), true, &CancellationToken::new())
    }

    #[test]
    fn attach_is_exclusive_and_epoch_guards_detach() {
        let c = conn();
        let e1 = c.attach(TransportKind::WebSockets).unwrap();
        assert_eq!(
            c.attach(TransportKind::WebSockets),
            Err(AttachError::AlreadyAttached)
        );
        assert!(c.detach(e1));
        let e2 = c.attach(TransportKind::WebSockets).unwrap();
        assert!(e2 > e1);
        assert!(!c.detach(e1), "stale detach must be ignored");
        assert!(c.is_attached());
    }

    #[tokio::test(start_paused = true)]
    async fn attach_resets_idle_time() {
        let c = conn();
        let epoch = c.attach(TransportKind::WebSockets).unwrap();
        assert!(c.detach(epoch));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(c.idle_for() >= Duration::from_secs(5));
        c.attach(TransportKind::WebSockets).unwrap();
        assert_eq!(c.idle_for(), Duration::ZERO);
    }

    #[test]
    fn transport_kind_is_fixed_after_first_bind() {
        let c = conn();
        let epoch = c.attach(TransportKind::LongPolling).unwrap();
        assert!(c.detach(epoch));
        assert_eq!(
            c.attach(TransportKind::WebSockets),
            Err(AttachError::TransportMismatch)
        );
    }

    #[test]
    fn handshake_accepts_then_reports_reattach() {
        let c = conn();
        let payload = b"{\"protocol\":\"json\",\"version\":1}\x1e{\"type\":6}\x1e";
        match c.handshake(payload) {
            HandshakeOutcome::Accepted {
                response,
                first,
                rest,
            } => {
                assert_eq!(response, b"{}\x1e");
                assert!(first);
                assert_eq!(rest, b"{\"type\":6}\x1e");
            }
            HandshakeOutcome::Rejected { reason, .. } => panic!("rejected: {reason}"),
        }
        match c.handshake(b"{\"protocol\":\"json\",\"version\":1}\x1e") {
            HandshakeOutcome::Accepted { first, .. } => assert!(!first),
            HandshakeOutcome::Rejected { reason, .. } => panic!("rejected: {reason}"),
        }
        assert_eq!(c.protocol(), Some(HubProtocol::Json));
    }

    #[test]
    fn handshake_rejects_protocol_switch_and_binary_over_sse() {
        let c = conn();
        let _ = c.handshake(b"{\"protocol\":\"json\",\"version\":1}\x1e");
        assert!(matches!(
            c.handshake(b"{\"protocol\":\"messagepack\",\"version\":1}\x1e"),
            HandshakeOutcome::Rejected { .. }
        ));

        let sse = conn();
        sse.attach(TransportKind::ServerSentEvents).unwrap();
        match sse.handshake(b"{\"protocol\":\"messagepack\",\"version\":1}\x1e") {
            HandshakeOutcome::Rejected { response, .. } => {
                assert!(response.starts_with(b"{\"error\":"));
            }
            HandshakeOutcome::Accepted { .. } => panic!("binary over SSE accepted"),
        }
        assert!(!sse.is_handshaken());
    }

    #[test]
    fn malformed_handshake_is_rejected() {
        let c = conn();
        assert!(matches!(
            c.handshake(b"not json\x1e"),
            HandshakeOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn send_message_requires_protocol() {
        let c = conn();
        assert!(!c.send_message(&HubMessage::Ping));
        let _ = c.handshake(b"{\"protocol\":\"json\",\"version\":1}\x1e");
        assert!(c.send_message(&HubMessage::Ping));
        let rx = c.outbound();
        let mut rx = rx.lock().await;
        let mut out = Vec::new();
        assert_eq!(drain_ready(&mut rx, &mut out), 1);
        assert_eq!(out, b"{\"type\":6}\x1e");
    }

    #[test]
    fn mark_closed_only_once() {
        let c = conn();
        assert!(c.mark_closed());
        assert!(!c.mark_closed());
        assert!(c.is_closed());
        assert!(!c.is_live());
    }
}
