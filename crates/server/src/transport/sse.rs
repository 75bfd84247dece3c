use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use hubline_protocol::TransportKind;
use tokio::sync::{OwnedMutexGuard, mpsc};

use super::attach_refused;
use crate::connection::Connection;
use crate::server::HubServer;

/// One open event stream. Dropping it (client went away or the
/// connection closed) releases the attachment.
struct EventStream {
    server: Arc<HubServer>,
    conn: Arc<Connection>,
    epoch: u64,
    rx: OwnedMutexGuard<mpsc::Receiver<Vec<u8>>>,
}

impl EventStream {
    async fn next_event(&mut self) -> Option<Event> {
        let payload = tokio::select! {
            payload = self.rx.recv() => payload?,
            _ = self.conn.cancel_token().cancelled() => self.rx.try_recv().ok()?,
        };
        Some(Event::default().data(String::from_utf8_lossy(&payload)))
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.server
            .transport_lost(&self.conn, self.epoch, Some("event stream closed".into()));
    }
}

pub(super) async fn stream(server: Arc<HubServer>, conn: Arc<Connection>) -> Response {
    let epoch = match conn.attach(TransportKind::ServerSentEvents) {
        Ok(epoch) => epoch,
        Err(e) => return attach_refused(e),
    };
    tracing::debug!(connection_id = %conn.id, "event stream opened");

    let rx = conn.outbound().lock_owned().await;
    let state = EventStream {
        server,
        conn,
        epoch,
        rx,
    };
    let events = futures_util::stream::unfold(state, |mut state| async move {
        let event = state.next_event().await?;
        Some((Ok::<_, Infallible>(event), state))
    });
    Sse::new(events).into_response()
}
