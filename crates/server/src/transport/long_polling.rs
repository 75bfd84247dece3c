use std::sync::Arc;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use hubline_protocol::{HubProtocol, TransportKind};

use super::attach_refused;
use crate::connection::{Connection, drain_ready};
use crate::server::HubServer;

/// Releases a poll's attachment however the request ends, including when
/// the client goes away and the handler future is dropped mid-wait.
struct Attachment {
    conn: Arc<Connection>,
    epoch: u64,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if self.conn.detach(self.epoch) {
            self.conn.touch();
        }
    }
}

/// Holds the request until something is queued, the poll times out or the
/// connection closes. A closed connection with nothing left to deliver
/// answers `204 No Content`, which tells the client to stop polling.
pub(super) async fn poll(server: Arc<HubServer>, conn: Arc<Connection>) -> Response {
    let epoch = match conn.attach(TransportKind::LongPolling) {
        Ok(epoch) => epoch,
        Err(e) => return attach_refused(e),
    };
    let attachment = Attachment {
        conn: Arc::clone(&conn),
        epoch,
    };

    let outbound = conn.outbound();
    let mut body = Vec::new();
    {
        let mut rx = outbound.lock().await;
        if !conn.cancel_token().is_cancelled() {
            tokio::select! {
                payload = rx.recv() => {
                    if let Some(payload) = payload {
                        body.extend_from_slice(&payload);
                    }
                }
                _ = tokio::time::sleep(server.config().long_poll_timeout) => {}
                _ = conn.cancel_token().cancelled() => {}
            }
        }
        drain_ready(&mut rx, &mut body);
    }
    drop(attachment);

    if body.is_empty() && conn.is_closed() {
        tracing::debug!(connection_id = %conn.id, "poll on closed connection");
        return StatusCode::NO_CONTENT.into_response();
    }
    let content_type = match conn.protocol() {
        Some(HubProtocol::MessagePack) => "application/octet-stream",
        _ => "text/plain; charset=utf-8",
    };
    (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
}
