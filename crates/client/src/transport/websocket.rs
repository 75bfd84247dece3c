use futures_util::{SinkExt, StreamExt};
use hubline_protocol::TransportKind;
use hubline_protocol::constants::{MAX_MESSAGE_SIZE, TransferFormat};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Endpoint, LinkParts, TransportEvent, TransportLink, link};
use crate::ClientError;
use crate::negotiate::{with_connection_token, ws_url};

pub(super) async fn connect(endpoint: &Endpoint) -> Result<TransportLink, ClientError> {
    let url = with_connection_token(&ws_url(&endpoint.url)?, endpoint.token.as_deref());
    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = &endpoint.access_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ClientError::Configuration(format!("invalid access token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(MAX_MESSAGE_SIZE);
    let (ws_stream, _) =
        tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false).await?;
    let (write, read) = ws_stream.split();
    let format = endpoint.format;

    Ok(link(TransportKind::WebSockets, move |parts: LinkParts| {
        vec![
            tokio::spawn(write_frames(
                write,
                parts.outgoing,
                format,
                parts.cancel.clone(),
            )),
            tokio::spawn(read_frames(read, parts.incoming, parts.cancel)),
        ]
    }))
}

/// Writes queued payloads as frames, flushing the queue before the close
/// frame once cancelled.
async fn write_frames<S>(
    mut write: S,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    format: TransferFormat,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            payload = outgoing.recv() => {
                let Some(payload) = payload else { break };
                if let Err(e) = write.send(frame(format, payload)).await {
                    warn!("WebSocket write error: {e}");
                    return;
                }
            }
        }
    }

    while let Ok(payload) = outgoing.try_recv() {
        if write.send(frame(format, payload)).await.is_err() {
            return;
        }
    }
    let _ = write.send(tungstenite::Message::Close(None)).await;
}

async fn read_frames<S>(
    mut read: S,
    incoming: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let reason = loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = read.next() => msg,
        };
        let payload = match msg {
            Some(Ok(tungstenite::Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(tungstenite::Message::Binary(data))) => data.to_vec(),
            Some(Ok(tungstenite::Message::Close(frame))) => {
                debug!(?frame, "received close frame");
                break None;
            }
            // Pings are answered by tungstenite.
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Some(format!("WebSocket read error: {e}")),
            None => break None,
        };
        if incoming.send(TransportEvent::Payload(payload)).await.is_err() {
            return;
        }
    };
    let _ = incoming.send(TransportEvent::Closed(reason)).await;
}

fn frame(format: TransferFormat, payload: Vec<u8>) -> tungstenite::Message {
    match format {
        TransferFormat::Binary => tungstenite::Message::Binary(payload.into()),
        TransferFormat::Text => match String::from_utf8(payload) {
            Ok(text) => tungstenite::Message::Text(text.into()),
            Err(e) => tungstenite::Message::Binary(e.into_bytes().into()),
        },
    }
}
