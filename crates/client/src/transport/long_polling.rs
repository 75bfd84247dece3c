use hubline_protocol::TransportKind;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use super::{Endpoint, LinkParts, TransportEvent, TransportLink, link, post_pump};
use crate::ClientError;
use crate::negotiate::{http_url, with_connection_token};

pub(super) async fn connect(
    http: &reqwest::Client,
    endpoint: &Endpoint,
) -> Result<TransportLink, ClientError> {
    let url = with_connection_token(&http_url(&endpoint.url)?, endpoint.token.as_deref());
    let http = http.clone();
    let endpoint = endpoint.clone();

    Ok(link(TransportKind::LongPolling, move |parts: LinkParts| {
        vec![
            tokio::spawn(poll_loop(
                http.clone(),
                endpoint.clone(),
                url.clone(),
                parts.incoming.clone(),
                parts.cancel.clone(),
            )),
            tokio::spawn(post_pump(
                http,
                endpoint,
                url,
                parts.outgoing,
                parts.incoming,
                parts.cancel,
            )),
        ]
    }))
}

/// Issues one held `GET` after another until the server answers
/// `204 No Content` or a request fails.
async fn poll_loop(
    http: reqwest::Client,
    endpoint: Endpoint,
    url: Url,
    incoming: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let reason = loop {
        let request = endpoint.authorize(http.get(url.clone())).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return,
            response = request => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => break Some(format!("poll failed: {e}")),
        };
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            break None;
        }
        if !status.is_success() {
            break Some(format!("poll failed with status {status}"));
        }
        let body = tokio::select! {
            _ = cancel.cancelled() => return,
            body = response.bytes() => body,
        };
        match body {
            Ok(body) if body.is_empty() => trace!("poll timed out empty"),
            Ok(body) => {
                if incoming.send(TransportEvent::Payload(body.to_vec())).await.is_err() {
                    return;
                }
            }
            Err(e) => break Some(format!("poll body failed: {e}")),
        }
    };
    let _ = incoming.send(TransportEvent::Closed(reason)).await;
}
