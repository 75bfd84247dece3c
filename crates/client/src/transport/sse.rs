use futures_util::{Stream, StreamExt};
use hubline_protocol::TransportKind;
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Endpoint, LinkParts, TransportEvent, TransportLink, link, post_pump};
use crate::ClientError;
use crate::negotiate::{http_url, with_connection_token};

pub(super) async fn connect(
    http: &reqwest::Client,
    endpoint: &Endpoint,
) -> Result<TransportLink, ClientError> {
    let url = with_connection_token(&http_url(&endpoint.url)?, endpoint.token.as_deref());
    let response = endpoint
        .authorize(http.get(url.clone()))
        .header(ACCEPT, "text/event-stream")
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Connection(format!(
            "event stream refused with status {status}"
        )));
    }

    let events = Box::pin(response.bytes_stream());
    let http = http.clone();
    let endpoint = endpoint.clone();
    Ok(link(TransportKind::ServerSentEvents, move |parts: LinkParts| {
        vec![
            tokio::spawn(read_events(
                events,
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

async fn read_events<S, B>(
    mut stream: S,
    incoming: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut parser = EventParser::default();
    let reason = loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(chunk)) => {
                for data in parser.feed(chunk.as_ref()) {
                    if incoming.send(TransportEvent::Payload(data)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => break Some(format!("event stream failed: {e}")),
            None => break None,
        }
    };
    let _ = incoming.send(TransportEvent::Closed(reason)).await;
}

/// Incremental `text/event-stream` parser that yields each event's data.
#[derive(Default)]
struct EventParser {
    line: Vec<u8>,
    data: Option<Vec<u8>>,
}

impl EventParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut events = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }
            let mut line = std::mem::take(&mut self.line);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                if let Some(data) = self.data.take() {
                    events.push(data);
                }
            } else if let Some(value) = line.strip_prefix(b"data:") {
                let value = value.strip_prefix(b" ").unwrap_or(value);
                match &mut self.data {
                    Some(data) => {
                        data.push(b'\n');
                        data.extend_from_slice(value);
                    }
                    None => self.data = Some(value.to_vec()),
                }
            }
            // Comments and other fields are ignored.
        }
        events
    }
}
