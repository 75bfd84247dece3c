//! Client transports.
//!
//! Every transport is reduced to the same shape: a queue of outgoing
//! payloads and a stream of [`TransportEvent`]s. Payloads are already
//! framed by the hub protocol, so several of them can share one frame or
//! request body.

mod long_polling;
mod sse;
mod websocket;

use std::time::Duration;

use hubline_protocol::constants::TransferFormat;
use hubline_protocol::{HandshakeRequest, HandshakeResponse, HubProtocol, TransportKind, handshake};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::ClientError;

/// Capacity of the per-transport payload queues.
const QUEUE_SIZE: usize = 256;

/// How long [`TransportLink::close`] waits for the transport to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Something the transport received.
#[derive(Debug, PartialEq)]
pub(crate) enum TransportEvent {
    Payload(Vec<u8>),
    /// The transport ended, with the reason when it failed.
    Closed(Option<String>),
}

/// Where a transport connects to.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub url: Url,
    /// Connection token, absent when negotiation was skipped.
    pub token: Option<String>,
    pub access_token: Option<String>,
    pub format: TransferFormat,
}

impl Endpoint {
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }
}

/// One connected transport.
pub(crate) struct TransportLink {
    pub kind: TransportKind,
    outgoing: mpsc::Sender<Vec<u8>>,
    pub incoming: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportLink {
    pub(crate) async fn connect(
        kind: TransportKind,
        endpoint: &Endpoint,
        http: &reqwest::Client,
    ) -> Result<Self, ClientError> {
        debug!(transport = %kind, url = %endpoint.url, "connecting transport");
        match kind {
            TransportKind::WebSockets => websocket::connect(endpoint).await,
            TransportKind::ServerSentEvents => sse::connect(http, endpoint).await,
            TransportKind::LongPolling => long_polling::connect(http, endpoint).await,
        }
    }

    /// Sends the handshake request and waits for the response.
    ///
    /// Returns whatever the server sent after the response; it may already
    /// hold hub messages.
    pub(crate) async fn handshake(&mut self, protocol: HubProtocol) -> Result<Vec<u8>, ClientError> {
        self.send(handshake::write(&HandshakeRequest::new(protocol))?)
            .await?;

        let mut buffer = Vec::new();
        loop {
            match self.incoming.recv().await {
                Some(TransportEvent::Payload(payload)) => {
                    buffer.extend_from_slice(&payload);
                    let (response, rest): (HandshakeResponse, &[u8]) =
                        match handshake::parse(&buffer) {
                            Ok(parsed) => parsed,
                            Err(hubline_protocol::ProtocolError::IncompleteMessage) => continue,
                            Err(e) => return Err(e.into()),
                        };
                    if let Some(error) = response.error {
                        return Err(ClientError::Connection(format!(
                            "server rejected the handshake: {error}"
                        )));
                    }
                    debug!(transport = %self.kind, "handshake complete");
                    return Ok(rest.to_vec());
                }
                Some(TransportEvent::Closed(reason)) => {
                    return Err(ClientError::Connection(format!(
                        "transport closed during the handshake{}",
                        reason.map(|r| format!(": {r}")).unwrap_or_default()
                    )));
                }
                None => {
                    return Err(ClientError::Connection(
                        "transport closed during the handshake".into(),
                    ));
                }
            }
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.outgoing.clone()
    }

    pub(crate) async fn send(&self, payload: Vec<u8>) -> Result<(), ClientError> {
        self.outgoing
            .send(payload)
            .await
            .map_err(|_| ClientError::Connection("transport closed".into()))
    }

    /// Stops the transport after flushing what is already queued.
    pub(crate) async fn close(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            let _ = tokio::time::timeout(CLOSE_GRACE, task).await;
        }
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Channels and token shared by a transport's tasks.
pub(super) struct LinkParts {
    pub outgoing: mpsc::Receiver<Vec<u8>>,
    pub incoming: mpsc::Sender<TransportEvent>,
    pub cancel: CancellationToken,
}

/// Builds a link whose tasks are spawned by `spawn`.
pub(super) fn link(
    kind: TransportKind,
    spawn: impl FnOnce(LinkParts) -> Vec<JoinHandle<()>>,
) -> TransportLink {
    let (out_tx, out_rx) = mpsc::channel(QUEUE_SIZE);
    let (in_tx, in_rx) = mpsc::channel(QUEUE_SIZE);
    let cancel = CancellationToken::new();
    let tasks = spawn(LinkParts {
        outgoing: out_rx,
        incoming: in_tx,
        cancel: cancel.clone(),
    });
    TransportLink {
        kind,
        outgoing: out_tx,
        incoming: in_rx,
        cancel,
        tasks,
    }
}

/// Sends outgoing payloads as POST bodies for the HTTP transports.
///
/// On cancellation the remaining queue is flushed, then a `DELETE` ends
/// the connection on the server.
pub(super) async fn post_pump(
    http: reqwest::Client,
    endpoint: Endpoint,
    url: Url,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    incoming: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let mut body = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            payload = outgoing.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        drain(&mut outgoing, &mut body);
        if let Err(reason) = post(&http, &endpoint, &url, body).await {
            debug!("send failed: {reason}");
            let _ = incoming.send(TransportEvent::Closed(Some(reason))).await;
            return;
        }
    }

    let mut body = Vec::new();
    drain(&mut outgoing, &mut body);
    if !body.is_empty() {
        let _ = post(&http, &endpoint, &url, body).await;
    }
    match endpoint.authorize(http.delete(url)).send().await {
        Ok(response) => debug!(status = %response.status(), "transport deleted"),
        Err(e) => debug!("delete failed: {e}"),
    }
}

fn drain(outgoing: &mut mpsc::Receiver<Vec<u8>>, body: &mut Vec<u8>) {
    while let Ok(more) = outgoing.try_recv() {
        body.extend_from_slice(&more);
    }
}

async fn post(
    http: &reqwest::Client,
    endpoint: &Endpoint,
    url: &Url,
    body: Vec<u8>,
) -> Result<(), String> {
    let content_type = match endpoint.format {
        TransferFormat::Text => "text/plain; charset=utf-8",
        TransferFormat::Binary => "application/octet-stream",
    };
    let response = endpoint
        .authorize(http.post(url.clone()))
        .header(CONTENT_TYPE, content_type)
        .body(body)
        .send()
        .await
        .map_err(|e| format!("send failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("send failed with status {}", response.status()));
    }
    Ok(())
}
