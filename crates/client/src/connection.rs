//! The hub connection: lifecycle, invocations and handler registration.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use hubline_protocol::{FromArguments, HubMessage, IntoArguments, InvocationMessage, TransportKind};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::ClientError;
use crate::handlers::PushHandlers;
use crate::invocation::PendingInvocations;
use crate::negotiate::negotiate;
use crate::session::{self, Established};
use crate::transport::{Endpoint, TransportLink};
use crate::types::{ConnectionEvent, ConnectionOptions, ConnectionState};

/// Capacity of the session's outbound queue.
const SEND_BUFFER_SIZE: usize = 2048;

/// Capacity of the state event channel.
const EVENT_BUFFER_SIZE: usize = 64;

type ClosedCallback = Arc<dyn Fn(Option<&ClientError>) + Send + Sync>;

/// State shared between the public handle and the session tasks.
pub(crate) struct Shared {
    pub(crate) options: ConnectionOptions,
    url: Url,
    pub(crate) http: reqwest::Client,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    pub(crate) pending: PendingInvocations,
    pub(crate) handlers: PushHandlers,
    closed_handlers: RwLock<Vec<ClosedCallback>>,
    connection_id: Mutex<Option<String>>,
    /// Session outbound queue; present from handshake until Disconnected.
    writer: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    session: tokio::sync::Mutex<Option<Session>>,
}

struct Session {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Moves to `next` if the transition is valid, publishing the change.
    pub(crate) fn set_state(&self, next: ConnectionState) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if !state.can_transition_to(next) {
                warn!(from = %*state, to = %next, "refusing invalid state transition");
                return false;
            }
            std::mem::replace(&mut *state, next)
        };
        debug!(%previous, current = %next, "connection state changed");
        let _ = self.events.send(ConnectionEvent::StateChanged {
            previous,
            current: next,
        });
        true
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn writer(&self) -> Result<mpsc::Sender<Vec<u8>>, ClientError> {
        self.writer.lock().clone().ok_or_else(|| {
            ClientError::Connection(format!(
                "cannot send data while the connection is {}",
                self.state()
            ))
        })
    }

    /// Ends the session: cancels waiting invocations, moves to
    /// `Disconnected` and runs the closed handlers once.
    pub(crate) fn finish(&self, error: Option<ClientError>) {
        self.writer.lock().take();
        self.connection_id.lock().take();
        let cancelled = self.pending.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding invocations");
        }
        if !self.set_state(ConnectionState::Disconnected) {
            return;
        }
        match &error {
            Some(e) => warn!("connection closed with an error: {e}"),
            None => info!("connection closed"),
        }

        let handlers = self.closed_handlers.read().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(error.as_ref()))).is_err() {
                warn!("closed handler panicked");
            }
        }
    }
}

/// A connection to one hub endpoint.
///
/// Dropping the handle stops the session without waiting for it.
pub struct HubConnection {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection").finish_non_exhaustive()
    }
}

impl HubConnection {
    pub fn new(options: ConnectionOptions) -> Result<Self, ClientError> {
        let url = options.validate()?;
        let http = reqwest::Client::builder().build()?;
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Ok(Self {
            inner: Arc::new(Shared {
                options,
                url,
                http,
                state: Mutex::new(ConnectionState::Disconnected),
                events,
                pending: PendingInvocations::default(),
                handlers: PushHandlers::default(),
                closed_handlers: RwLock::new(Vec::new()),
                connection_id: Mutex::new(None),
                writer: Mutex::new(None),
                session: tokio::sync::Mutex::new(None),
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared {
        &self.inner
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Connection id assigned by the server, while connected through a
    /// negotiated connection.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.connection_id.lock().clone()
    }

    /// Receives every state transition and reconnect attempt from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Registers a handler for pushes of `method`.
    ///
    /// Several handlers may share a name; each runs once per push, in
    /// registration order. Names match case-insensitively.
    pub fn on<A, F>(&self, method: &str, handler: F)
    where
        A: FromArguments + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        self.inner.handlers.insert(method, handler);
    }

    /// Registers a handler run each time the connection closes for good,
    /// with the error that closed it, if any.
    pub fn on_closed<F>(&self, handler: F)
    where
        F: Fn(Option<&ClientError>) + Send + Sync + 'static,
    {
        self.inner.closed_handlers.write().push(Arc::new(handler));
    }

    /// Connects: negotiation, transport selection and handshake, all within
    /// the handshake timeout.
    pub async fn start(&self) -> Result<(), ClientError> {
        let shared = &self.inner;
        {
            let state = shared.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(ClientError::Connection(format!(
                    "cannot start a connection that is {}",
                    *state
                )));
            }
        }
        let mut slot = shared.session.lock().await;
        if !shared.set_state(ConnectionState::Connecting) {
            return Err(ClientError::Connection(format!(
                "cannot start a connection that is {}",
                shared.state()
            )));
        }

        let timeout = shared.options.handshake_timeout;
        let established = match tokio::time::timeout(timeout, establish(shared)).await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => {
                shared.set_state(ConnectionState::Disconnected);
                return Err(e.into_connection());
            }
            Err(_) => {
                shared.set_state(ConnectionState::Disconnected);
                return Err(ClientError::Connection(format!(
                    "handshake was not completed within {timeout:?}"
                )));
            }
        };

        info!(
            transport = %established.link.kind,
            connection_id = established.connection_id.as_deref().unwrap_or("-"),
            "connected"
        );
        let (write_tx, write_rx) = mpsc::channel(SEND_BUFFER_SIZE);
        shared.pending.open();
        *shared.connection_id.lock() = established.connection_id.clone();
        *shared.writer.lock() = Some(write_tx.clone());
        shared.set_state(ConnectionState::Connected);

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(session::supervise(
            Arc::clone(shared),
            established,
            write_tx,
            write_rx,
            cancel.clone(),
        ));
        *slot = Some(Session { cancel, supervisor });
        Ok(())
    }

    /// Closes the connection and waits for the session to wind down.
    ///
    /// Outstanding invocations fail with [`ClientError::Cancelled`]. Does
    /// nothing when already disconnected.
    pub async fn stop(&self) {
        let session = self.inner.session.lock().await.take();
        let Some(session) = session else { return };
        session.cancel.cancel();
        if let Err(e) = session.supervisor.await {
            warn!("session task failed: {e}");
            self.inner.finish(None);
        }
    }

    /// Invokes `method` and waits for its completion.
    ///
    /// Fails with [`ClientError::Invocation`] when the server reports an
    /// error, [`ClientError::Timeout`] after the server timeout and
    /// [`ClientError::Cancelled`] when the connection closes first.
    pub async fn invoke<R>(&self, method: &str, args: impl IntoArguments) -> Result<R, ClientError>
    where
        R: DeserializeOwned,
    {
        let arguments = args.into_arguments()?;
        let writer = self.inner.writer()?;
        let (id, completion) = self.inner.pending.register()?;
        let message = HubMessage::Invocation(InvocationMessage::call(id.clone(), method, arguments));
        let payload = match self.inner.options.protocol.write(&message) {
            Ok(payload) => payload,
            Err(e) => {
                self.inner.pending.remove(&id);
                return Err(e.into());
            }
        };

        let exchange = async {
            writer
                .send(payload)
                .await
                .map_err(|_| ClientError::Cancelled)?;
            completion.await.map_err(|_| ClientError::Cancelled)?
        };
        let value = match tokio::time::timeout(self.inner.options.server_timeout, exchange).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                self.inner.pending.remove(&id);
                return Err(e);
            }
            Err(_) => {
                self.inner.pending.remove(&id);
                debug!(invocation_id = %id, method, "invocation timed out");
                return Err(ClientError::Timeout);
            }
        };
        serde_json::from_value(value)
            .map_err(|e| ClientError::Invocation(format!("failed to bind the result: {e}")))
    }

    /// Sends `method` without waiting for a result. Returns once queued.
    pub async fn send(&self, method: &str, args: impl IntoArguments) -> Result<(), ClientError> {
        let arguments = args.into_arguments()?;
        let writer = self.inner.writer()?;
        let message = HubMessage::Invocation(InvocationMessage::notify(method, arguments));
        let payload = self.inner.options.protocol.write(&message)?;
        writer
            .send(payload)
            .await
            .map_err(|_| ClientError::Connection("connection closed".into()))
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.inner.session.try_lock() {
            if let Some(session) = slot.take() {
                session.cancel.cancel();
            }
        }
    }
}

/// Negotiates (unless skipped), picks a transport and handshakes.
async fn establish(shared: &Shared) -> Result<Established, ClientError> {
    let options = &shared.options;
    let protocol = options.protocol;
    let format = protocol.transfer_format();

    if options.skip_negotiation {
        if options.transports != [TransportKind::WebSockets] {
            return Err(ClientError::Connection(
                "negotiation can only be skipped when using the WebSockets transport only".into(),
            ));
        }
        let endpoint = Endpoint {
            url: shared.url.clone(),
            token: None,
            access_token: options.access_token.clone(),
            format,
        };
        let mut link =
            TransportLink::connect(TransportKind::WebSockets, &endpoint, &shared.http).await?;
        let leftover = link.handshake(protocol).await?;
        return Ok(Established {
            link,
            endpoint,
            leftover,
            connection_id: None,
            stateful: false,
        });
    }

    let first = negotiate(
        &shared.http,
        &shared.url,
        options.access_token.as_deref(),
        options.stateful_reconnect,
    )
    .await?;
    let candidates: Vec<TransportKind> = options
        .transports
        .iter()
        .copied()
        .filter(|kind| {
            first
                .transports
                .iter()
                .any(|t| t.transport == *kind && t.transfer_formats.contains(&format))
        })
        .collect();
    if candidates.is_empty() {
        return Err(ClientError::Connection(
            "none of the client's transports are offered by the server".into(),
        ));
    }

    let mut negotiated = Some(first);
    let mut last_error = None;
    for kind in candidates {
        // A failed attempt may have consumed the connection token.
        let current = match negotiated.take() {
            Some(current) => current,
            None => {
                negotiate(
                    &shared.http,
                    &shared.url,
                    options.access_token.as_deref(),
                    options.stateful_reconnect,
                )
                .await?
            }
        };
        let endpoint = Endpoint {
            url: current.url.clone(),
            token: Some(current.connection_token.clone()),
            access_token: current.access_token.clone(),
            format,
        };
        match TransportLink::connect(kind, &endpoint, &shared.http).await {
            Ok(mut link) => {
                let leftover = link.handshake(protocol).await?;
                let stateful = current.stateful
                    && options.stateful_reconnect
                    && kind == TransportKind::WebSockets;
                return Ok(Established {
                    link,
                    endpoint,
                    leftover,
                    connection_id: Some(current.connection_id),
                    stateful,
                });
            }
            Err(e) => {
                warn!(transport = %kind, "transport failed to connect: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(ClientError::Connection(format!(
        "unable to connect with any available transport{}",
        last_error.map(|e| format!(": {e}")).unwrap_or_default()
    )))
}
