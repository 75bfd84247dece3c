//! Write pump: moves encoded hub messages from the session queue onto the
//! current transport.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Forwards the session queue to `transport` until cancelled or the
/// transport goes away.
///
/// Hands the queue back so the next transport of the same session picks up
/// where this one stopped.
pub(crate) async fn write_pump(
    mut queue: mpsc::Receiver<Vec<u8>>,
    transport: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Vec<u8>> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            payload = queue.recv() => {
                let Some(payload) = payload else { break };
                if transport.send(payload).await.is_err() {
                    warn!("transport closed while writing");
                    break;
                }
            }
        }
    }
    queue
}
