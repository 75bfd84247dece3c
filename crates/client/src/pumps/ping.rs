//! Ping pump: periodic hub-level keep-alive.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Queues `ping` every `period` until cancelled.
///
/// A full queue skips the tick: pending traffic keeps the connection alive
/// on its own.
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<Vec<u8>>,
    ping: Vec<u8>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match write_tx.try_send(ping.clone()) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_pump_stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            ping_pump(tx, vec![6], Duration::from_secs(15), c).await;
        });

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }

    #[tokio::test(start_paused = true)]
    async fn pings_every_period() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(ping_pump(tx, vec![6], Duration::from_secs(15), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(rx.recv().await, Some(vec![6]));
        assert_eq!(rx.recv().await, Some(vec![6]));
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }
}
