//! Staleness watchdog for an open but silent connection.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancel `connection` once no data has arrived for `stale_after`.
///
/// Checks every `interval`. Returns when the connection token is cancelled,
/// either by this monitor or by whoever owns the connection.
pub async fn monitor(
    liveness: watch::Receiver<Instant>,
    interval: Duration,
    stale_after: Duration,
    connection: CancellationToken,
    label: String,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = connection.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let silent_for = liveness.borrow().elapsed();
        if silent_for >= stale_after {
            warn!(
                "[{label}] No data for {}s, tearing down connection",
                silent_for.as_secs()
            );
            connection.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stale_connection_is_cancelled_within_one_interval() {
        let (liveness_tx, liveness_rx) = watch::channel(Instant::now());
        let token = CancellationToken::new();
        let started = Instant::now();

        let task = tokio::spawn(monitor(
            liveness_rx,
            Duration::from_secs(1),
            Duration::from_secs(120),
            token.clone(),
            "pad".to_string(),
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        liveness_tx.send_replace(Instant::now());
        assert!(!token.is_cancelled());

        token.cancelled().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(180));
        assert!(elapsed <= Duration::from_secs(181));
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_stops_monitor() {
        let (_liveness_tx, liveness_rx) = watch::channel(Instant::now());
        let token = CancellationToken::new();

        let task = tokio::spawn(monitor(
            liveness_rx,
            Duration::from_secs(1),
            Duration::from_secs(120),
            token.clone(),
            "pad".to_string(),
        ));

        token.cancel();
        token.cancel();
        task.await.unwrap();
    }
}
