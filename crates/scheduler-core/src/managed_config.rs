//! `ManagedConfiguration` -- derives live `maxWorkers`/`pollInterval` from
//! configured limits and observed store errors.
//!
//! Publishes both as `tokio::sync::watch` receivers, the idiomatic
//! single-writer/many-reader "live value" channel. A background task
//! subscribes to the store's error broadcast, buckets signals into a fixed
//! observation window, and nudges both values once per window: decay on a
//! sustained overload signal, additive recovery otherwise.

use std::time::Duration;

use scheduler_store::StoreError;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Length of one observation window.
const WINDOW: Duration = Duration::from_secs(30);

/// Multiplicative decay factor applied to `maxWorkers` (and inversely to
/// `pollInterval`) on a window with an overload signal.
const DECAY: f64 = 0.5;

/// Upper bound on how far `pollInterval` may lengthen, expressed as a
/// multiple of the configured base interval.
const MAX_POLL_INTERVAL_MULTIPLIER: u32 = 10;

/// Live configuration values plus the handle needed to stop the background
/// task (dropping the last `ManagedConfiguration` closes its error
/// subscription and lets the task exit on the next `recv`).
pub struct ManagedConfiguration {
    max_workers_rx: watch::Receiver<usize>,
    poll_interval_rx: watch::Receiver<Duration>,
}

impl ManagedConfiguration {
    /// Start the background adjustment task. `errors` is the store's own
    /// broadcast receiver of [`StoreError`]s.
    pub fn start(
        errors: broadcast::Receiver<StoreError>,
        configured_max_workers: usize,
        configured_poll_interval: Duration,
    ) -> Self {
        let (max_workers_tx, max_workers_rx) = watch::channel(configured_max_workers.max(1));
        let (poll_interval_tx, poll_interval_rx) = watch::channel(configured_poll_interval);

        tokio::spawn(run(
            errors,
            max_workers_tx,
            poll_interval_tx,
            configured_max_workers.max(1),
            configured_poll_interval,
        ));

        Self {
            max_workers_rx,
            poll_interval_rx,
        }
    }

    pub fn max_workers(&self) -> watch::Receiver<usize> {
        self.max_workers_rx.clone()
    }

    pub fn poll_interval(&self) -> watch::Receiver<Duration> {
        self.poll_interval_rx.clone()
    }
}

async fn run(
    mut errors: broadcast::Receiver<StoreError>,
    max_workers_tx: watch::Sender<usize>,
    poll_interval_tx: watch::Sender<Duration>,
    configured_max_workers: usize,
    configured_poll_interval: Duration,
) {
    let mut window_deadline = Instant::now() + WINDOW;
    let mut overload_seen = false;

    loop {
        tokio::select! {
            received = errors.recv() => {
                match received {
                    Ok(err) if err.is_overload_signal() => overload_seen = true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "managed configuration lagged behind error stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            _ = tokio::time::sleep_until(window_deadline) => {
                if overload_seen {
                    decay_window(&max_workers_tx, &poll_interval_tx, configured_poll_interval);
                } else {
                    recover_window(
                        &max_workers_tx,
                        &poll_interval_tx,
                        configured_max_workers,
                        configured_poll_interval,
                    );
                }
                overload_seen = false;
                window_deadline = Instant::now() + WINDOW;
            }
        }
    }
}

fn decay_window(
    max_workers_tx: &watch::Sender<usize>,
    poll_interval_tx: &watch::Sender<Duration>,
    configured_poll_interval: Duration,
) {
    max_workers_tx.send_if_modified(|w| {
        let next = ((*w as f64) * DECAY).floor().max(1.0) as usize;
        let changed = next != *w;
        *w = next;
        changed
    });

    let cap = configured_poll_interval * MAX_POLL_INTERVAL_MULTIPLIER;
    poll_interval_tx.send_if_modified(|p| {
        let next = p.mul_f64(1.0 / DECAY).min(cap);
        let changed = next != *p;
        *p = next;
        changed
    });

    info!("managed configuration decayed maxWorkers/pollInterval on overload signal");
}

fn recover_window(
    max_workers_tx: &watch::Sender<usize>,
    poll_interval_tx: &watch::Sender<Duration>,
    configured_max_workers: usize,
    configured_poll_interval: Duration,
) {
    max_workers_tx.send_if_modified(|w| {
        let next = (*w + 1).min(configured_max_workers);
        let changed = next != *w;
        *w = next;
        changed
    });

    poll_interval_tx.send_if_modified(|p| {
        let next = p.saturating_sub(configured_poll_interval).max(configured_poll_interval);
        let changed = next != *p;
        *p = next;
        changed
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_floors_at_one_worker() {
        let (max_workers_tx, max_workers_rx) = watch::channel(1usize);
        let (poll_interval_tx, _poll_interval_rx) = watch::channel(Duration::from_secs(3));
        decay_window(&max_workers_tx, &poll_interval_tx, Duration::from_secs(3));
        assert_eq!(*max_workers_rx.borrow(), 1);
    }

    #[test]
    fn decay_lengthens_poll_interval_up_to_cap() {
        let (max_workers_tx, _rx) = watch::channel(10usize);
        let base = Duration::from_secs(3);
        let (poll_interval_tx, poll_interval_rx) = watch::channel(base);
        for _ in 0..20 {
            decay_window(&max_workers_tx, &poll_interval_tx, base);
        }
        assert!(*poll_interval_rx.borrow() <= base * MAX_POLL_INTERVAL_MULTIPLIER);
    }

    #[test]
    fn recovery_caps_at_configured_max() {
        let (max_workers_tx, max_workers_rx) = watch::channel(9usize);
        let (poll_interval_tx, _rx) = watch::channel(Duration::from_secs(3));
        for _ in 0..5 {
            recover_window(&max_workers_tx, &poll_interval_tx, 10, Duration::from_secs(3));
        }
        assert_eq!(*max_workers_rx.borrow(), 10);
    }

    #[test]
    fn recovery_never_drops_below_configured_base_interval() {
        let (max_workers_tx, _rx) = watch::channel(10usize);
        let base = Duration::from_secs(3);
        let (poll_interval_tx, poll_interval_rx) = watch::channel(base);
        recover_window(&max_workers_tx, &poll_interval_tx, 10, base);
        assert_eq!(*poll_interval_rx.borrow(), base);
    }
}
