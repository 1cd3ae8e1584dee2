//! `TaskPoller` -- the single-consumer cooperative scheduler that drives
//! claim cycles, buffering `runNow` requests between timer ticks.
//!
//! Built on `tokio::time::interval` for the timer and a bounded
//! `tokio::sync::mpsc` channel (capacity `request_capacity`) as the
//! explicit-request FIFO. `getCapacity() > 0` is read from a shared
//! `Arc<AtomicUsize>` the pool updates as workers free up -- one relaxed
//! load per cycle, not a spin loop.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::SchedulerError;

/// Errors the poller itself can raise, distinct from `SchedulerError`
/// variants that originate below it -- these are reported out-of-band via
/// the poller's own error channel rather than through the event stream,
/// since they are not associated with a `TaskDocument` outcome.
#[derive(Debug, Clone)]
pub enum PollerError {
    /// An explicit request arrived while the buffer was full.
    RequestCapacityReached { task_id: String },
    /// One invocation of `work` exceeded `pollInterval * maxPollInactivityCycles`.
    WorkTimeout,
}

/// What one emission hands to the `work` callback: the drained explicit
/// request ids (possibly empty, for a plain timer tick).
pub type WorkCycle = Vec<String>;

/// Handle to a running poller: lets callers enqueue explicit requests and
/// lets [`crate::monitor::ObservableMonitor`] read back its liveness.
pub struct TaskPoller {
    request_tx: mpsc::Sender<String>,
    last_emission: Arc<Mutex<Instant>>,
}

impl TaskPoller {
    /// Spawn the poller loop. `work` runs once per emitted cycle; its
    /// result is awaited before the next cycle can start (single consumer).
    pub fn spawn<F, Fut>(
        request_capacity: usize,
        capacity: Arc<AtomicUsize>,
        poll_interval: watch::Receiver<Duration>,
        max_poll_inactivity_cycles: u32,
        cancel: CancellationToken,
        work: F,
    ) -> (Self, mpsc::Receiver<PollerError>)
    where
        F: Fn(WorkCycle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel(request_capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(64);
        let last_emission = Arc::new(Mutex::new(Instant::now()));

        tokio::spawn(run_loop(
            request_rx,
            capacity,
            poll_interval,
            max_poll_inactivity_cycles,
            cancel,
            work,
            last_emission.clone(),
            error_tx,
        ));

        (
            Self {
                request_tx,
                last_emission,
            },
            error_rx,
        )
    }

    /// Buffer an explicit claim request for `task_id`. Fails with
    /// [`SchedulerError::RequestCapacityReached`] if the buffer is full.
    pub fn enqueue_request(&self, task_id: String) -> Result<(), SchedulerError> {
        self.request_tx
            .try_send(task_id.clone())
            .map_err(|_| SchedulerError::RequestCapacityReached { task_id })
    }

    /// Instant of the poller's most recent cycle emission.
    pub fn last_emission(&self) -> Instant {
        *self.last_emission.lock().expect("last_emission lock poisoned")
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<F, Fut>(
    mut request_rx: mpsc::Receiver<String>,
    capacity: Arc<AtomicUsize>,
    mut poll_interval: watch::Receiver<Duration>,
    max_poll_inactivity_cycles: u32,
    cancel: CancellationToken,
    work: F,
    last_emission: Arc<Mutex<Instant>>,
    error_tx: mpsc::Sender<PollerError>,
) where
    F: Fn(WorkCycle) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    let mut pending: Vec<String> = Vec::new();
    let mut timer = tokio::time::interval(*poll_interval.borrow());
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return;
            }
            _ = timer.tick() => {
                let ids = std::mem::take(&mut pending);
                emit_cycle(ids, &work, *poll_interval.borrow(), max_poll_inactivity_cycles, &last_emission, &error_tx).await;
            }
            changed = poll_interval.changed() => {
                if changed.is_err() {
                    return;
                }
                timer = tokio::time::interval(*poll_interval.borrow());
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            }
            received = request_rx.recv() => {
                let Some(task_id) = received else { return };
                pending.push(task_id);
                if capacity.load(Ordering::Relaxed) > 0 {
                    let ids = std::mem::take(&mut pending);
                    emit_cycle(ids, &work, *poll_interval.borrow(), max_poll_inactivity_cycles, &last_emission, &error_tx).await;
                }
            }
        }
    }
}

async fn emit_cycle<F, Fut>(
    ids: WorkCycle,
    work: &F,
    poll_interval: Duration,
    max_poll_inactivity_cycles: u32,
    last_emission: &Arc<Mutex<Instant>>,
    error_tx: &mpsc::Sender<PollerError>,
) where
    F: Fn(WorkCycle) -> Fut,
    Fut: Future<Output = ()>,
{
    *last_emission.lock().expect("last_emission lock poisoned") = Instant::now();

    let work_timeout = poll_interval * max_poll_inactivity_cycles;
    if tokio::time::timeout(work_timeout, work(ids)).await.is_err() {
        warn!(?work_timeout, "poller work phase timed out");
        let _ = error_tx.send(PollerError::WorkTimeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn enqueue_beyond_capacity_reports_full() {
        let capacity = Arc::new(AtomicUsize::new(0));
        let (poll_interval_tx, poll_interval_rx) = watch::channel(Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let (poller, mut errors) = TaskPoller::spawn(
            1,
            capacity,
            poll_interval_rx,
            10,
            cancel.clone(),
            |_ids| async {},
        );

        poller.enqueue_request("a".to_string()).unwrap();
        let err = poller.enqueue_request("b".to_string());
        assert!(matches!(
            err,
            Err(SchedulerError::RequestCapacityReached { .. })
        ));

        cancel.cancel();
        drop(poll_interval_tx);
        let _ = errors.try_recv();
    }
}
