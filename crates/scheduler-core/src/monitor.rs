//! `ObservableMonitor` -- watches the poller's output and restarts it if it
//! goes quiet longer than `pollInterval * (maxPollInactivityCycles + 1)`.
//!
//! This guards against a stuck internal poller state more severe than a
//! single `work` invocation hanging (which `TaskPoller` itself already
//! bounds with its work-phase timeout).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::SchedulerError;
use crate::poller::{PollerError, TaskPoller, WorkCycle};

type BoxedWork = Arc<dyn Fn(WorkCycle) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Minimum cadence at which the watchdog re-checks the poller's pulse,
/// regardless of how large the computed inactivity timeout is.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(50);

struct Incarnation {
    poller: TaskPoller,
    cancel: CancellationToken,
}

/// Supervises a [`TaskPoller`], transparently replacing it if it stalls.
#[derive(Clone)]
pub struct ObservableMonitor {
    current: Arc<Mutex<Incarnation>>,
}

impl ObservableMonitor {
    /// Spawn the first poller incarnation plus the watchdog that may
    /// replace it. `errors` receives [`PollerError`]s from whichever
    /// incarnation is currently live.
    pub fn spawn(
        request_capacity: usize,
        capacity: Arc<AtomicUsize>,
        poll_interval: watch::Receiver<Duration>,
        max_poll_inactivity_cycles: u32,
        parent_cancel: CancellationToken,
        work: BoxedWork,
    ) -> (Self, mpsc::Receiver<PollerError>) {
        let (error_tx, error_rx) = mpsc::channel(64);

        let cancel = parent_cancel.child_token();
        let (poller, errors) = spawn_poller(
            request_capacity,
            &capacity,
            &poll_interval,
            max_poll_inactivity_cycles,
            &cancel,
            &work,
        );
        tokio::spawn(forward_errors(errors, error_tx.clone()));

        let current = Arc::new(Mutex::new(Incarnation { poller, cancel }));

        tokio::spawn(watchdog(
            current.clone(),
            request_capacity,
            capacity,
            poll_interval,
            max_poll_inactivity_cycles,
            parent_cancel,
            work,
            error_tx,
        ));

        (Self { current }, error_rx)
    }

    /// Buffer an explicit claim request against whichever poller
    /// incarnation is currently live.
    pub fn enqueue_request(&self, task_id: String) -> Result<(), SchedulerError> {
        self.current
            .lock()
            .expect("monitor lock poisoned")
            .poller
            .enqueue_request(task_id)
    }

    /// Instant of the most recent cycle emission from whichever poller
    /// incarnation is currently live, for health reporting.
    pub fn last_emission(&self) -> Instant {
        self.current
            .lock()
            .expect("monitor lock poisoned")
            .poller
            .last_emission()
    }
}

fn spawn_poller(
    request_capacity: usize,
    capacity: &Arc<AtomicUsize>,
    poll_interval: &watch::Receiver<Duration>,
    max_poll_inactivity_cycles: u32,
    cancel: &CancellationToken,
    work: &BoxedWork,
) -> (TaskPoller, mpsc::Receiver<PollerError>) {
    let work = work.clone();
    TaskPoller::spawn(
        request_capacity,
        capacity.clone(),
        poll_interval.clone(),
        max_poll_inactivity_cycles,
        cancel.clone(),
        move |ids| (work)(ids),
    )
}

async fn forward_errors(mut errors: mpsc::Receiver<PollerError>, out: mpsc::Sender<PollerError>) {
    while let Some(err) = errors.recv().await {
        if out.send(err).await.is_err() {
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn watchdog(
    current: Arc<Mutex<Incarnation>>,
    request_capacity: usize,
    capacity: Arc<AtomicUsize>,
    poll_interval: watch::Receiver<Duration>,
    max_poll_inactivity_cycles: u32,
    parent_cancel: CancellationToken,
    work: BoxedWork,
    error_tx: mpsc::Sender<PollerError>,
) {
    loop {
        let inactivity_timeout =
            (*poll_interval.borrow()) * (max_poll_inactivity_cycles + 1);
        let check_cadence = (inactivity_timeout / 4).max(MIN_CHECK_INTERVAL);

        tokio::select! {
            _ = parent_cancel.cancelled() => return,
            _ = tokio::time::sleep(check_cadence) => {}
        }

        let last_emission = current
            .lock()
            .expect("monitor lock poisoned")
            .poller
            .last_emission();

        if last_emission.elapsed() > inactivity_timeout {
            warn!(?inactivity_timeout, "poller inactive beyond threshold, restarting");

            let stale_cancel = current.lock().expect("monitor lock poisoned").cancel.clone();
            stale_cancel.cancel();

            let cancel = parent_cancel.child_token();
            let (poller, errors) = spawn_poller(
                request_capacity,
                &capacity,
                &poll_interval,
                max_poll_inactivity_cycles,
                &cancel,
                &work,
            );
            tokio::spawn(forward_errors(errors, error_tx.clone()));

            *current.lock().expect("monitor lock poisoned") = Incarnation { poller, cancel };
        }
    }
}
