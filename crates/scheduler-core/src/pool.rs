//! `TaskPool` -- the bounded worker pool.
//!
//! Directly modeled on `gator-core::orchestrator::run_orchestrator`'s
//! concurrency idiom: a `tokio::sync::Semaphore` sized to the live
//! `maxWorkers` value, one `tokio::spawn` per runner, and a
//! `tokio_util::sync::CancellationToken` for shutdown. Generalized from "DAG
//! task lifecycle" to "arbitrary claimed task runner" -- there is no
//! completion channel here because `TaskRunner` already reports its own
//! outcome through the event stream; the pool only needs to know when a
//! slot frees up.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Bounded concurrent executor. Not a queue: unclaimed capacity means the
/// next poll cycle simply claims fewer tasks, so the store stays the one
/// source of pending work.
pub struct TaskPool {
    semaphore: Arc<Semaphore>,
    /// Mirrors `semaphore`'s available-permit count for cheap, lock-free
    /// reads from `TaskPoller`'s cycle loop.
    available: Arc<AtomicUsize>,
    configured_max: AtomicUsize,
    cancel: CancellationToken,
}

impl TaskPool {
    pub fn new(initial_max_workers: usize, cancel: CancellationToken) -> Self {
        let initial_max_workers = initial_max_workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(initial_max_workers)),
            available: Arc::new(AtomicUsize::new(initial_max_workers)),
            configured_max: AtomicUsize::new(initial_max_workers),
            cancel,
        }
    }

    /// Shared counter `TaskPoller` reads to answer `getCapacity() > 0`.
    pub fn capacity_handle(&self) -> Arc<AtomicUsize> {
        self.available.clone()
    }

    /// Current slack (`maxWorkers - running`).
    pub fn available_workers(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    /// Reconcile the pool's total permits with a newly observed
    /// `maxWorkers` value from `ManagedConfiguration`. Growth takes effect
    /// immediately; shrinkage forgets permits as they become available,
    /// which may lag by one worker's lifetime if all permits are currently
    /// held -- acceptable since this only throttles the *next* cycle's
    /// claim size, not a hard ceiling.
    pub fn resize(&self, new_max: usize) {
        let new_max = new_max.max(1);
        let old_max = self.configured_max.swap(new_max, Ordering::SeqCst);
        if new_max > old_max {
            let grant = new_max - old_max;
            self.semaphore.add_permits(grant);
            self.available.fetch_add(grant, Ordering::SeqCst);
        } else if new_max < old_max {
            let shrink = old_max - new_max;
            let forgotten = self.semaphore.forget_permits(shrink);
            self.available.fetch_sub(forgotten, Ordering::SeqCst);
        }
    }

    /// Accept up to `available_workers()` runners. Each is spawned as its
    /// own task; runners beyond capacity are left on the floor -- they
    /// remain `claiming` in the store and are reclaimed on lease expiry.
    pub async fn run<I, Fut>(&self, runners: I)
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future<Output = ()> + Send + 'static,
    {
        for fut in runners {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            self.available.fetch_sub(1, Ordering::SeqCst);
            let available = self.available.clone();
            tokio::spawn(async move {
                fut.await;
                drop(permit);
                available.fetch_add(1, Ordering::SeqCst);
            });
        }
    }

    /// Signal cancellation to every in-flight runner. Executors that honor
    /// the signal terminate promptly; those that don't continue until
    /// their lease expires.
    pub fn cancel_running_tasks(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_up_to_capacity_and_drops_excess() {
        let pool = TaskPool::new(2, CancellationToken::new());
        let ran = Arc::new(StdAtomicUsize::new(0));

        let make_runner = |ran: Arc<StdAtomicUsize>| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ran.fetch_add(1, Ordering::SeqCst);
        };

        pool.run(vec![
            make_runner(ran.clone()),
            make_runner(ran.clone()),
            make_runner(ran.clone()),
        ])
        .await;

        // Only 2 of 3 runners should have been spawned (third dropped).
        assert_eq!(pool.available_workers(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(pool.available_workers(), 2);
    }

    #[test]
    fn resize_grows_available_immediately() {
        let pool = TaskPool::new(2, CancellationToken::new());
        pool.resize(5);
        assert_eq!(pool.available_workers(), 5);
    }

    #[test]
    fn resize_shrink_forgets_idle_permits() {
        let pool = TaskPool::new(5, CancellationToken::new());
        pool.resize(2);
        assert_eq!(pool.available_workers(), 2);
    }
}
