//! `TaskScheduler` -- the public facade wiring every other module together.
//!
//! Modeled on `gator-core::orchestrator::run_orchestrator`'s claim-spawn-drain
//! loop, generalized from "one DAG plan" to "the whole shared task store":
//! instead of reading one plan's ready tasks, the work callback invoked by
//! [`ObservableMonitor`] claims a batch from the store and hands each claimed
//! document to [`crate::runner::run_task`], running inside [`TaskPool`].

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use scheduler_store::queries::tasks::{self, ClaimRequest, FetchOptions, FetchResult};
use scheduler_store::{StoreError, TaskDocument, TaskStatus};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::buffered_store::BufferedStore;
use crate::dictionary::{TaskTypeDefinition, TaskTypeDictionary};
use crate::error::SchedulerError;
use crate::managed_config::ManagedConfiguration;
use crate::monitor::ObservableMonitor;
use crate::pool::TaskPool;
use crate::runner;
use crate::types::{Event, EventKind, Outcome, ScheduleOptions, TaskInstance};

/// How long a claim lease is held before another instance may reclaim the
/// task, absent a renewing `update`.
const CLAIM_LEASE: Duration = Duration::from_secs(5 * 60);

/// Capacity of the poller's explicit-`runNow` request buffer.
const REQUEST_BUFFER_CAPACITY: usize = 256;

/// Capacity of the facade's broadcast channel. Sized generously since a slow
/// subscriber only loses its own backlog (`RecvError::Lagged`), never blocks
/// publishers.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Tuning knobs supplied at construction, before any task types are known.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub max_poll_inactivity_cycles: u32,
}

impl SchedulerConfig {
    /// Build a config from the environment, falling back to [`Self::default`]
    /// for any variable that is unset or fails to parse.
    ///
    /// Recognizes `SCHEDULER_MAX_WORKERS`, `SCHEDULER_POLL_INTERVAL_MS`, and
    /// `SCHEDULER_MAX_POLL_INACTIVITY_CYCLES`.
    pub fn from_env() -> Self {
        let default = Self::default();
        let max_workers = env::var("SCHEDULER_MAX_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.max_workers);
        let poll_interval = env::var("SCHEDULER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default.poll_interval);
        let max_poll_inactivity_cycles = env::var("SCHEDULER_MAX_POLL_INACTIVITY_CYCLES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.max_poll_inactivity_cycles);
        Self {
            max_workers,
            poll_interval,
            max_poll_inactivity_cycles,
        }
    }

    /// Build a config from explicit values (useful for tests and embedders).
    pub fn new(max_workers: usize, poll_interval: Duration, max_poll_inactivity_cycles: u32) -> Self {
        Self {
            max_workers,
            poll_interval,
            max_poll_inactivity_cycles,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            poll_interval: Duration::from_secs(5),
            max_poll_inactivity_cycles: 3,
        }
    }
}

/// A registered event-observer callback, invoked for every published
/// [`Event`]. Distinct from a per-task executor hook: middleware observes
/// the facade's event stream rather than wrapping individual executions.
pub type Middleware = Arc<dyn Fn(&Event) + Send + Sync>;

enum Definitions {
    Building(TaskTypeDictionary),
    Locked(Arc<TaskTypeDictionary>),
}

struct RunningState {
    cancel: CancellationToken,
    monitor: ObservableMonitor,
    pool_handle: Arc<TaskPool>,
}

/// Coordinates peer instances over the shared Postgres-backed store:
/// scheduling, claiming, executing, and rescheduling tasks.
pub struct TaskScheduler {
    pool: PgPool,
    owner_id: String,
    config: SchedulerConfig,
    definitions: Mutex<Definitions>,
    middleware: Mutex<Vec<Middleware>>,
    events_tx: broadcast::Sender<Event>,
    running: Mutex<Option<RunningState>>,
    started: AtomicBool,
}

impl TaskScheduler {
    pub fn new(pool: PgPool, config: SchedulerConfig) -> Self {
        let (events_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pool,
            owner_id: format!("scheduler-{}", Uuid::new_v4()),
            config,
            definitions: Mutex::new(Definitions::Building(TaskTypeDictionary::new())),
            middleware: Mutex::new(Vec::new()),
            events_tx,
            running: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Register task-type definitions. Only legal before [`Self::start`].
    pub fn register_task_definitions(
        &self,
        defs: impl IntoIterator<Item = (String, TaskTypeDefinition)>,
    ) -> Result<(), SchedulerError> {
        let mut guard = self.definitions.lock().expect("definitions lock poisoned");
        let Definitions::Building(dict) = &mut *guard else {
            return Err(SchedulerError::AlreadyStarted);
        };
        for (task_type, definition) in defs {
            dict.register(task_type, definition)?;
        }
        Ok(())
    }

    /// Register a middleware callback observing every published event. Only
    /// legal before [`Self::start`].
    pub fn add_middleware(&self, middleware: Middleware) -> Result<(), SchedulerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }
        self.middleware.lock().expect("middleware lock poisoned").push(middleware);
        Ok(())
    }

    /// Create a new task document. Fails with
    /// [`SchedulerError::AlreadyExists`] if `instance.id` is already taken.
    pub async fn schedule(
        &self,
        instance: TaskInstance,
        _opts: ScheduleOptions,
    ) -> Result<TaskDocument, SchedulerError> {
        let id = instance.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let run_at = instance.run_at.unwrap_or_else(Utc::now);
        let schedule_interval = instance.schedule.map(|s| s.interval);

        let inserted = tasks::insert_task(
            &self.pool,
            &id,
            &instance.task_type,
            &instance.params,
            &instance.state,
            run_at,
            schedule_interval,
        )
        .await?;

        inserted.ok_or(SchedulerError::AlreadyExists { task_id: id })
    }

    /// Like [`Self::schedule`], but treats an existing document with the
    /// same id as idempotent success rather than an error.
    pub async fn ensure_scheduled(
        &self,
        instance: TaskInstance,
        opts: ScheduleOptions,
    ) -> Result<TaskDocument, SchedulerError> {
        let id = instance.id.clone();
        match self.schedule(instance, opts).await {
            Ok(doc) => Ok(doc),
            Err(SchedulerError::AlreadyExists { task_id }) => {
                let existing = tasks::get(&self.pool, &task_id).await?;
                existing.ok_or(SchedulerError::AlreadyExists { task_id })
            }
            Err(other) => {
                // `id` is only `None` when `schedule` generated one itself,
                // in which case a conflict is impossible and this branch is
                // unreachable in practice; kept for completeness.
                let _ = id;
                Err(other)
            }
        }
    }

    /// Read a single task document.
    pub async fn get(&self, task_id: &str) -> Result<TaskDocument, SchedulerError> {
        tasks::get(&self.pool, task_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    /// List task documents, optionally filtered, with keyset pagination.
    pub async fn fetch(&self, opts: FetchOptions) -> Result<FetchResult, SchedulerError> {
        Ok(tasks::fetch(&self.pool, &opts).await?)
    }

    /// Permanently remove a task document.
    pub async fn remove(&self, task_id: &str) -> Result<(), SchedulerError> {
        Ok(tasks::remove(&self.pool, task_id).await?)
    }

    /// Force a task to run now, bypassing its normal `run_at`, and wait for
    /// its first terminal event.
    ///
    /// Fails fast with [`SchedulerError::CurrentlyRunning`] or
    /// [`SchedulerError::NotFound`] without touching the poller at all.
    pub async fn run_now(&self, task_id: &str) -> Result<(), SchedulerError> {
        let status = tasks::get_lifecycle(&self.pool, task_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound {
                task_id: task_id.to_string(),
            })?;
        if status == TaskStatus::Running {
            return Err(SchedulerError::CurrentlyRunning {
                task_id: task_id.to_string(),
            });
        }

        let running = self.running.lock().expect("running lock poisoned");
        let Some(state) = running.as_ref() else {
            return Err(SchedulerError::NotInitialized);
        };

        // Subscribe before enqueueing so no event can be missed in the gap.
        let mut events = self.events_tx.subscribe();
        state.monitor.enqueue_request(task_id.to_string())?;
        drop(running);

        loop {
            match events.recv().await {
                Ok(event) if event.task_id == task_id && event.is_terminal() => {
                    return match event.payload {
                        Outcome::Ok(()) => Ok(()),
                        Outcome::Err(e) => Err(e),
                    };
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SchedulerError::NotInitialized)
                }
            }
        }
    }

    /// Subscribe to the facade's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Subscribe to the facade's event stream as a [`futures::Stream`],
    /// for observers that would rather combine it with other streams than
    /// poll `recv()` directly. A subscriber that lags behind the broadcast
    /// channel silently skips its missed backlog rather than erroring --
    /// the same semantics `subscribe()` exposes via `RecvError::Lagged`.
    pub fn subscribe_stream(&self) -> impl futures::Stream<Item = Event> {
        use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

        BroadcastStream::new(self.events_tx.subscribe())
            .filter_map(|item: Result<Event, BroadcastStreamRecvError>| async move { item.ok() })
    }

    /// Derived health level from the poller's liveness.
    pub fn health(&self) -> crate::types::HealthStatus {
        use crate::types::HealthStatus;

        let running = self.running.lock().expect("running lock poisoned");
        let Some(state) = running.as_ref() else {
            return HealthStatus::Unavailable;
        };

        let inactivity_timeout =
            self.config.poll_interval * (self.config.max_poll_inactivity_cycles + 2);
        if state.monitor.last_emission().elapsed() > inactivity_timeout {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        }
    }

    /// Lock task-type registration and start the claim/execute loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let dictionary = {
            let mut guard = self.definitions.lock().expect("definitions lock poisoned");
            let dict = match &mut *guard {
                Definitions::Building(dict) => std::mem::replace(dict, TaskTypeDictionary::new()),
                Definitions::Locked(_) => unreachable!("started flag guards double-lock"),
            };
            let mut dict = dict;
            dict.lock();
            let arc = Arc::new(dict);
            *guard = Definitions::Locked(arc.clone());
            arc
        };

        let cancel = CancellationToken::new();
        let (store_errors_tx, store_errors_rx) = broadcast::channel(256);

        let managed_config = ManagedConfiguration::start(
            store_errors_rx,
            self.config.max_workers,
            self.config.poll_interval,
        );

        let buffered_store = BufferedStore::new(self.pool.clone(), managed_config.max_workers());
        let pool_handle = Arc::new(TaskPool::new(self.config.max_workers, cancel.child_token()));

        tokio::spawn(reconcile_pool_capacity(
            pool_handle.clone(),
            managed_config.max_workers(),
            cancel.child_token(),
        ));

        for mw in self.middleware.lock().expect("middleware lock poisoned").iter() {
            tokio::spawn(run_middleware(mw.clone(), self.events_tx.subscribe()));
        }

        let work = {
            let scheduler_pool = self.pool.clone();
            let owner_id = self.owner_id.clone();
            let buffered_store = buffered_store.clone();
            let dictionary = dictionary.clone();
            let events_tx = self.events_tx.clone();
            let pool_handle = pool_handle.clone();
            let store_errors_tx = store_errors_tx.clone();
            let runner_cancel = cancel.child_token();

            std::sync::Arc::new(move |ids: Vec<String>| {
                let scheduler_pool = scheduler_pool.clone();
                let owner_id = owner_id.clone();
                let buffered_store = buffered_store.clone();
                let dictionary = dictionary.clone();
                let events_tx = events_tx.clone();
                let pool_handle = pool_handle.clone();
                let store_errors_tx = store_errors_tx.clone();
                let runner_cancel = runner_cancel.clone();

                Box::pin(async move {
                    run_claim_cycle(
                        &scheduler_pool,
                        &owner_id,
                        ids,
                        &buffered_store,
                        &dictionary,
                        &events_tx,
                        &pool_handle,
                        &store_errors_tx,
                        &runner_cancel,
                    )
                    .await;
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            })
        };

        let (monitor, mut poller_errors) = ObservableMonitor::spawn(
            REQUEST_BUFFER_CAPACITY,
            pool_handle.capacity_handle(),
            managed_config.poll_interval(),
            self.config.max_poll_inactivity_cycles,
            cancel.child_token(),
            work,
        );
        tokio::spawn(async move { while poller_errors.recv().await.is_some() {} });

        // `managed_config`'s background task owns the `watch::Sender` pair
        // directly; the handle itself only exists to hand out `Receiver`
        // clones, all of which have been taken above, so it can be dropped
        // here without stopping anything.

        *self.running.lock().expect("running lock poisoned") = Some(RunningState {
            cancel,
            monitor,
            pool_handle,
        });

        info!(owner_id = %self.owner_id, "task scheduler started");
        Ok(())
    }

    /// Cancel the claim loop and all in-flight runners.
    pub fn stop(&self) {
        if let Some(state) = self.running.lock().expect("running lock poisoned").take() {
            state.pool_handle.cancel_running_tasks();
            state.cancel.cancel();
        }
    }
}

async fn run_middleware(middleware: Middleware, mut events: broadcast::Receiver<Event>) {
    loop {
        match events.recv().await {
            Ok(event) => middleware(&event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn reconcile_pool_capacity(
    pool_handle: Arc<TaskPool>,
    mut max_workers: tokio::sync::watch::Receiver<usize>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = max_workers.changed() => {
                if changed.is_err() {
                    return;
                }
                pool_handle.resize(*max_workers.borrow());
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_claim_cycle(
    pool: &PgPool,
    owner_id: &str,
    requested_ids: Vec<String>,
    store: &BufferedStore,
    dictionary: &Arc<TaskTypeDictionary>,
    events: &broadcast::Sender<Event>,
    pool_handle: &Arc<TaskPool>,
    store_errors: &broadcast::Sender<StoreError>,
    cancel: &CancellationToken,
) {
    // Bound the claim size to actual free capacity: claiming more than the
    // pool can run leaves the excess stuck in `claiming` (TaskPool::run
    // can't acquire a permit for it) until its lease expires, churning
    // `attempts` every cycle for no work done -- the pool is not a queue.
    // The `.max(1)` floor only applies when there are explicit `runNow` ids
    // to service -- a plain timer tick with a full pool should claim
    // nothing rather than force at least one claim.
    let available = pool_handle.available_workers();
    let size = if requested_ids.is_empty() {
        available
    } else {
        available.max(requested_ids.len()).max(1)
    } as i64;

    if size == 0 {
        return;
    }

    let claim = ClaimRequest {
        size,
        claim_ownership_until: Utc::now() + CLAIM_LEASE,
        claim_tasks_by_id: requested_ids,
        owner_id: owner_id.to_string(),
    };

    let claimed = match tasks::claim_available(pool, &claim).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "claim cycle failed");
            let _ = store_errors.send(e);
            return;
        }
    };

    let mut runners = Vec::with_capacity(claimed.docs.len());
    for doc in claimed.docs {
        let _ = events.send(Event::ok(doc.id.clone(), EventKind::Claim));
        let store = store.clone();
        let dictionary = dictionary.clone();
        let events = events.clone();
        let task_cancel = cancel.child_token();
        runners.push(async move {
            runner::run_task(store, doc, dictionary, events, task_cancel).await;
        });
    }

    pool_handle.run(runners).await;
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: StdMutex<()> = StdMutex::new(());

    #[test]
    fn default_matches_documented_values() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.max_workers, 10);
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.max_poll_inactivity_cycles, 3);
    }

    #[test]
    fn from_env_falls_back_to_default_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("SCHEDULER_MAX_WORKERS");
        env::remove_var("SCHEDULER_POLL_INTERVAL_MS");
        env::remove_var("SCHEDULER_MAX_POLL_INACTIVITY_CYCLES");

        let cfg = SchedulerConfig::from_env();
        assert_eq!(cfg.max_workers, SchedulerConfig::default().max_workers);
        assert_eq!(cfg.poll_interval, SchedulerConfig::default().poll_interval);
    }

    #[test]
    fn from_env_reads_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("SCHEDULER_MAX_WORKERS", "42");
        env::set_var("SCHEDULER_POLL_INTERVAL_MS", "250");
        env::set_var("SCHEDULER_MAX_POLL_INACTIVITY_CYCLES", "7");

        let cfg = SchedulerConfig::from_env();
        assert_eq!(cfg.max_workers, 42);
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.max_poll_inactivity_cycles, 7);

        env::remove_var("SCHEDULER_MAX_WORKERS");
        env::remove_var("SCHEDULER_POLL_INTERVAL_MS");
        env::remove_var("SCHEDULER_MAX_POLL_INACTIVITY_CYCLES");
    }

    #[test]
    fn new_sets_fields_explicitly() {
        let cfg = SchedulerConfig::new(4, Duration::from_millis(50), 9);
        assert_eq!(cfg.max_workers, 4);
        assert_eq!(cfg.poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.max_poll_inactivity_cycles, 9);
    }
}
