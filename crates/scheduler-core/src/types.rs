//! Shared value types that cross component boundaries: the event stream
//! payload, the scheduling request shape, and the executor's output.

use chrono::{DateTime, Utc};
use scheduler_store::RecurringSchedule;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// A two-variant result sum, distinct from [`std::result::Result`] only in
/// name: `Event` values need to be `Clone` to broadcast, and `Result<T, E>`
/// would additionally require `T: Clone`, which the opaque executor state
/// payload does not always provide for free.
#[derive(Debug, Clone)]
pub enum Outcome<T, E> {
    Ok(T),
    Err(E),
}

impl<T, E> Outcome<T, E> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Outcome::Err(_))
    }
}

/// Which phase of a task's lifecycle an [`Event`] reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A claim round trip completed (or failed) for this task.
    Claim,
    /// The runner's optimistic transition to `running` completed.
    MarkRunning,
    /// The executor ran and its outcome was persisted.
    Run,
    /// An explicit `runNow` request was accepted or rejected by the poller.
    RunRequest,
}

/// One lifecycle event published on the facade's broadcast stream.
///
/// Events for a single `task_id` are published in program order within one
/// instance (`Claim -> MarkRunning -> Run`); no ordering is guaranteed
/// across instances.
#[derive(Debug, Clone)]
pub struct Event {
    pub task_id: String,
    pub kind: EventKind,
    pub payload: Outcome<(), SchedulerError>,
}

impl Event {
    pub fn ok(task_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            payload: Outcome::Ok(()),
        }
    }

    pub fn err(task_id: impl Into<String>, kind: EventKind, error: SchedulerError) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            payload: Outcome::Err(error),
        }
    }

    /// A terminal event is `Run(Ok)`, or any `Err` at `Claim`/`RunRequest`/
    /// `Run`. `MarkRunning(Ok)` is never terminal -- `runNow` keeps waiting.
    pub fn is_terminal(&self) -> bool {
        match (self.kind, &self.payload) {
            (EventKind::Run, Outcome::Ok(())) => true,
            (EventKind::MarkRunning, Outcome::Ok(())) => false,
            (_, Outcome::Err(_)) => true,
            _ => false,
        }
    }
}

/// Caller-supplied description of a task to schedule, before the store
/// assigns bookkeeping fields (`scheduledAt`, `version`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Stable id. Generated with `Uuid::new_v4` by `schedule` if absent.
    pub id: Option<String>,
    pub task_type: String,
    pub params: serde_json::Value,
    #[serde(default)]
    pub state: serde_json::Value,
    pub schedule: Option<RecurringSchedule>,
    /// Defaults to now when absent.
    pub run_at: Option<DateTime<Utc>>,
}

/// Options accepted by `schedule`/`ensureScheduled`. Reserved for
/// caller-supplied overrides beyond the task instance itself; currently
/// empty, kept as a distinct type so new fields don't become a breaking
/// signature change.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {}

/// What an executor returns on success.
#[derive(Debug, Clone)]
pub struct ExecutorOutput {
    /// The opaque state persisted back into the task document.
    pub state: serde_json::Value,
    /// Overrides the next `runAt` for this run only. For recurring tasks,
    /// the override applies once; subsequent runs revert to
    /// `schedule.interval`.
    pub run_at: Option<DateTime<Utc>>,
}

/// Derived health level, exposed over whatever admin transport the host
/// provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unavailable,
}
