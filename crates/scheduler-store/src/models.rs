//! Row types and enums persisted in the `tasks` table.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a task document.
///
/// A task is eligible to be claimed iff `status` is `Idle`, `Claiming`, or
/// `Running` *and* `run_at <= now` *and* (`status = Idle` or `retry_at <=
/// now`). The latter clause reclaims abandoned leases from `Claiming` or
/// `Running` tasks whose lease has expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Claiming,
    Running,
    Failed,
}

impl TaskStatus {
    /// Ordering used within a claim: `Claiming` < `Idle` < `Running` <
    /// `Failed`, so that tasks whose lease has expired (`Claiming`/`Running`
    /// with `retry_at <= now`) are reclaimed ahead of fresh `Idle` work.
    pub fn claim_priority(self) -> i32 {
        match self {
            Self::Claiming => 0,
            Self::Idle => 1,
            Self::Running => 2,
            Self::Failed => 3,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Running => "running",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "claiming" => Ok(Self::Claiming),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// An opaque, monotonically-advancing revision token used for optimistic
/// concurrency.
///
/// Wrapped in a newtype rather than exposed as a bare `i64` so callers
/// cannot construct or forge one outside of a round-trip through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub(crate) i64);

impl Version {
    /// Expose the raw revision number, e.g. for logging.
    pub fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ---------------------------------------------------------------------------

/// A recurring schedule: the task is rescheduled `interval` after each run
/// rather than removed on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSchedule {
    pub interval: chrono::Duration,
}

// ---------------------------------------------------------------------------

/// A persisted task document.
///
/// `params` and `state` are opaque JSON payloads the scheduler never
/// inspects; `version` and `status` are the fields the claiming protocol
/// mutates. `last_error` is ambient bookkeeping for operator visibility and
/// does not participate in any invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDocument {
    pub id: String,
    pub task_type: String,
    pub params: serde_json::Value,
    pub state: serde_json::Value,
    pub status: TaskStatus,
    pub run_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub owner_id: Option<String>,
    pub schedule: Option<RecurringSchedule>,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Raw row shape as stored by `sqlx`, used only inside the `queries` module
/// to bridge the SQL `interval`/`version` columns to [`TaskDocument`].
#[derive(Debug, Clone, FromRow)]
pub(crate) struct TaskRow {
    pub id: String,
    pub task_type: String,
    pub params: serde_json::Value,
    pub state: serde_json::Value,
    pub status: TaskStatus,
    pub run_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub owner_id: Option<String>,
    pub schedule_interval_seconds: Option<f64>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl From<TaskRow> for TaskDocument {
    fn from(row: TaskRow) -> Self {
        Self {
            id: row.id,
            task_type: row.task_type,
            params: row.params,
            state: row.state,
            status: row.status,
            run_at: row.run_at,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            retry_at: row.retry_at,
            attempts: row.attempts,
            owner_id: row.owner_id,
            schedule: row.schedule_interval_seconds.map(|secs| RecurringSchedule {
                interval: chrono::Duration::milliseconds((secs * 1000.0).round() as i64),
            }),
            version: Version(row.version),
            created_at: row.created_at,
            last_error: row.last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Idle,
            TaskStatus::Claiming,
            TaskStatus::Running,
            TaskStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn claim_priority_orders_reclaimable_states_first() {
        assert!(TaskStatus::Claiming.claim_priority() < TaskStatus::Idle.claim_priority());
        assert!(TaskStatus::Idle.claim_priority() < TaskStatus::Running.claim_priority());
        assert!(TaskStatus::Running.claim_priority() < TaskStatus::Failed.claim_priority());
    }

    #[test]
    fn version_display_shows_raw_value() {
        let v = Version(7);
        assert_eq!(v.to_string(), "v7");
        assert_eq!(v.raw(), 7);
    }
}
