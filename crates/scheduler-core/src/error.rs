//! Facade-level error taxonomy.
//!
//! Wraps [`scheduler_store::StoreError`] with the additional failure modes
//! that only make sense above the store: requests rejected before they ever
//! reach it, and calls made outside the `setup -> start -> stop` lifecycle.

use scheduler_store::StoreError;
use thiserror::Error;

/// Errors surfaced at the `TaskScheduler` public API boundary.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// The underlying store rejected or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// `taskType` has no entry in the `TaskTypeDictionary` at claim time.
    #[error("unknown task type: {task_type}")]
    UnknownTaskType { task_type: String },

    /// `runNow` found the task already in `running` state.
    #[error("task {task_id} is currently running")]
    CurrentlyRunning { task_id: String },

    /// `runNow` or `get` found no document with the given id.
    #[error("task {task_id} does not exist")]
    NotFound { task_id: String },

    /// `schedule` was called with a caller-chosen id that already exists.
    #[error("task {task_id} already exists")]
    AlreadyExists { task_id: String },

    /// The poller's explicit-request buffer was full when `runNow` enqueued.
    #[error("request capacity reached for task {task_id}")]
    RequestCapacityReached { task_id: String },

    /// An operation that requires `start()` was called before it ran.
    #[error("scheduler has not been started")]
    NotInitialized,

    /// `register_task_definitions`/`add_middleware` called after `start()`.
    #[error("scheduler already started, setup is frozen")]
    AlreadyStarted,

    /// The executor associated with a task type failed.
    #[error("executor error for task {task_id}: {detail}")]
    ExecutorError { task_id: String, detail: String },

    /// The executor did not complete within the type's configured timeout.
    #[error("executor timed out for task {task_id}")]
    ExecutorTimeout { task_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_message_preserved() {
        let err = SchedulerError::from(StoreError::NotFound {
            task_id: "t1".to_string(),
        });
        assert_eq!(err.to_string(), "task t1 not found");
    }

    #[test]
    fn unknown_task_type_message() {
        let err = SchedulerError::UnknownTaskType {
            task_type: "sample".to_string(),
        };
        assert_eq!(err.to_string(), "unknown task type: sample");
    }
}
