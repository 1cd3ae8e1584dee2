//! `TaskRunner` -- the per-task state machine: mark-running, execute with
//! timeout, compute the next outcome, persist.
//!
//! Directly modeled on `gator-core::lifecycle::run_agent_lifecycle`: a free
//! async function that never propagates a failure out of the pool. Every
//! failure mode -- version conflict, unknown task type, executor error,
//! executor timeout -- is converted into an event publish instead, the same
//! way the lifecycle function catches executor/timeout errors and turns
//! them into dispatch-layer state transitions rather than bubbling an `Err`
//! out of the orchestrator loop.

use std::sync::Arc;

use chrono::Utc;
use scheduler_store::{StoreError, TaskDocument, TaskStatus};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::{compute_backoff, DEFAULT_BASE};
use crate::buffered_store::BufferedStore;
use crate::dictionary::{TaskExecutionContext, TaskTypeDictionary};
use crate::error::SchedulerError;
use crate::types::{Event, EventKind, TaskInstance};

/// Default ceiling for the backoff computation when a task type does not
/// otherwise constrain it.
const DEFAULT_MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Run one claimed document through its full lifecycle: mark-running,
/// execute, persist. Takes ownership of `doc` -- the runner is the sole
/// in-memory driver of this claim.
pub async fn run_task(
    store: BufferedStore,
    doc: TaskDocument,
    dictionary: Arc<TaskTypeDictionary>,
    events: broadcast::Sender<Event>,
    cancel: CancellationToken,
) {
    let task_id = doc.id.clone();

    let Some(definition) = dictionary.get(&doc.task_type) else {
        let task_type = doc.task_type.clone();
        warn!(task_id = %task_id, task_type = %task_type, "unknown task type at claim time");
        let mut failed = doc;
        failed.status = TaskStatus::Failed;
        failed.last_error = Some(format!("unknown task type: {task_type}"));
        match store.update(failed).await {
            Ok(_) => {
                let _ = events.send(Event::err(
                    task_id.clone(),
                    EventKind::Run,
                    SchedulerError::UnknownTaskType { task_type },
                ));
            }
            Err(e) => {
                let _ = events.send(Event::err(task_id.clone(), EventKind::Run, e.into()));
            }
        }
        return;
    };

    // markRunning: optimistic transition to `running`.
    let mut running_doc = doc.clone();
    running_doc.status = TaskStatus::Running;
    running_doc.started_at = Some(Utc::now());

    let running_doc = match store.update(running_doc).await {
        Ok(updated) => {
            let _ = events.send(Event::ok(task_id.clone(), EventKind::MarkRunning));
            updated
        }
        Err(e @ StoreError::VersionConflict { .. }) => {
            // Another instance reclaimed this task after our lease expired.
            info!(task_id = %task_id, "mark-running lost the version race, abandoning claim");
            let _ = events.send(Event::err(task_id.clone(), EventKind::MarkRunning, e.into()));
            return;
        }
        Err(e) => {
            let _ = events.send(Event::err(task_id.clone(), EventKind::MarkRunning, e.into()));
            return;
        }
    };

    // execute: bounded by the type's configured timeout.
    let ctx = TaskExecutionContext {
        task_instance: TaskInstance {
            id: Some(running_doc.id.clone()),
            task_type: running_doc.task_type.clone(),
            params: running_doc.params.clone(),
            state: running_doc.state.clone(),
            schedule: running_doc.schedule,
            run_at: Some(running_doc.run_at),
        },
        cancel: cancel.clone(),
    };

    let outcome = tokio::time::timeout(definition.timeout, definition.executor.execute(ctx)).await;

    let execute_result: Result<crate::types::ExecutorOutput, SchedulerError> = match outcome {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(SchedulerError::ExecutorError {
            task_id: task_id.clone(),
            detail: e.to_string(),
        }),
        Err(_elapsed) => Err(SchedulerError::ExecutorTimeout {
            task_id: task_id.clone(),
        }),
    };

    // persistOutcome, through the buffered store.
    let next = compute_next_document(&running_doc, &execute_result, definition.max_attempts);

    match next {
        NextAction::Remove => match store.remove(&running_doc.id).await {
            Ok(()) => {
                let _ = events.send(Event::ok(task_id.clone(), EventKind::Run));
            }
            Err(e) => {
                let _ = events.send(Event::err(task_id.clone(), EventKind::Run, e.into()));
            }
        },
        NextAction::Persist(next_doc) => match store.update(next_doc).await {
            Ok(_) => {
                let payload = match &execute_result {
                    Ok(_) => Event::ok(task_id.clone(), EventKind::Run),
                    Err(e) => Event::err(task_id.clone(), EventKind::Run, e.clone()),
                };
                let _ = events.send(payload);
            }
            Err(e @ StoreError::VersionConflict { .. }) => {
                info!(task_id = %task_id, "persist-outcome lost the version race, dropping outcome");
                let _ = events.send(Event::err(task_id.clone(), EventKind::Run, e.into()));
            }
            Err(e) => {
                let _ = events.send(Event::err(task_id.clone(), EventKind::Run, e.into()));
            }
        },
    }
}

enum NextAction {
    Remove,
    Persist(TaskDocument),
}

fn compute_next_document(
    doc: &TaskDocument,
    execute_result: &Result<crate::types::ExecutorOutput, SchedulerError>,
    max_attempts: u32,
) -> NextAction {
    let now = Utc::now();
    let mut next = doc.clone();
    next.owner_id = None;
    next.retry_at = None;

    match (execute_result, doc.schedule) {
        (Ok(output), Some(schedule)) => {
            next.status = TaskStatus::Idle;
            next.attempts = 0;
            next.state = output.state.clone();
            next.run_at = output.run_at.unwrap_or(now + schedule.interval);
            next.last_error = None;
            NextAction::Persist(next)
        }
        (Ok(_), None) => NextAction::Remove,
        (Err(err), Some(schedule)) => {
            // `claim_available` already incremented `attempts` for this run
            // (scheduler-store's `queries::tasks::claim_available`); `next`
            // is cloned from `doc`, so `next.attempts` already reflects this
            // run's count without adding another here.
            next.last_error = Some(err.to_string());
            if (next.attempts as u32) < max_attempts {
                next.status = TaskStatus::Idle;
                next.run_at = now + chrono::Duration::from_std(compute_backoff(
                    next.attempts as u32,
                    DEFAULT_BASE,
                    DEFAULT_MAX_BACKOFF,
                ))
                .unwrap_or_default();
            } else {
                // Recurring tasks never reach terminal `failed`.
                next.status = TaskStatus::Idle;
                next.run_at = now + schedule.interval;
                next.attempts = 0;
            }
            NextAction::Persist(next)
        }
        (Err(err), None) => {
            // Same as above: `attempts` was already bumped at claim time.
            next.last_error = Some(err.to_string());
            if (next.attempts as u32) < max_attempts {
                next.status = TaskStatus::Idle;
                next.run_at = now + chrono::Duration::from_std(compute_backoff(
                    next.attempts as u32,
                    DEFAULT_BASE,
                    DEFAULT_MAX_BACKOFF,
                ))
                .unwrap_or_default();
            } else {
                next.status = TaskStatus::Failed;
            }
            NextAction::Persist(next)
        }
    }
}
