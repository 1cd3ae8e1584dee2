//! Tests for the `runNow` preemption path and its coupling to the event
//! stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{
    ExecutorOutput, ScheduleOptions, SchedulerConfig, SchedulerError, TaskExecutionContext,
    TaskExecutor, TaskInstance, TaskScheduler, TaskTypeDefinition,
};
use scheduler_store::{RecurringSchedule, TaskStatus};
use scheduler_test_utils::{create_test_db, drop_test_db};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::Semaphore;

struct TestHarness {
    pool: PgPool,
    db_name: String,
}

impl TestHarness {
    async fn new() -> Self {
        let (pool, db_name) = create_test_db().await;
        Self { pool, db_name }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            max_workers: 4,
            poll_interval: Duration::from_millis(50),
            max_poll_inactivity_cycles: 5,
        }
    }

    async fn teardown(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

async fn wait_until_status(
    scheduler: &TaskScheduler,
    task_id: &str,
    status: TaskStatus,
    deadline: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if let Ok(doc) = scheduler.get(task_id).await {
            if doc.status == status {
                return true;
            }
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn run_now_on_missing_task_fails_fast() {
    let harness = TestHarness::new().await;
    let scheduler = Arc::new(TaskScheduler::new(harness.pool.clone(), TestHarness::fast_config()));
    scheduler
        .register_task_definitions(Vec::<(String, TaskTypeDefinition)>::new())
        .unwrap();
    scheduler.start().await.unwrap();

    let err = scheduler.run_now("nonexistent").await.unwrap_err();
    assert!(matches!(err, SchedulerError::NotFound { .. }));

    scheduler.stop();
    harness.teardown().await;
}

/// An executor gated by a `Semaphore` so the test can control exactly when
/// one invocation completes, to exercise the "already running" path.
struct GatedExecutor {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl TaskExecutor for GatedExecutor {
    async fn execute(&self, ctx: TaskExecutionContext) -> anyhow::Result<ExecutorOutput> {
        tokio::select! {
            _ = self.gate.acquire() => {}
            _ = ctx.cancel.cancelled() => {}
        }
        Ok(ExecutorOutput {
            state: json!({}),
            run_at: None,
        })
    }
}

#[tokio::test]
async fn run_now_on_running_task_fails_then_succeeds_after_release() {
    let harness = TestHarness::new().await;
    let scheduler = Arc::new(TaskScheduler::new(harness.pool.clone(), TestHarness::fast_config()));

    let gate = Arc::new(Semaphore::new(0));
    scheduler
        .register_task_definitions([(
            "gated".to_string(),
            TaskTypeDefinition::new(
                "gated",
                Duration::from_secs(10),
                3,
                Arc::new(GatedExecutor { gate: gate.clone() }),
            ),
        )])
        .unwrap();
    scheduler.start().await.unwrap();

    // Recurring so the document survives its first run for a second runNow.
    scheduler
        .schedule(
            TaskInstance {
                id: Some("task-gated".to_string()),
                task_type: "gated".to_string(),
                params: json!({}),
                state: json!({}),
                schedule: Some(RecurringSchedule {
                    interval: chrono::Duration::hours(1),
                }),
                run_at: None,
            },
            ScheduleOptions::default(),
        )
        .await
        .unwrap();

    assert!(
        wait_until_status(&scheduler, "task-gated", TaskStatus::Running, Duration::from_secs(2)).await,
        "the initial poll cycle should have claimed and started the task"
    );

    let err = scheduler.run_now("task-gated").await.unwrap_err();
    assert!(matches!(err, SchedulerError::CurrentlyRunning { .. }));

    // Release the first invocation and wait for it to settle back to idle.
    gate.add_permits(1);
    assert!(
        wait_until_status(&scheduler, "task-gated", TaskStatus::Idle, Duration::from_secs(2)).await,
        "releasing the gate should let the first run complete and reschedule"
    );

    // A second runNow should now claim it despite run_at being an hour out.
    gate.add_permits(1);
    scheduler.run_now("task-gated").await.unwrap();

    scheduler.stop();
    harness.teardown().await;
}

#[tokio::test]
async fn run_now_preempts_a_future_recurring_task() {
    let harness = TestHarness::new().await;
    let scheduler = Arc::new(TaskScheduler::new(harness.pool.clone(), TestHarness::fast_config()));

    scheduler
        .register_task_definitions([(
            "noop".to_string(),
            TaskTypeDefinition::new(
                "noop",
                Duration::from_secs(5),
                3,
                Arc::new(scheduler_core::FnExecutor::new(|_ctx: TaskExecutionContext| async move {
                    Ok(ExecutorOutput {
                        state: json!({}),
                        run_at: None,
                    })
                })),
            ),
        )])
        .unwrap();
    scheduler.start().await.unwrap();

    // Scheduled an hour out: the timer alone would never claim this in the
    // lifetime of this test.
    scheduler
        .ensure_scheduled(
            TaskInstance {
                id: Some("task-future".to_string()),
                task_type: "noop".to_string(),
                params: json!({}),
                state: json!({}),
                schedule: Some(RecurringSchedule {
                    interval: chrono::Duration::hours(1),
                }),
                run_at: Some(Utc::now() + chrono::Duration::hours(1)),
            },
            ScheduleOptions::default(),
        )
        .await
        .unwrap();

    scheduler.run_now("task-future").await.unwrap();

    scheduler.stop();
    harness.teardown().await;
}
