//! End-to-end lifecycle tests against a real Postgres-backed `TaskScheduler`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use scheduler_core::{
    EventKind, ExecutorOutput, FnExecutor, ScheduleOptions, SchedulerConfig, SchedulerError,
    TaskExecutionContext, TaskExecutor, TaskInstance, TaskScheduler, TaskTypeDefinition,
};
use scheduler_store::{RecurringSchedule, TaskStatus};
use scheduler_test_utils::{create_test_db, drop_test_db};
use serde_json::json;
use sqlx::PgPool;

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

/// Polls `get` until the task disappears (removed) or `deadline` elapses.
async fn wait_until_removed(scheduler: &TaskScheduler, task_id: &str, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        match scheduler.get(task_id).await {
            Err(SchedulerError::NotFound { .. }) => return true,
            _ => {
                if start.elapsed() > deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
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
async fn schedule_non_recurring_runs_once_then_removed() {
    let harness = TestHarness::new().await;
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = runs.clone();

    let scheduler = Arc::new(TaskScheduler::new(harness.pool.clone(), TestHarness::fast_config()));
    scheduler
        .register_task_definitions([(
            "sample".to_string(),
            TaskTypeDefinition::new(
                "sample",
                Duration::from_secs(5),
                3,
                Arc::new(FnExecutor::new(move |_ctx: TaskExecutionContext| {
                    let runs = runs_clone.clone();
                    async move {
                        let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
                        Ok(ExecutorOutput {
                            state: json!({ "count": n }),
                            run_at: None,
                        })
                    }
                })),
            ),
        )])
        .unwrap();

    scheduler.start().await.unwrap();

    scheduler
        .schedule(
            TaskInstance {
                id: Some("task-once".to_string()),
                task_type: "sample".to_string(),
                params: json!({}),
                state: json!({}),
                schedule: None,
                run_at: None,
            },
            ScheduleOptions::default(),
        )
        .await
        .unwrap();

    assert!(
        wait_until_removed(&scheduler, "task-once", Duration::from_secs(2)).await,
        "non-recurring task should be removed after a successful run"
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    scheduler.stop();
    harness.teardown().await;
}

#[tokio::test]
async fn recurring_task_reschedules_by_interval() {
    let harness = TestHarness::new().await;

    let scheduler = Arc::new(TaskScheduler::new(harness.pool.clone(), TestHarness::fast_config()));
    scheduler
        .register_task_definitions([(
            "recurring".to_string(),
            TaskTypeDefinition::new(
                "recurring",
                Duration::from_secs(5),
                3,
                Arc::new(FnExecutor::new(|_ctx: TaskExecutionContext| async move {
                    Ok(ExecutorOutput {
                        state: json!({}),
                        run_at: None,
                    })
                })),
            ),
        )])
        .unwrap();

    scheduler.start().await.unwrap();

    let interval = chrono::Duration::seconds(2);
    let before = Utc::now();
    scheduler
        .schedule(
            TaskInstance {
                id: Some("task-recurring".to_string()),
                task_type: "recurring".to_string(),
                params: json!({}),
                state: json!({}),
                schedule: Some(RecurringSchedule { interval }),
                run_at: None,
            },
            ScheduleOptions::default(),
        )
        .await
        .unwrap();

    assert!(
        wait_until_status(&scheduler, "task-recurring", TaskStatus::Idle, Duration::from_secs(2)).await,
        "recurring task should return to idle after its first run"
    );

    let after = scheduler.get("task-recurring").await.unwrap();
    let expected = before + interval;
    let diff = (after.run_at - expected).num_milliseconds().abs();
    assert!(
        diff < 1500,
        "rescheduled run_at {} should land near {} (diff {}ms)",
        after.run_at,
        expected,
        diff
    );
    assert_eq!(after.attempts, 0);

    scheduler.stop();
    harness.teardown().await;
}

struct FailingExecutor;

#[async_trait]
impl TaskExecutor for FailingExecutor {
    async fn execute(&self, _ctx: TaskExecutionContext) -> anyhow::Result<ExecutorOutput> {
        Err(anyhow::anyhow!("synthetic executor failure"))
    }
}

#[tokio::test]
async fn failed_run_under_max_attempts_reschedules_with_backoff() {
    let harness = TestHarness::new().await;

    let scheduler = Arc::new(TaskScheduler::new(harness.pool.clone(), TestHarness::fast_config()));
    scheduler
        .register_task_definitions([(
            "flaky".to_string(),
            TaskTypeDefinition::new("flaky", Duration::from_secs(5), 3, Arc::new(FailingExecutor)),
        )])
        .unwrap();

    scheduler.start().await.unwrap();

    scheduler
        .schedule(
            TaskInstance {
                id: Some("task-flaky".to_string()),
                task_type: "flaky".to_string(),
                params: json!({}),
                state: json!({}),
                schedule: None,
                run_at: None,
            },
            ScheduleOptions::default(),
        )
        .await
        .unwrap();

    assert!(
        wait_until_status(&scheduler, "task-flaky", TaskStatus::Idle, Duration::from_secs(2)).await,
        "a single failure under max_attempts should reschedule, not fail terminally"
    );

    let doc = scheduler.get("task-flaky").await.unwrap();
    assert_eq!(doc.attempts, 1);
    assert!(doc.run_at > Utc::now());
    assert!(doc.last_error.as_deref().unwrap_or_default().contains("synthetic"));

    scheduler.stop();
    harness.teardown().await;
}

#[tokio::test]
async fn ensure_scheduled_is_idempotent_on_conflict() {
    let harness = TestHarness::new().await;
    let scheduler = Arc::new(TaskScheduler::new(harness.pool.clone(), TestHarness::fast_config()));
    scheduler
        .register_task_definitions(Vec::<(String, TaskTypeDefinition)>::new())
        .unwrap();
    scheduler.start().await.unwrap();

    let instance = || TaskInstance {
        id: Some("task-dup".to_string()),
        task_type: "sample".to_string(),
        params: json!({}),
        state: json!({}),
        schedule: None,
        run_at: Some(Utc::now() + chrono::Duration::hours(1)),
    };

    let first = scheduler
        .ensure_scheduled(instance(), ScheduleOptions::default())
        .await
        .unwrap();
    let second = scheduler
        .ensure_scheduled(instance(), ScheduleOptions::default())
        .await
        .unwrap();

    assert_eq!(first.id, "task-dup");
    assert_eq!(second.id, "task-dup");

    scheduler.stop();
    harness.teardown().await;
}

#[tokio::test]
async fn unknown_task_type_fails_terminally_without_retry() {
    let harness = TestHarness::new().await;
    let scheduler = Arc::new(TaskScheduler::new(harness.pool.clone(), TestHarness::fast_config()));
    scheduler
        .register_task_definitions(Vec::<(String, TaskTypeDefinition)>::new())
        .unwrap();
    scheduler.start().await.unwrap();

    scheduler
        .schedule(
            TaskInstance {
                id: Some("task-unknown".to_string()),
                task_type: "does-not-exist".to_string(),
                params: json!({}),
                state: json!({}),
                schedule: None,
                run_at: None,
            },
            ScheduleOptions::default(),
        )
        .await
        .unwrap();

    assert!(
        wait_until_status(&scheduler, "task-unknown", TaskStatus::Failed, Duration::from_secs(2)).await,
        "an unregistered task type should mark the task failed rather than retry forever"
    );

    scheduler.stop();
    harness.teardown().await;
}

#[tokio::test]
async fn subscribe_stream_observes_claim_then_run_for_one_task() {
    let harness = TestHarness::new().await;
    let scheduler = Arc::new(TaskScheduler::new(harness.pool.clone(), TestHarness::fast_config()));
    scheduler
        .register_task_definitions([(
            "sample".to_string(),
            TaskTypeDefinition::new(
                "sample",
                Duration::from_secs(5),
                3,
                Arc::new(FnExecutor::new(|_ctx: TaskExecutionContext| async move {
                    Ok(ExecutorOutput {
                        state: json!({}),
                        run_at: None,
                    })
                })),
            ),
        )])
        .unwrap();

    let mut stream = scheduler.subscribe_stream();
    scheduler.start().await.unwrap();

    scheduler
        .schedule(
            TaskInstance {
                id: Some("task-stream".to_string()),
                task_type: "sample".to_string(),
                params: json!({}),
                state: json!({}),
                schedule: None,
                run_at: None,
            },
            ScheduleOptions::default(),
        )
        .await
        .unwrap();

    let mut seen_claim = false;
    let mut seen_run = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline && !(seen_claim && seen_run) {
        let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), stream.next()).await
        else {
            continue;
        };
        if event.task_id != "task-stream" {
            continue;
        }
        match event.kind {
            EventKind::Claim => seen_claim = true,
            EventKind::Run => seen_run = true,
            _ => {}
        }
    }

    assert!(seen_claim, "stream should have observed a Claim event");
    assert!(seen_run, "stream should have observed a Run event");

    scheduler.stop();
    harness.teardown().await;
}
