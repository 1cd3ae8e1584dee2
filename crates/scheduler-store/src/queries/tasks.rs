//! Query functions implementing the `TaskStore` contract.
//!
//! Every function routes its driver-level error path through
//! [`StoreError::classify`] rather than letting a raw `sqlx::Error` leak to
//! callers.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::errors::StoreError;
use crate::models::{TaskDocument, TaskRow, TaskStatus};

/// Request shape for [`claim_available`].
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Maximum number of tasks to claim in this round trip.
    pub size: i64,
    /// The instant this instance's lease expires if not renewed.
    pub claim_ownership_until: DateTime<Utc>,
    /// Task IDs to prioritize ahead of the normal ordering (explicit
    /// `runNow` requests).
    pub claim_tasks_by_id: Vec<String>,
    /// This instance's identifier, written to `owner_id`.
    pub owner_id: String,
}

/// Result of a claim round trip.
#[derive(Debug, Clone)]
pub struct ClaimResult {
    /// The documents actually updated by this claim.
    pub docs: Vec<TaskDocument>,
    /// The store's own count of updated rows. Compared against
    /// `docs.len()` by the caller, which warns on mismatch --
    /// in this single-round-trip Postgres implementation the two can never
    /// structurally diverge, but the field is kept to preserve the
    /// store-agnostic contract.
    pub claimed_tasks: u64,
}

/// Atomically claim up to `size` eligible tasks.
///
/// A single `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED) RETURNING`
/// statement selects and locks eligible rows -- ordered so that IDs in
/// `claim_tasks_by_id` come first, then by claim priority (reclaiming
/// expired `claiming`/`running` leases before fresh `idle` work), then by
/// `run_at` -- and in the same round trip sets `status = claiming`,
/// `owner_id`, `retry_at`, `started_at`, and increments `attempts`.
///
/// An id listed in `claim_tasks_by_id` bypasses the `run_at <= now()`
/// eligibility clause: that is the whole point of an explicit `runNow`
/// request preempting the normal polling cycle for a task scheduled in the
/// future. The lease clause (`status = 'idle' OR retry_at <= now()`) still
/// applies, so a request cannot steal a lease another instance legitimately
/// holds.
pub async fn claim_available(pool: &PgPool, req: &ClaimRequest) -> Result<ClaimResult, StoreError> {
    let rows: Vec<TaskRow> = sqlx::query_as(
        r#"
        WITH candidates AS (
            SELECT id
            FROM tasks
            WHERE (run_at <= now() OR id = ANY($1))
              AND status IN ('idle', 'claiming', 'running')
              AND (status = 'idle' OR retry_at <= now())
            ORDER BY
                (id = ANY($1)) DESC,
                CASE status
                    WHEN 'claiming' THEN 0
                    WHEN 'idle' THEN 1
                    WHEN 'running' THEN 2
                    ELSE 3
                END,
                run_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE tasks t
        SET status = 'claiming',
            owner_id = $3,
            retry_at = $4,
            started_at = now(),
            attempts = attempts + 1,
            version = version + 1
        FROM candidates c
        WHERE t.id = c.id
        RETURNING
            t.id, t.task_type, t.params, t.state, t.status, t.run_at,
            t.scheduled_at, t.started_at, t.retry_at, t.attempts, t.owner_id,
            EXTRACT(EPOCH FROM t.schedule_interval)::float8 AS schedule_interval_seconds,
            t.version, t.created_at, t.last_error
        "#,
    )
    .bind(&req.claim_tasks_by_id)
    .bind(req.size)
    .bind(&req.owner_id)
    .bind(req.claim_ownership_until)
    .fetch_all(pool)
    .await
    .map_err(StoreError::classify)?;

    let claimed_tasks = rows.len() as u64;
    let docs = rows.into_iter().map(TaskDocument::from).collect();

    Ok(ClaimResult { docs, claimed_tasks })
}

/// Optimistic write against `doc.version`.
///
/// Writes every mutable field from `doc` and bumps `version`, but only if
/// the row's current `version` still matches `doc.version`. Returns
/// [`StoreError::VersionConflict`] when another instance has already moved
/// the row on.
pub async fn update(pool: &PgPool, doc: &TaskDocument) -> Result<TaskDocument, StoreError> {
    let schedule_seconds = doc
        .schedule
        .map(|s| s.interval.num_milliseconds() as f64 / 1000.0);

    let row: Option<TaskRow> = sqlx::query_as(
        r#"
        UPDATE tasks
        SET task_type = $1,
            params = $2,
            state = $3,
            status = $4,
            run_at = $5,
            scheduled_at = $6,
            started_at = $7,
            retry_at = $8,
            attempts = $9,
            owner_id = $10,
            schedule_interval = CASE WHEN $11::float8 IS NULL THEN NULL ELSE make_interval(secs => $11) END,
            last_error = $12,
            version = version + 1
        WHERE id = $13 AND version = $14
        RETURNING
            id, task_type, params, state, status, run_at, scheduled_at,
            started_at, retry_at, attempts, owner_id,
            EXTRACT(EPOCH FROM schedule_interval)::float8 AS schedule_interval_seconds,
            version, created_at, last_error
        "#,
    )
    .bind(&doc.task_type)
    .bind(&doc.params)
    .bind(&doc.state)
    .bind(doc.status)
    .bind(doc.run_at)
    .bind(doc.scheduled_at)
    .bind(doc.started_at)
    .bind(doc.retry_at)
    .bind(doc.attempts)
    .bind(&doc.owner_id)
    .bind(schedule_seconds)
    .bind(&doc.last_error)
    .bind(&doc.id)
    .bind(doc.version.raw())
    .fetch_optional(pool)
    .await
    .map_err(StoreError::classify)?;

    row.map(TaskDocument::from).ok_or_else(|| StoreError::VersionConflict {
        task_id: doc.id.clone(),
    })
}

/// Insert a new task document (used by `schedule`/`ensureScheduled`).
///
/// `ON CONFLICT (id) DO NOTHING` makes the caller's "does a document with
/// this id already exist" check observable as `Ok(None)` so
/// `ensureScheduled` can treat it as idempotent success.
#[allow(clippy::too_many_arguments)]
pub async fn insert_task(
    pool: &PgPool,
    id: &str,
    task_type: &str,
    params: &serde_json::Value,
    state: &serde_json::Value,
    run_at: DateTime<Utc>,
    schedule_interval: Option<chrono::Duration>,
) -> Result<Option<TaskDocument>, StoreError> {
    let schedule_seconds = schedule_interval.map(|d| d.num_milliseconds() as f64 / 1000.0);

    let row: Option<TaskRow> = sqlx::query_as(
        r#"
        INSERT INTO tasks (id, task_type, params, state, run_at, scheduled_at, schedule_interval)
        VALUES (
            $1, $2, $3, $4, $5, now(),
            CASE WHEN $6::float8 IS NULL THEN NULL ELSE make_interval(secs => $6) END
        )
        ON CONFLICT (id) DO NOTHING
        RETURNING
            id, task_type, params, state, status, run_at, scheduled_at,
            started_at, retry_at, attempts, owner_id,
            EXTRACT(EPOCH FROM schedule_interval)::float8 AS schedule_interval_seconds,
            version, created_at, last_error
        "#,
    )
    .bind(id)
    .bind(task_type)
    .bind(params)
    .bind(state)
    .bind(run_at)
    .bind(schedule_seconds)
    .fetch_optional(pool)
    .await
    .map_err(StoreError::classify)?;

    Ok(row.map(TaskDocument::from))
}

/// Idempotent delete.
pub async fn remove(pool: &PgPool, id: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(StoreError::classify)?;
    Ok(())
}

/// Fetch a single task by id.
pub async fn get(pool: &PgPool, id: &str) -> Result<Option<TaskDocument>, StoreError> {
    let row: Option<TaskRow> = sqlx::query_as(
        r#"
        SELECT id, task_type, params, state, status, run_at, scheduled_at,
               started_at, retry_at, attempts, owner_id,
               EXTRACT(EPOCH FROM schedule_interval)::float8 AS schedule_interval_seconds,
               version, created_at, last_error
        FROM tasks
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(StoreError::classify)?;

    Ok(row.map(TaskDocument::from))
}

/// Fetch only the lifecycle status of a task, used by `runNow` to
/// distinguish "currently running" from "does not exist".
pub async fn get_lifecycle(pool: &PgPool, id: &str) -> Result<Option<TaskStatus>, StoreError> {
    let row: Option<(TaskStatus,)> = sqlx::query_as("SELECT status FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(StoreError::classify)?;

    Ok(row.map(|(status,)| status))
}

/// Read-only listing options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub task_type: Option<String>,
    pub status: Option<TaskStatus>,
    pub size: i64,
    /// Keyset pagination cursor: `(run_at, id)` of the last row of the
    /// previous page.
    pub search_after: Option<(DateTime<Utc>, String)>,
}

/// Result of [`fetch`].
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub docs: Vec<TaskDocument>,
    pub search_after: Option<(DateTime<Utc>, String)>,
}

/// Apply a batch of optimistic writes in one round trip, for `BufferedStore`.
///
/// Each input document carries its own expected `version`; rows whose
/// current version no longer matches are silently excluded from the
/// `RETURNING` set rather than aborting the whole batch, so the caller can
/// tell which of its documents conflicted by checking which ids are absent
/// from the result. No cross-document ordering is implied -- this is a
/// single unordered bulk statement.
pub async fn update_many(
    pool: &PgPool,
    docs: &[TaskDocument],
) -> Result<Vec<TaskDocument>, StoreError> {
    if docs.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    let task_types: Vec<&str> = docs.iter().map(|d| d.task_type.as_str()).collect();
    let params: Vec<&serde_json::Value> = docs.iter().map(|d| &d.params).collect();
    let states: Vec<&serde_json::Value> = docs.iter().map(|d| &d.state).collect();
    let statuses: Vec<String> = docs.iter().map(|d| d.status.to_string()).collect();
    let run_ats: Vec<DateTime<Utc>> = docs.iter().map(|d| d.run_at).collect();
    let scheduled_ats: Vec<DateTime<Utc>> = docs.iter().map(|d| d.scheduled_at).collect();
    let started_ats: Vec<Option<DateTime<Utc>>> = docs.iter().map(|d| d.started_at).collect();
    let retry_ats: Vec<Option<DateTime<Utc>>> = docs.iter().map(|d| d.retry_at).collect();
    let attempts: Vec<i32> = docs.iter().map(|d| d.attempts).collect();
    let owner_ids: Vec<Option<&str>> = docs.iter().map(|d| d.owner_id.as_deref()).collect();
    let schedule_seconds: Vec<Option<f64>> = docs
        .iter()
        .map(|d| d.schedule.map(|s| s.interval.num_milliseconds() as f64 / 1000.0))
        .collect();
    let last_errors: Vec<Option<&str>> = docs.iter().map(|d| d.last_error.as_deref()).collect();
    let expected_versions: Vec<i64> = docs.iter().map(|d| d.version.raw()).collect();

    let rows: Vec<TaskRow> = sqlx::query_as(
        r#"
        UPDATE tasks t
        SET task_type = v.task_type,
            params = v.params,
            state = v.state,
            status = v.status,
            run_at = v.run_at,
            scheduled_at = v.scheduled_at,
            started_at = v.started_at,
            retry_at = v.retry_at,
            attempts = v.attempts,
            owner_id = v.owner_id,
            schedule_interval = CASE
                WHEN v.schedule_seconds IS NULL THEN NULL
                ELSE make_interval(secs => v.schedule_seconds)
            END,
            last_error = v.last_error,
            version = t.version + 1
        FROM UNNEST(
            $1::text[], $2::text[], $3::jsonb[], $4::jsonb[], $5::text[],
            $6::timestamptz[], $7::timestamptz[], $8::timestamptz[],
            $9::timestamptz[], $10::int[], $11::text[], $12::float8[],
            $13::text[], $14::bigint[]
        ) AS v(
            id, task_type, params, state, status, run_at, scheduled_at,
            started_at, retry_at, attempts, owner_id, schedule_seconds,
            last_error, expected_version
        )
        WHERE t.id = v.id AND t.version = v.expected_version
        RETURNING
            t.id, t.task_type, t.params, t.state, t.status, t.run_at,
            t.scheduled_at, t.started_at, t.retry_at, t.attempts, t.owner_id,
            EXTRACT(EPOCH FROM t.schedule_interval)::float8 AS schedule_interval_seconds,
            t.version, t.created_at, t.last_error
        "#,
    )
    .bind(&ids)
    .bind(&task_types)
    .bind(&params)
    .bind(&states)
    .bind(&statuses)
    .bind(&run_ats)
    .bind(&scheduled_ats)
    .bind(&started_ats)
    .bind(&retry_ats)
    .bind(&attempts)
    .bind(&owner_ids)
    .bind(&schedule_seconds)
    .bind(&last_errors)
    .bind(&expected_versions)
    .fetch_all(pool)
    .await
    .map_err(StoreError::classify)?;

    Ok(rows.into_iter().map(TaskDocument::from).collect())
}

/// Read-only listing with optional type/status filters and keyset
/// pagination ordered by `(run_at, id)`.
pub async fn fetch(pool: &PgPool, opts: &FetchOptions) -> Result<FetchResult, StoreError> {
    let (after_run_at, after_id) = opts
        .search_after
        .clone()
        .map(|(t, i)| (Some(t), Some(i)))
        .unwrap_or((None, None));

    let rows: Vec<TaskRow> = sqlx::query_as(
        r#"
        SELECT id, task_type, params, state, status, run_at, scheduled_at,
               started_at, retry_at, attempts, owner_id,
               EXTRACT(EPOCH FROM schedule_interval)::float8 AS schedule_interval_seconds,
               version, created_at, last_error
        FROM tasks
        WHERE ($1::text IS NULL OR task_type = $1)
          AND ($2::text IS NULL OR status = $2)
          AND ($3::timestamptz IS NULL OR (run_at, id) > ($3, $4))
        ORDER BY run_at ASC, id ASC
        LIMIT $5
        "#,
    )
    .bind(&opts.task_type)
    .bind(opts.status.map(|s| s.to_string()))
    .bind(after_run_at)
    .bind(after_id.unwrap_or_default())
    .bind(opts.size.max(1))
    .fetch_all(pool)
    .await
    .map_err(StoreError::classify)?;

    let search_after = rows.last().map(|r| (r.run_at, r.id.clone()));
    let docs = rows.into_iter().map(TaskDocument::from).collect();

    Ok(FetchResult { docs, search_after })
}
