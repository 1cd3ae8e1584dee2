//! `BufferedStore` -- coalesces concurrent single-document updates into
//! bulk store operations.
//!
//! Grounded on the same `mpsc` + background-task pattern
//! `gator-core::orchestrator` uses to collect `LifecycleDone` messages from
//! spawned runners: callers don't talk to the store directly, they send a
//! `(doc, oneshot::Sender)` pair into a channel; a single background task
//! drains the channel in batches and replies to each caller individually.

use std::time::Duration;

use scheduler_store::queries::tasks::update_many;
use scheduler_store::{StoreError, TaskDocument};
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::warn;

/// How long the background task waits for more updates to arrive before
/// flushing a partial batch.
const COALESCE_WINDOW: Duration = Duration::from_millis(10);

struct UpdateRequest {
    doc: TaskDocument,
    reply: oneshot::Sender<Result<TaskDocument, StoreError>>,
}

/// Batches `TaskStore::update` calls from concurrent runners.
///
/// Each caller still observes its own per-document result; no
/// cross-document ordering is promised, only that each document's own
/// write is applied exactly as requested.
#[derive(Clone)]
pub struct BufferedStore {
    tx: mpsc::Sender<UpdateRequest>,
    pool: PgPool,
}

impl BufferedStore {
    /// Spawn the background batching task. `max_workers` bounds how many
    /// updates are coalesced into one round trip, tracking the live value
    /// published by `ManagedConfiguration`.
    pub fn new(pool: PgPool, max_workers: watch::Receiver<usize>) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(drain_loop(pool.clone(), rx, max_workers));
        Self { tx, pool }
    }

    /// Submit an optimistic write and await this document's own result.
    pub async fn update(&self, doc: TaskDocument) -> Result<TaskDocument, StoreError> {
        let (reply, recv) = oneshot::channel();
        if self.tx.send(UpdateRequest { doc, reply }).await.is_err() {
            return Err(StoreError::Fatal {
                detail: "buffered store batching task has shut down".to_string(),
            });
        }
        match recv.await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Fatal {
                detail: "buffered store dropped reply before responding".to_string(),
            }),
        }
    }

    /// Idempotent delete, bypassing the batching path -- there is nothing
    /// to coalesce for a one-shot removal.
    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        scheduler_store::queries::tasks::remove(&self.pool, id).await
    }
}

async fn drain_loop(
    pool: PgPool,
    mut rx: mpsc::Receiver<UpdateRequest>,
    max_workers: watch::Receiver<usize>,
) {
    while let Some(first) = rx.recv().await {
        let batch_size = (*max_workers.borrow()).max(1);
        let mut batch = vec![first];

        let deadline = tokio::time::Instant::now() + COALESCE_WINDOW;
        while batch.len() < batch_size {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(req)) => batch.push(req),
                Ok(None) | Err(_) => break,
            }
        }

        flush(&pool, batch).await;
    }
}

async fn flush(pool: &PgPool, batch: Vec<UpdateRequest>) {
    let docs: Vec<TaskDocument> = batch.iter().map(|r| r.doc.clone()).collect();

    let updated = match update_many(pool, &docs).await {
        Ok(rows) => rows,
        Err(e) => {
            let detail = e.to_string();
            warn!(error = %detail, batch_size = docs.len(), "bulk update failed, failing entire batch");
            for req in batch {
                let _ = req.reply.send(Err(StoreError::Fatal {
                    detail: detail.clone(),
                }));
            }
            return;
        }
    };

    for req in batch {
        let result = updated
            .iter()
            .find(|d| d.id == req.doc.id)
            .cloned()
            .ok_or_else(|| StoreError::VersionConflict {
                task_id: req.doc.id.clone(),
            });
        let _ = req.reply.send(result);
    }
}
