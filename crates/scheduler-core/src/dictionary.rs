//! `TaskTypeDictionary` -- the registry of task-type definitions.
//!
//! Structurally the same shape as `gator-core`'s `HarnessRegistry`: a
//! `HashMap<String, _>` behind `register`/`get`/`list`, with a `Debug` impl
//! that only ever shows the keys. The one addition is a lock bit, since
//! registration here is only legal during setup.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Future;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::types::{ExecutorOutput, TaskInstance};

/// Everything an executor needs to run one invocation of a task.
pub struct TaskExecutionContext {
    pub task_instance: TaskInstance,
    pub cancel: CancellationToken,
}

/// Caller-supplied work function associated with a task type.
///
/// Object-safe: every method returns a concrete, boxable future, so the
/// dictionary can store `Box<dyn TaskExecutor>` the same way
/// `HarnessRegistry` stores `Box<dyn Harness>`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one invocation. Returning `Err` counts as one failed attempt;
    /// the runner converts it into a backoff reschedule or terminal
    /// failure depending on the type's `max_attempts`.
    async fn execute(&self, ctx: TaskExecutionContext) -> anyhow::Result<ExecutorOutput>;
}

// Compile-time assertion: TaskExecutor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskExecutor) {}
};

/// A closure-backed [`TaskExecutor`], for callers who would rather pass a
/// function than implement the trait.
pub struct FnExecutor<F> {
    f: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(TaskExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ExecutorOutput>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(TaskExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ExecutorOutput>> + Send + 'static,
{
    async fn execute(&self, ctx: TaskExecutionContext) -> anyhow::Result<ExecutorOutput> {
        let fut: Pin<Box<dyn Future<Output = anyhow::Result<ExecutorOutput>> + Send>> =
            Box::pin((self.f)(ctx));
        fut.await
    }
}

/// Static facts about a task type, resolved once at claim time.
pub struct TaskTypeDefinition {
    pub title: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub executor: Arc<dyn TaskExecutor>,
}

impl TaskTypeDefinition {
    pub fn new(
        title: impl Into<String>,
        timeout: Duration,
        max_attempts: u32,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            title: title.into(),
            timeout,
            max_attempts,
            executor,
        }
    }
}

/// Registry of task-type definitions, keyed by `task_type`.
///
/// Registration is permitted only before the dictionary is locked (by
/// `TaskScheduler::start`); attempts after that return
/// [`SchedulerError::AlreadyStarted`] instead of panicking.
pub struct TaskTypeDictionary {
    definitions: HashMap<String, Arc<TaskTypeDefinition>>,
    locked: bool,
}

impl Default for TaskTypeDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTypeDictionary {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
            locked: false,
        }
    }

    /// Register (or replace) the definition for `task_type`.
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        definition: TaskTypeDefinition,
    ) -> Result<(), SchedulerError> {
        if self.locked {
            return Err(SchedulerError::AlreadyStarted);
        }
        self.definitions.insert(task_type.into(), Arc::new(definition));
        Ok(())
    }

    /// Freeze the dictionary. Called once by `TaskScheduler::start`.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<TaskTypeDefinition>> {
        self.definitions.get(task_type).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.definitions.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl std::fmt::Debug for TaskTypeDictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTypeDictionary")
            .field("definitions", &self.definitions.keys().collect::<Vec<_>>())
            .field("locked", &self.locked)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopExecutor;

    #[async_trait]
    impl TaskExecutor for NoopExecutor {
        async fn execute(&self, _ctx: TaskExecutionContext) -> anyhow::Result<ExecutorOutput> {
            Ok(ExecutorOutput {
                state: Value::Null,
                run_at: None,
            })
        }
    }

    fn sample_definition() -> TaskTypeDefinition {
        TaskTypeDefinition::new(
            "sample",
            Duration::from_secs(30),
            3,
            Arc::new(NoopExecutor),
        )
    }

    #[test]
    fn starts_empty() {
        let dict = TaskTypeDictionary::new();
        assert!(dict.is_empty());
        assert_eq!(dict.len(), 0);
    }

    #[test]
    fn register_and_get() {
        let mut dict = TaskTypeDictionary::new();
        dict.register("sample", sample_definition()).unwrap();
        let def = dict.get("sample").expect("should be registered");
        assert_eq!(def.title, "sample");
        assert_eq!(def.max_attempts, 3);
    }

    #[test]
    fn get_missing_returns_none() {
        let dict = TaskTypeDictionary::new();
        assert!(dict.get("nonexistent").is_none());
    }

    #[test]
    fn register_after_lock_fails() {
        let mut dict = TaskTypeDictionary::new();
        dict.lock();
        let err = dict.register("sample", sample_definition()).unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyStarted));
    }

    #[test]
    fn list_returns_all_keys() {
        let mut dict = TaskTypeDictionary::new();
        dict.register("alpha", sample_definition()).unwrap();
        dict.register("beta", sample_definition()).unwrap();
        let mut names = dict.list();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }
}
