//! Coordination core for the distributed task scheduler.
//!
//! Everything above the shared store: the task-type registry
//! ([`dictionary`]), the update-coalescing [`buffered_store`], the
//! backpressure-driven [`managed_config`], the claim-cycle [`poller`] and its
//! [`monitor`], the bounded [`pool`], the per-task [`runner`] state machine,
//! and the [`scheduler`] facade that wires them together and publishes the
//! event stream.

pub mod backoff;
pub mod buffered_store;
pub mod dictionary;
pub mod error;
pub mod managed_config;
pub mod monitor;
pub mod poller;
pub mod pool;
pub mod runner;
pub mod scheduler;
pub mod types;

pub use buffered_store::BufferedStore;
pub use dictionary::{FnExecutor, TaskExecutionContext, TaskExecutor, TaskTypeDefinition, TaskTypeDictionary};
pub use error::SchedulerError;
pub use managed_config::ManagedConfiguration;
pub use monitor::ObservableMonitor;
pub use pool::TaskPool;
pub use scheduler::{Middleware, SchedulerConfig, TaskScheduler};
pub use types::{Event, EventKind, ExecutorOutput, HealthStatus, Outcome, ScheduleOptions, TaskInstance};
