//! The shared document store for the task scheduler.
//!
//! Backed by Postgres, reached through `sqlx`. `queries::tasks` implements
//! the optimistic-concurrency claiming protocol; `errors` classifies driver
//! failures into the taxonomy `scheduler-core` depends on for backpressure
//! decisions.

pub mod config;
pub mod errors;
pub mod models;
pub mod pool;
pub mod queries;

pub use errors::StoreError;
pub use models::{RecurringSchedule, TaskDocument, TaskStatus, Version};
