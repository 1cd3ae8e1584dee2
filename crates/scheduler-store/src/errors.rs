//! Store-level error taxonomy.
//!
//! Every fallible [`crate::queries::tasks`] function returns `Result<T,
//! StoreError>`. Classification happens once, at the point a raw
//! [`sqlx::Error`] is caught, so callers never have to pattern-match on
//! driver-specific detail.

use thiserror::Error;

/// A diagnostic phrase Postgres emits when `CREATE DATABASE` or a
/// migration runs against a server with scripting-adjacent extensions
/// disabled. Surfaced as [`StoreError::Fatal`] rather than retried, since
/// retrying won't help.
const INLINE_SCRIPT_DISABLED_MARKERS: &[&str] =
    &["extension \"plpgsql\" is not available", "permission denied for language"];

/// Substrings in a driver error that indicate the store is overloaded
/// rather than broken: connection pool exhaustion, statement timeouts, and
/// the Postgres "too many connections" / serialization-failure codes. Used
/// to classify [`StoreError::Overload`] for consumers like
/// `ManagedConfiguration`.
const OVERLOAD_MARKERS: &[&str] = &[
    "statement timeout",
    "too many connections",
    "pool timed out",
    "could not serialize access",
    "deadlock detected",
];

/// Errors raised by the task store.
///
/// `Clone` so the error can be broadcast on `errors$` to every
/// `ManagedConfiguration` subscriber; the one variant that wraps a driver
/// error (`Other`) keeps only its rendered message rather than the original
/// `sqlx::Error`, which is not `Clone`.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// An `update` was rejected because `doc.version` no longer matched the
    /// row's current version.
    #[error("version conflict on task {task_id}")]
    VersionConflict { task_id: String },

    /// `get`/`get_lifecycle` found no row with the given id.
    #[error("task {task_id} not found")]
    NotFound { task_id: String },

    /// The store is shedding load (timeouts, connection exhaustion,
    /// serialization conflicts). Fed to `ManagedConfiguration`; the caller
    /// should retry on the next cycle rather than fail the task.
    #[error("store overloaded: {detail}")]
    Overload { detail: String },

    /// A configuration-level failure that will not resolve by retrying
    /// (e.g. inline scripting disabled on the server).
    #[error("store misconfigured: {detail}")]
    Fatal { detail: String },

    /// Any other driver-level failure, preserved for diagnostics as a
    /// rendered message.
    #[error("{0}")]
    Other(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::classify(err)
    }
}

impl StoreError {
    /// Classify a raw `sqlx::Error` into the store's error taxonomy.
    ///
    /// This is the single place driver errors are inspected; every query
    /// function in [`crate::queries::tasks`] routes its error path through
    /// this function instead of letting `sqlx::Error` leak untouched.
    pub fn classify(err: sqlx::Error) -> Self {
        let message = err.to_string();
        let lower = message.to_ascii_lowercase();

        if INLINE_SCRIPT_DISABLED_MARKERS
            .iter()
            .any(|marker| lower.contains(marker))
        {
            return Self::Fatal { detail: message };
        }

        if OVERLOAD_MARKERS.iter().any(|marker| lower.contains(marker)) {
            return Self::Overload { detail: message };
        }

        Self::Other(message)
    }

    /// Whether this error should be fed to `ManagedConfiguration` as an
    /// overload signal.
    pub fn is_overload_signal(&self) -> bool {
        matches!(self, Self::Overload { .. })
    }
}
