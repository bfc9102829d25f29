//! Error types for bulk service operations.
//!
//! Per-service failures are never errors here: they are collected into a
//! [`BatchReport`](crate::executor::BatchReport). These variants cover the
//! faults that abort a whole operation.

use crate::backend::BackendError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that abort a bulk operation
#[derive(Debug, Error)]
pub enum Error {
    /// A wildcard pattern failed to compile
    #[error("invalid wildcard pattern #{index} `{pattern}`: {source}")]
    InvalidPattern {
        /// 1-based position in the pattern list
        index: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Population was requested with nothing to track
    #[error("no top-level service types are tracked")]
    NoTrackedTypes,

    /// The backend failed during discovery
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Scheduled start lies in the past
    #[error("scheduled start {0} is in the past")]
    StartInPast(DateTime<Utc>),

    /// Relative delay could not be parsed
    #[error("invalid delay `{0}`: expected hours and/or minutes, e.g. 1h30m")]
    InvalidDelay(String),

    /// Interval between scheduled units must be positive
    #[error("scheduling interval must be at least one second")]
    InvalidInterval,

    /// Worker pool could not be started
    #[error("failed to create thread pool: {0}")]
    ThreadPool(String),

    /// Operator confirmation could not be read
    #[error("confirmation failed: {0}")]
    Confirm(#[from] std::io::Error),

    /// A schedule with this name already has units
    #[error("schedule `{0}` already exists")]
    DuplicateSchedule(String),
}

/// Result type for bulk operations
pub type Result<T> = std::result::Result<T, Error>;
