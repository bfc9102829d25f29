//! # bulkops
//!
//! Safe bulk redeploy and reconcile of managed network services.
//!
//! This crate provides the core of a bulk service action tool:
//! - Resolving additive target selections into exact service sets
//! - Normalizing dry-run diffs with ordered wildcard patterns
//! - Approving normalized diffs and deriving redeploy readiness
//! - Executing redeploys and sublayer reconciliations per service
//! - Fanning work out into staggered, independently-timed units
//!
//! ## Core Concepts
//!
//! - **Registry**: Per-service records (preview, readiness, last success/error)
//! - **TargetSpec**: What an operation acts on (`Explicit`, `AllExcept`, `All`, `SubsetFlags`)
//! - **WildcardPatterns**: Regexes whose matches become `*WILDCARD<n>*`
//! - **ApprovedDiffs**: Reviewed normalized diffs that make a service ready
//! - **Executor**: Runs one operation per service against a [`ServiceBackend`]
//! - **Scheduler**: One unit per service, staggered by an interval
//!
//! ## Example
//!
//! ```ignore
//! use bulkops::{
//!     ApprovedDiffs, CommitFlags, Executor, Mode, NoProgress, Registry, TargetSpec,
//!     WildcardPatterns,
//! };
//!
//! let registry = Registry::from_entries(stored_entries);
//! let approvals = ApprovedDiffs::new();
//! let patterns = WildcardPatterns::new([r"\d+\.\d+\.\d+\.\d+"])?;
//!
//! let targets = TargetSpec::All.resolve(&registry);
//! let executor = Executor::new(&registry, &approvals, &patterns, &backend);
//! let report = executor.run_batch(
//!     &targets,
//!     Mode::RedeployTopLevel,
//!     CommitFlags::default(),
//!     4,
//!     &mut NoProgress,
//! )?;
//! for message in report.messages.iter() {
//!     println!("{message}");
//! }
//! ```
//!
//! ## Provider Traits
//!
//! - [`ServiceBackend`]: The external apply/preview engine and service discovery
//! - [`ProgressCallback`]: Receives progress updates
//! - [`ConfirmCallback`]: Handles operator confirmations

pub mod approval;
pub mod backend;
pub mod context;
pub mod error;
pub mod executor;
pub mod normalize;
pub mod output;
pub mod populate;
pub mod registry;
pub mod scheduler;
pub mod target;
pub mod types;

// Re-export main types at crate root
pub use approval::ApprovedDiffs;
pub use backend::{BackendError, OPERATION_TIMEOUT, RedeployRequest, ServiceBackend};
pub use context::{AutoConfirm, AutoDecline, ConfirmCallback, NoProgress, ProgressCallback};
pub use error::{Error, Result};
pub use executor::{BatchReport, Execution, Executor, Outcome};
pub use normalize::WildcardPatterns;
pub use output::OutputSet;
pub use populate::{TrackedTypes, populate};
pub use registry::Registry;
pub use scheduler::{
    DEFAULT_INTERVAL_SECS, ScheduleRequest, ScheduledUnit, Scheduler, UnitState, parse_delay,
};
pub use target::{SubsetFlag, TargetSpec};
pub use types::{
    CommitFlags, DeviceOutput, Mode, OperationState, Preview, ServiceEntry, SublayerEntry,
};
