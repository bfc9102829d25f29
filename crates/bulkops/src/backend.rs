//! Backend abstraction for the external orchestration engine.
//!
//! The [`ServiceBackend`] trait is the only way this crate reaches the system
//! that actually computes and applies configuration, enabling:
//! - A real bridge to the orchestration engine
//! - Mock implementations for testing

use crate::types::{CommitFlags, DeviceOutput};
use std::time::Duration;
use thiserror::Error;

/// Hard limit for a single external operation, for both operation kinds
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Parameters for one re-deploy call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeployRequest {
    /// Preview only
    pub dry_run: bool,
    /// Update the engine's view without touching devices
    pub no_networking: bool,
    /// Take ownership of existing device config (sublayer reconciliation)
    pub reconcile: bool,
    /// Give up after this long
    pub timeout: Duration,
}

impl RedeployRequest {
    pub fn new(flags: CommitFlags, reconcile: bool) -> Self {
        Self {
            dry_run: flags.dry_run,
            no_networking: flags.no_networking,
            reconcile,
            timeout: OPERATION_TIMEOUT,
        }
    }
}

/// Failure reported by the external engine
///
/// The `Display` text is what ends up in a service's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The engine rejected or failed the operation
    #[error("{message}")]
    Failed { message: String },

    /// The operation did not finish within the allowed time
    #[error("operation on {keypath} timed out after {}s", .after.as_secs())]
    Timeout { keypath: String, after: Duration },

    /// The engine could not be reached
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The engine answered with something unparseable
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Interface to the external apply/preview capability
pub trait ServiceBackend: Send + Sync {
    /// Re-deploy one service, returning per-device output on success.
    fn redeploy(
        &self,
        keypath: &str,
        request: &RedeployRequest,
    ) -> Result<Vec<DeviceOutput>, BackendError>;

    /// List instance keypaths of a tracked top-level service type.
    fn list_services(&self, type_path: &str) -> Result<Vec<String>, BackendError>;

    /// List keypaths of services modified by (dependent on) a service.
    fn modified_services(&self, keypath: &str) -> Result<Vec<String>, BackendError>;
}
