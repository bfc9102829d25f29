//! Progress and confirmation callbacks
//!
//! These traits let the library report batch progress and ask for
//! confirmation without depending on any particular terminal UI.

use crate::executor::Outcome;
use std::io;

/// Progress callback for batch execution
///
/// Implement this trait to receive progress updates during a batch.
pub trait ProgressCallback: Send {
    /// Called once before any service is executed
    fn on_batch_start(&mut self, count: usize);

    /// Called when a service starts executing
    fn on_service_start(&mut self, keypath: &str);

    /// Called when a service finishes, with its outcome
    fn on_service_complete(&mut self, keypath: &str, outcome: &Outcome);

    /// Called once after every service finished
    fn on_batch_complete(&mut self);
}

/// Confirmation callback for destructive operations
pub trait ConfirmCallback: Send {
    /// Ask the operator to confirm an action
    ///
    /// # Returns
    /// `true` if the operator confirmed, `false` otherwise
    fn confirm(&mut self, prompt: &str) -> io::Result<bool>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_batch_start(&mut self, _count: usize) {}
    fn on_service_start(&mut self, _keypath: &str) {}
    fn on_service_complete(&mut self, _keypath: &str, _outcome: &Outcome) {}
    fn on_batch_complete(&mut self) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> io::Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> io::Result<bool> {
        Ok(false)
    }
}
