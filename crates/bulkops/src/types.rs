//! Core types for the service registry and operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Output reported by one device for a preview or apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOutput {
    /// Device name as reported by the orchestration engine
    pub device: String,
    /// Opaque output text (a native-format diff for previews)
    pub output: String,
}

impl DeviceOutput {
    /// Create a new device output
    pub fn new(device: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            output: output.into(),
        }
    }
}

/// Stored result of a dry-run
///
/// The unaltered output is kept alongside the normalized one so that
/// wildcard changes can always be rolled back byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_output_by_device: Vec<DeviceOutput>,
    #[serde(default)]
    pub normalized_output_by_device: Vec<DeviceOutput>,
}

impl Preview {
    /// Distinct, non-empty normalized diffs across all devices
    pub fn distinct_diffs(&self) -> BTreeSet<&str> {
        self.normalized_output_by_device
            .iter()
            .map(|d| d.output.as_str())
            .filter(|text| !text.trim().is_empty())
            .collect()
    }

    /// Whether any device reported a change
    pub fn has_diff(&self) -> bool {
        !self.distinct_diffs().is_empty()
    }

    /// Restore normalized output from the unaltered copy
    pub fn rollback(&mut self) {
        self.normalized_output_by_device = self.raw_output_by_device.clone();
    }
}

// ============================================================================
// Registry Entries
// ============================================================================

/// One top-level managed service in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Unique, immutable identifier
    pub keypath: String,

    /// Gates real (non-preview) execution
    #[serde(default)]
    pub redeploy_ready: bool,

    /// Time of the last successful apply
    pub redeployed_at: Option<DateTime<Utc>>,

    /// Error from the most recent failed apply
    pub last_error: Option<String>,

    /// Last fetched dry-run, cleared after a successful apply
    pub preview: Option<Preview>,

    /// Tracked dependent services, reconciled independently
    #[serde(default)]
    pub modified_services: Vec<SublayerEntry>,
}

impl ServiceEntry {
    /// Create a fresh entry as produced by a population pass
    pub fn new(keypath: impl Into<String>) -> Self {
        Self {
            keypath: keypath.into(),
            redeploy_ready: false,
            redeployed_at: None,
            last_error: None,
            preview: None,
            modified_services: Vec::new(),
        }
    }

    /// Add a tracked sublayer
    pub fn with_sublayer(mut self, keypath: impl Into<String>) -> Self {
        self.modified_services.push(SublayerEntry::new(keypath));
        self
    }

    /// Find a sublayer by keypath (mutable)
    pub fn sublayer_mut(&mut self, keypath: &str) -> Option<&mut SublayerEntry> {
        self.modified_services
            .iter_mut()
            .find(|s| s.keypath == keypath)
    }
}

/// A dependent service tracked under a top-level service
///
/// Same preview/error/timestamp shape as [`ServiceEntry`] but no readiness
/// flag: reconciliation has no approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SublayerEntry {
    pub keypath: String,
    pub redeployed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub preview: Option<Preview>,
}

impl SublayerEntry {
    pub fn new(keypath: impl Into<String>) -> Self {
        Self {
            keypath: keypath.into(),
            redeployed_at: None,
            last_error: None,
            preview: None,
        }
    }
}

// ============================================================================
// Shared Transition Rules
// ============================================================================

/// Field transitions shared by top-level and sublayer entries
///
/// The executor only mutates entries through these methods, so both entry
/// kinds follow identical preview/apply rules.
pub trait OperationState {
    fn keypath(&self) -> &str;
    fn preview(&self) -> Option<&Preview>;
    fn preview_mut(&mut self) -> Option<&mut Preview>;
    fn set_preview(&mut self, preview: Option<Preview>);
    fn redeployed_at(&self) -> Option<DateTime<Utc>>;
    fn set_redeployed_at(&mut self, at: Option<DateTime<Utc>>);
    fn last_error(&self) -> Option<&str>;
    fn set_last_error(&mut self, error: Option<String>);

    /// A dry-run succeeded: store it and drop any stale error
    fn record_preview(&mut self, preview: Preview) {
        self.set_preview(Some(preview));
        self.set_last_error(None);
    }

    /// A real apply succeeded
    fn record_apply_success(&mut self, at: DateTime<Utc>) {
        self.set_preview(None);
        self.set_last_error(None);
        self.set_redeployed_at(Some(at));
    }

    /// A real apply failed; timestamp and preview are left alone
    fn record_apply_failure(&mut self, error: String) {
        self.set_last_error(Some(error));
    }
}

macro_rules! impl_operation_state {
    ($ty:ty) => {
        impl OperationState for $ty {
            fn keypath(&self) -> &str {
                &self.keypath
            }

            fn preview(&self) -> Option<&Preview> {
                self.preview.as_ref()
            }

            fn preview_mut(&mut self) -> Option<&mut Preview> {
                self.preview.as_mut()
            }

            fn set_preview(&mut self, preview: Option<Preview>) {
                self.preview = preview;
            }

            fn redeployed_at(&self) -> Option<DateTime<Utc>> {
                self.redeployed_at
            }

            fn set_redeployed_at(&mut self, at: Option<DateTime<Utc>>) {
                self.redeployed_at = at;
            }

            fn last_error(&self) -> Option<&str> {
                self.last_error.as_deref()
            }

            fn set_last_error(&mut self, error: Option<String>) {
                self.last_error = error;
            }
        }
    };
}

impl_operation_state!(ServiceEntry);
impl_operation_state!(SublayerEntry);

// ============================================================================
// Operation Parameters
// ============================================================================

/// Which operation to run against a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Re-deploy the top-level service itself
    RedeployTopLevel,
    /// Reconcile each tracked sublayer independently
    ReconcileSublayers,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RedeployTopLevel => "redeploy-top-level",
            Self::ReconcileSublayers => "reconcile-sublayers",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commit flags passed with every operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFlags {
    /// Preview only (the safe default)
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    /// Update the engine's view without touching devices
    #[serde(default)]
    pub no_networking: bool,
}

fn default_dry_run() -> bool {
    true
}

impl Default for CommitFlags {
    fn default() -> Self {
        Self {
            dry_run: true,
            no_networking: false,
        }
    }
}

impl CommitFlags {
    /// Flags for a real apply
    pub fn commit() -> Self {
        Self {
            dry_run: false,
            no_networking: false,
        }
    }
}
