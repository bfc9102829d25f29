//! Target resolution
//!
//! Turns an operator's target selection into an exact set of registry keys.
//! Selections are additive: subset flags are OR-combined, never AND-ed.

use crate::registry::Registry;
use crate::types::ServiceEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Category of registry entries selectable without naming them
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubsetFlag {
    /// The last apply failed
    HasLastError,
    /// No device reported a change (or nothing was fetched yet)
    HasNoPreviewDiff,
    /// No dry-run was ever fetched
    HasNoPreviewFetch,
    /// Never successfully applied
    HasNoSuccess,
    /// Successfully applied at least once
    HasSuccess,
    /// Flagged as redeploy-ready
    IsRedeployReady,
}

impl SubsetFlag {
    pub const ALL: [SubsetFlag; 6] = [
        Self::HasLastError,
        Self::HasNoPreviewDiff,
        Self::HasNoPreviewFetch,
        Self::HasNoSuccess,
        Self::HasSuccess,
        Self::IsRedeployReady,
    ];

    /// Whether an entry belongs to this subset
    pub fn matches(&self, entry: &ServiceEntry) -> bool {
        match self {
            Self::HasLastError => entry.last_error.is_some(),
            Self::HasNoPreviewDiff => !entry.preview.as_ref().is_some_and(|p| p.has_diff()),
            Self::HasNoPreviewFetch => entry.preview.is_none(),
            Self::HasNoSuccess => entry.redeployed_at.is_none(),
            Self::HasSuccess => entry.redeployed_at.is_some(),
            Self::IsRedeployReady => entry.redeploy_ready,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasLastError => "last-redeploy-error",
            Self::HasNoPreviewDiff => "no-dry-run-diff",
            Self::HasNoPreviewFetch => "no-dry-run-fetched-at",
            Self::HasNoSuccess => "no-redeployed-at",
            Self::HasSuccess => "redeployed-at",
            Self::IsRedeployReady => "redeploy-ready",
        }
    }
}

impl fmt::Display for SubsetFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an operation should act on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetSpec {
    /// Exactly these keypaths (unknown ones are dropped)
    Explicit(BTreeSet<String>),
    /// Everything except these keypaths
    AllExcept(BTreeSet<String>),
    /// The whole registry
    All,
    /// Entries matching any of the flags
    SubsetFlags(BTreeSet<SubsetFlag>),
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self::All
    }
}

impl TargetSpec {
    /// Build a spec from loose operator input
    ///
    /// Keypaths alone are an include list; keypaths with `all` are an
    /// exclude list. Subset flags only apply when no keypaths are given.
    pub fn from_parts(
        keypaths: impl IntoIterator<Item = String>,
        all: bool,
        subset: impl IntoIterator<Item = SubsetFlag>,
    ) -> Self {
        let keypaths: BTreeSet<String> = keypaths.into_iter().collect();
        let subset: BTreeSet<SubsetFlag> = subset.into_iter().collect();

        if !keypaths.is_empty() {
            if !subset.is_empty() {
                log::warn!("Explicit keypaths given, ignoring subset flags");
            }
            return if all {
                Self::AllExcept(keypaths)
            } else {
                Self::Explicit(keypaths)
            };
        }

        if subset.is_empty() {
            Self::All
        } else {
            Self::SubsetFlags(subset)
        }
    }

    /// Resolve against the registry's current contents
    pub fn resolve(&self, registry: &Registry) -> BTreeSet<String> {
        match self {
            Self::Explicit(keypaths) => {
                let known = registry.keys();
                let resolved: BTreeSet<String> = keypaths.intersection(&known).cloned().collect();
                for dropped in keypaths.difference(&resolved) {
                    log::debug!("Dropping unknown target {dropped}");
                }
                resolved
            }
            Self::AllExcept(excluded) => registry.keys().difference(excluded).cloned().collect(),
            Self::All => registry.keys(),
            Self::SubsetFlags(flags) => {
                registry.filter_keys(|entry| flags.iter().any(|flag| flag.matches(entry)))
            }
        }
    }
}
