//! Approval engine
//!
//! Keeps the set of reviewed, normalized diffs and decides when a service's
//! current preview is fully covered by it. Approval only ever raises the
//! readiness flag; lowering it is an explicit operator action.

use crate::normalize::WildcardPatterns;
use crate::registry::Registry;
use crate::types::{Preview, ServiceEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Set of normalized diff texts considered safe to apply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovedDiffs {
    diffs: BTreeSet<String>,
}

impl ApprovedDiffs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn contains(&self, diff: &str) -> bool {
        self.diffs.contains(diff)
    }

    /// Approved diffs in stable (sorted) order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.diffs.iter().map(String::as_str)
    }

    pub fn insert(&mut self, diff: impl Into<String>) -> bool {
        self.diffs.insert(diff.into())
    }

    /// Remove a diff by text. Readiness flags are never touched.
    pub fn remove(&mut self, diff: &str) -> bool {
        self.diffs.remove(diff)
    }

    /// Remove the diff at a 1-based position of [`iter`](Self::iter)
    pub fn remove_at(&mut self, position: usize) -> Option<String> {
        let diff = self.diffs.iter().nth(position.checked_sub(1)?)?.clone();
        self.diffs.remove(&diff);
        Some(diff)
    }

    /// Whether every distinct device diff of a preview is approved
    ///
    /// A preview without any diff is trivially covered.
    pub fn covers(&self, preview: &Preview) -> bool {
        preview
            .distinct_diffs()
            .into_iter()
            .all(|diff| self.diffs.contains(diff))
    }

    /// Mark an entry ready if its preview is covered
    ///
    /// Returns `true` only when the flag went from unset to set. An entry
    /// without a preview, or one that is not covered, is left as it was.
    pub fn evaluate_readiness(&self, entry: &mut ServiceEntry) -> bool {
        let covered = entry.preview.as_ref().is_some_and(|p| self.covers(p));
        if covered && !entry.redeploy_ready {
            log::debug!("{} is covered by approved diffs, marking ready", entry.keypath);
            entry.redeploy_ready = true;
            return true;
        }
        false
    }

    /// Approve a service's current normalized diffs
    ///
    /// Each distinct device diff is inserted verbatim. Returns how many were
    /// new; an unknown service or one without a preview is a no-op.
    pub fn approve(&mut self, registry: &Registry, keypath: &str) -> usize {
        let Some(entry) = registry.get(keypath) else {
            log::debug!("{keypath} is not registered, nothing to approve");
            return 0;
        };
        let Some(preview) = entry.preview.as_ref() else {
            log::info!("{keypath} has no dry-run output, nothing to approve");
            return 0;
        };

        let added = preview
            .distinct_diffs()
            .into_iter()
            .filter(|diff| self.diffs.insert((*diff).to_string()))
            .count();
        log::info!("Approved {added} new diffs from {keypath}");
        added
    }

    /// Re-evaluate readiness for every entry holding a preview
    ///
    /// Returns the number of entries newly marked ready. Idempotent, and
    /// never lowers an existing flag.
    pub fn check_all(&self, registry: &Registry) -> usize {
        let mut updated = 0;
        registry.for_each_mut(|entry| {
            if self.evaluate_readiness(entry) {
                updated += 1;
            }
        });
        log::info!("Approval check marked {updated} services ready");
        updated
    }

    /// Add the re-normalized form of every approved diff that changes
    ///
    /// Existing approvals are kept. Returns how many were added.
    pub fn renormalize(&mut self, patterns: &WildcardPatterns) -> usize {
        let rewritten: Vec<String> = self
            .diffs
            .iter()
            .map(|diff| patterns.normalize(diff))
            .filter(|normalized| !self.diffs.contains(normalized))
            .collect();
        rewritten
            .into_iter()
            .filter(|normalized| self.diffs.insert(normalized.clone()))
            .count()
    }
}

impl<S: Into<String>> FromIterator<S> for ApprovedDiffs {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            diffs: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceOutput;
    use chrono::Utc;

    fn preview(outputs: &[&str]) -> Preview {
        let devices: Vec<DeviceOutput> = outputs
            .iter()
            .enumerate()
            .map(|(i, o)| DeviceOutput::new(format!("ce{i}"), *o))
            .collect();
        Preview {
            fetched_at: Utc::now(),
            raw_output_by_device: devices.clone(),
            normalized_output_by_device: devices,
        }
    }

    fn entry_with(keypath: &str, outputs: &[&str]) -> ServiceEntry {
        let mut entry = ServiceEntry::new(keypath);
        entry.preview = Some(preview(outputs));
        entry
    }

    #[test]
    fn test_check_all_marks_covered_service_ready() {
        let registry = Registry::from_entries([entry_with("a", &["line1", "line2"])]);
        let approvals: ApprovedDiffs = ["line1", "line2"].into_iter().collect();

        assert_eq!(approvals.check_all(&registry), 1);
        assert!(registry.get("a").expect("entry").redeploy_ready);
    }

    #[test]
    fn test_empty_preview_is_ready_without_approvals() {
        let mut entry = entry_with("a", &["", "  "]);
        assert!(ApprovedDiffs::new().evaluate_readiness(&mut entry));
        assert!(entry.redeploy_ready);
    }

    #[test]
    fn test_partial_coverage_leaves_flag_alone() {
        let approvals: ApprovedDiffs = ["line1"].into_iter().collect();
        let mut entry = entry_with("a", &["line1", "line2"]);
        assert!(!approvals.evaluate_readiness(&mut entry));
        assert!(!entry.redeploy_ready);
    }

    #[test]
    fn test_no_preview_is_never_marked() {
        let mut entry = ServiceEntry::new("a");
        assert!(!ApprovedDiffs::new().evaluate_readiness(&mut entry));
        assert!(!entry.redeploy_ready);
    }

    #[test]
    fn test_check_all_never_lowers_readiness() {
        let mut manual = entry_with("a", &["unapproved"]);
        manual.redeploy_ready = true;
        let registry = Registry::from_entries([manual, entry_with("b", &["x"])]);
        let approvals = ApprovedDiffs::new();

        for _ in 0..3 {
            assert_eq!(approvals.check_all(&registry), 0);
            assert!(registry.get("a").expect("entry").redeploy_ready);
        }
    }

    #[test]
    fn test_check_all_is_idempotent() {
        let registry = Registry::from_entries([entry_with("a", &["x"])]);
        let approvals: ApprovedDiffs = ["x"].into_iter().collect();
        assert_eq!(approvals.check_all(&registry), 1);
        assert_eq!(approvals.check_all(&registry), 0);
    }

    #[test]
    fn test_approve_inserts_each_device_diff() {
        let registry = Registry::from_entries([
            entry_with("a", &["line1", "line2", "line1", ""]),
            ServiceEntry::new("b"),
        ]);
        let mut approvals = ApprovedDiffs::new();

        assert_eq!(approvals.approve(&registry, "a"), 2);
        assert_eq!(approvals.approve(&registry, "a"), 0);
        assert_eq!(approvals.approve(&registry, "b"), 0);
        assert_eq!(approvals.approve(&registry, "missing"), 0);
        assert!(approvals.contains("line1"));
        assert!(approvals.contains("line2"));
        assert_eq!(approvals.len(), 2);
    }

    #[test]
    fn test_removing_approval_keeps_readiness() {
        let registry = Registry::from_entries([entry_with("a", &["x"])]);
        let mut approvals: ApprovedDiffs = ["x"].into_iter().collect();
        approvals.check_all(&registry);

        assert!(approvals.remove("x"));
        approvals.check_all(&registry);
        assert!(registry.get("a").expect("entry").redeploy_ready);
    }

    #[test]
    fn test_remove_at_is_one_based() {
        let mut approvals: ApprovedDiffs = ["b", "a"].into_iter().collect();
        assert_eq!(approvals.remove_at(0), None);
        assert_eq!(approvals.remove_at(1), Some("a".to_string()));
        assert_eq!(approvals.remove_at(2), None);
        assert_eq!(approvals.iter().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_renormalize_adds_changed_forms_only() {
        let mut approvals: ApprovedDiffs = ["ip 10.0.0.1", "no digits"].into_iter().collect();
        let patterns = WildcardPatterns::new([r"\d+\.\d+\.\d+\.\d+"]).expect("valid");

        assert_eq!(approvals.renormalize(&patterns), 1);
        assert!(approvals.contains("ip 10.0.0.1"));
        assert!(approvals.contains("ip *WILDCARD1*"));
        assert_eq!(approvals.renormalize(&patterns), 0);
    }
}
