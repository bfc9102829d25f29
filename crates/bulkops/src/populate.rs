//! Registry population and tracked-type invalidation
//!
//! Population is always a full rebuild. Which services end up in the
//! registry depends on the tracked top-level type paths and sublayer names,
//! so any change to those lists invalidates the whole registry.

use crate::backend::ServiceBackend;
use crate::context::ConfirmCallback;
use crate::error::{Error, Result};
use crate::output::OutputSet;
use crate::registry::Registry;
use crate::types::ServiceEntry;
use blake3::Hasher;
use serde::{Deserialize, Serialize};

/// Tracked service types, as configured by the operator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackedTypes {
    /// Type paths whose instances become top-level entries
    pub top_level_types: Vec<String>,
    /// Names of dependent service types tracked as sublayers
    pub target_sublayers: Vec<String>,
}

impl TrackedTypes {
    /// Order-independent hash of both lists
    pub fn fingerprint(&self) -> String {
        let mut hasher = Hasher::new();
        for (section, list) in [
            ("top-level", &self.top_level_types),
            ("sublayers", &self.target_sublayers),
        ] {
            let mut sorted: Vec<&str> = list.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.dedup();
            hasher.update(section.as_bytes());
            for item in sorted {
                hasher.update(b"\0");
                hasher.update(item.as_bytes());
            }
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Whether a dependent service keypath belongs to a tracked sublayer
    pub fn tracks_sublayer(&self, keypath: &str) -> bool {
        self.target_sublayers
            .iter()
            .any(|name| !name.is_empty() && keypath.contains(name.as_str()))
    }
}

/// Rebuild the registry from the backend
///
/// Every instance of every tracked type becomes a fresh entry. A service
/// whose dependents cannot be listed is still registered, without
/// sublayers, and named in the returned messages. Failing to list a type
/// path aborts before the registry is touched.
pub fn populate(
    registry: &Registry,
    backend: &dyn ServiceBackend,
    tracked: &TrackedTypes,
) -> Result<OutputSet> {
    if tracked.top_level_types.is_empty() {
        return Err(Error::NoTrackedTypes);
    }

    let mut output = OutputSet::new();
    let mut entries = Vec::new();

    for type_path in &tracked.top_level_types {
        let keypaths = backend.list_services(type_path)?;
        log::debug!("{type_path}: {} services", keypaths.len());

        for keypath in keypaths {
            let mut entry = ServiceEntry::new(keypath.as_str());
            match backend.modified_services(&keypath) {
                Ok(modified) => {
                    for dependent in modified.into_iter().filter(|m| tracked.tracks_sublayer(m)) {
                        entry = entry.with_sublayer(dependent);
                    }
                }
                Err(err) => {
                    log::warn!("Could not list services modified by {keypath}: {err}");
                    output.add(format!(
                        "{keypath}: operational data unreadable, \
                         redeploy the top-level service first"
                    ));
                }
            }
            entries.push(entry);
        }
    }

    let sublayers: usize = entries.iter().map(|e| e.modified_services.len()).sum();
    output.add(format!(
        "Service list populated with {} services and {sublayers} sublayers",
        entries.len()
    ));
    log::info!(
        "Populated registry: {} services, {sublayers} sublayers",
        entries.len()
    );
    registry.replace_all(entries);
    Ok(output)
}

/// Drop every registry entry, logging why
pub fn invalidate(registry: &Registry, reason: &str) -> usize {
    let cleared = registry.clear();
    log::warn!("Service list invalidated ({reason}): {cleared} entries cleared");
    cleared
}

/// Switch to a new tracked-type configuration
///
/// If the fingerprint changes and the registry is not empty, the operator
/// is asked first; declining leaves everything as it was and returns
/// `false`. Accepting clears the registry.
pub fn retrack<C: ConfirmCallback>(
    registry: &Registry,
    current: &TrackedTypes,
    proposed: &TrackedTypes,
    confirm: &mut C,
) -> Result<bool> {
    if current.fingerprint() == proposed.fingerprint() {
        return Ok(true);
    }

    if !registry.is_empty() {
        let prompt = format!(
            "Changing tracked service types clears all {} service list entries. Continue?",
            registry.len()
        );
        if !confirm.confirm(&prompt)? {
            return Ok(false);
        }
    }

    invalidate(registry, "tracked service types changed");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::backend::mock::MockBackend;
    use crate::context::{AutoConfirm, AutoDecline};

    fn tracked(top: &[&str], sub: &[&str]) -> TrackedTypes {
        TrackedTypes {
            top_level_types: top.iter().map(|s| s.to_string()).collect(),
            target_sublayers: sub.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn backend() -> MockBackend {
        let mut backend = MockBackend::new();
        backend.services.insert(
            "/services/vpn".into(),
            vec!["/services/vpn{a}".into(), "/services/vpn{b}".into()],
        );
        backend.modified.insert(
            "/services/vpn{a}".into(),
            Ok(vec![
                "/services/l2-access{a-1}".into(),
                "/services/qos{a}".into(),
            ]),
        );
        backend.modified.insert(
            "/services/vpn{b}".into(),
            Err(BackendError::failed("corrupt")),
        );
        backend
    }

    #[test]
    fn test_populate_builds_fresh_entries() {
        let registry = Registry::from_entries([ServiceEntry::new("/stale")]);
        let output = populate(&registry, &backend(), &tracked(&["/services/vpn"], &["l2-access"]))
            .expect("populate succeeds");

        assert_eq!(registry.len(), 2);
        assert!(!registry.contains("/stale"));
        let a = registry.get("/services/vpn{a}").expect("entry");
        assert_eq!(a.modified_services.len(), 1);
        assert_eq!(a.modified_services[0].keypath, "/services/l2-access{a-1}");
        assert!(!a.redeploy_ready);
        assert!(a.preview.is_none());

        let b = registry.get("/services/vpn{b}").expect("entry");
        assert!(b.modified_services.is_empty());
        assert!(output.iter().any(|m| m.starts_with("/services/vpn{b}: operational data")));
    }

    #[test]
    fn test_populate_requires_tracked_types() {
        let registry = Registry::new();
        let err = populate(&registry, &backend(), &TrackedTypes::default()).unwrap_err();
        assert!(matches!(err, Error::NoTrackedTypes));
    }

    #[test]
    fn test_unlistable_type_leaves_registry_untouched() {
        let registry = Registry::from_entries([ServiceEntry::new("/keep")]);
        let result = populate(&registry, &backend(), &tracked(&["/services/unknown"], &[]));
        assert!(matches!(result, Err(Error::Backend(_))));
        assert!(registry.contains("/keep"));
    }

    #[test]
    fn test_fingerprint_ignores_order_and_duplicates() {
        let a = tracked(&["/x", "/y"], &["s1"]);
        let b = tracked(&["/y", "/x", "/x"], &["s1"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        // moving an item between the lists is a change
        assert_ne!(
            tracked(&["/x"], &["/y"]).fingerprint(),
            tracked(&["/x", "/y"], &[]).fingerprint()
        );
    }

    #[test]
    fn test_retrack_clears_on_confirm() {
        let registry = Registry::from_entries([ServiceEntry::new("a")]);
        let current = tracked(&["/x"], &[]);
        let proposed = tracked(&["/x", "/y"], &[]);

        assert!(!retrack(&registry, &current, &proposed, &mut AutoDecline).expect("retrack"));
        assert_eq!(registry.len(), 1);

        assert!(retrack(&registry, &current, &proposed, &mut AutoConfirm).expect("retrack"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_retrack_same_types_keeps_registry() {
        let registry = Registry::from_entries([ServiceEntry::new("a")]);
        let types = tracked(&["/x"], &["s"]);
        assert!(retrack(&registry, &types, &types.clone(), &mut AutoDecline).expect("retrack"));
        assert_eq!(registry.len(), 1);
    }
}
