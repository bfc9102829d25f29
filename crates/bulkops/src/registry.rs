//! Service registry
//!
//! The single shared mutable resource. Each entry sits behind its own lock so
//! concurrent executions update different services without interfering, while
//! the map itself sits behind a read/write lock: per-entry updates hold it
//! shared, and a full rebuild takes it exclusively, which makes population
//! mutually exclusive with any in-flight update.

use crate::types::ServiceEntry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

type EntryMap = BTreeMap<String, Arc<Mutex<ServiceEntry>>>;

/// Keyed store of [`ServiceEntry`] records
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<EntryMap>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from stored entries (e.g. loaded from disk)
    pub fn from_entries(entries: impl IntoIterator<Item = ServiceEntry>) -> Self {
        let registry = Self::new();
        registry.replace_all(entries);
        registry
    }

    /// All keypaths currently registered
    pub fn keys(&self) -> BTreeSet<String> {
        self.read_map().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    pub fn contains(&self, keypath: &str) -> bool {
        self.read_map().contains_key(keypath)
    }

    /// Keypaths of entries matching a predicate
    pub fn filter_keys(&self, predicate: impl Fn(&ServiceEntry) -> bool) -> BTreeSet<String> {
        let map = self.read_map();
        map.iter()
            .filter(|(_, entry)| predicate(&lock_entry(entry)))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Copy of one entry
    pub fn get(&self, keypath: &str) -> Option<ServiceEntry> {
        let map = self.read_map();
        map.get(keypath).map(|entry| lock_entry(entry).clone())
    }

    /// Atomically update one entry
    ///
    /// Returns `None` if the keypath is not (or no longer) registered.
    pub fn update<R>(&self, keypath: &str, f: impl FnOnce(&mut ServiceEntry) -> R) -> Option<R> {
        let map = self.read_map();
        let entry = map.get(keypath)?;
        let mut guard = lock_entry(entry);
        Some(f(&mut guard))
    }

    /// Apply `f` to every entry, one entry lock at a time
    pub fn for_each_mut(&self, mut f: impl FnMut(&mut ServiceEntry)) {
        let map = self.read_map();
        for entry in map.values() {
            f(&mut lock_entry(entry));
        }
    }

    /// Replace every entry (full population)
    pub fn replace_all(&self, entries: impl IntoIterator<Item = ServiceEntry>) {
        let rebuilt: EntryMap = entries
            .into_iter()
            .map(|e| (e.keypath.clone(), Arc::new(Mutex::new(e))))
            .collect();
        let mut map = self.write_map();
        log::debug!("Replacing {} registry entries with {}", map.len(), rebuilt.len());
        *map = rebuilt;
    }

    /// Remove every entry, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut map = self.write_map();
        let count = map.len();
        map.clear();
        count
    }

    /// Remove the given keypaths, returning the ones that were present
    pub fn remove(&self, keypaths: &BTreeSet<String>) -> BTreeSet<String> {
        let mut map = self.write_map();
        keypaths
            .iter()
            .filter(|k| map.remove(k.as_str()).is_some())
            .cloned()
            .collect()
    }

    /// Copies of all entries, ordered by keypath
    pub fn snapshot(&self) -> Vec<ServiceEntry> {
        let map = self.read_map();
        map.values().map(|e| lock_entry(e).clone()).collect()
    }

    fn read_map(&self) -> RwLockReadGuard<'_, EntryMap> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, EntryMap> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn lock_entry(entry: &Mutex<ServiceEntry>) -> MutexGuard<'_, ServiceEntry> {
    match entry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn registry_with(keys: &[&str]) -> Registry {
        Registry::from_entries(keys.iter().map(|k| ServiceEntry::new(*k)))
    }

    #[test]
    fn test_replace_all_is_not_a_merge() {
        let registry = registry_with(&["a", "b"]);
        registry.replace_all(vec![ServiceEntry::new("c")]);
        assert_eq!(registry.keys(), BTreeSet::from(["c".to_string()]));
    }

    #[test]
    fn test_update_missing_returns_none() {
        let registry = registry_with(&["a"]);
        assert!(registry.update("nope", |e| e.redeploy_ready = true).is_none());
        assert_eq!(registry.update("a", |e| e.keypath.clone()), Some("a".to_string()));
    }

    #[test]
    fn test_remove_reports_present_keys_only() {
        let registry = registry_with(&["a", "b", "c"]);
        let wanted = BTreeSet::from(["a".to_string(), "zzz".to_string()]);
        let removed = registry.remove(&wanted);
        assert_eq!(removed, BTreeSet::from(["a".to_string()]));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_clear() {
        let registry = registry_with(&["a", "b"]);
        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_updates_are_not_torn() {
        let registry = Arc::new(registry_with(&["a", "b"]));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let key = if i % 2 == 0 { "a" } else { "b" };
                    for _ in 0..100 {
                        registry.update(key, |e| {
                            let count = e.modified_services.len();
                            e.modified_services
                                .push(crate::types::SublayerEntry::new(format!("{key}-{count}")));
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread panicked");
        }

        for entry in registry.snapshot() {
            assert_eq!(entry.modified_services.len(), 400);
        }
    }

    #[test]
    fn test_update_survives_poisoned_entry() {
        let registry = Arc::new(registry_with(&["a"]));
        let poisoner = Arc::clone(&registry);
        let _ = thread::spawn(move || {
            poisoner.update("a", |e| {
                if e.keypath == "a" {
                    panic!("intentional poison");
                }
            });
        })
        .join();

        assert_eq!(registry.update("a", |e| e.keypath.clone()), Some("a".to_string()));
    }
}
