use anyhow::{Context, Result};
use bulkops::{ApprovedDiffs, Scheduler, ServiceEntry};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::Path;

// ============================================================================
// State Structures
// ============================================================================

/// Everything bsa persists between runs (`state.toml`)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BsaState {
    /// Last time the state was updated
    pub last_updated: DateTime<Utc>,

    /// Fingerprint of the tracked types the service list was built from
    #[serde(default)]
    pub tracked_fingerprint: Option<String>,

    /// Reviewed, normalized diffs
    #[serde(default)]
    pub approved_diffs: ApprovedDiffs,

    /// The service list
    #[serde(default)]
    pub services: Vec<ServiceEntry>,

    /// Scheduled units, finished ones included until pruned
    #[serde(default)]
    pub schedule: Scheduler,
}

impl Default for BsaState {
    fn default() -> Self {
        Self {
            last_updated: Utc::now(),
            tracked_fingerprint: None,
            approved_diffs: ApprovedDiffs::new(),
            services: Vec::new(),
            schedule: Scheduler::new(),
        }
    }
}

// ============================================================================
// BsaState Implementation
// ============================================================================

impl BsaState {
    /// Load state from disk, or return default if file doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("State file does not exist, using default state");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;

        let state: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        log::debug!(
            "Loaded state from {} ({} services)",
            path.display(),
            state.services.len()
        );
        Ok(state)
    }

    /// Save state to disk, refreshing `last_updated`
    pub fn save_to(&mut self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }

        self.last_updated = Utc::now();
        let content = toml::to_string_pretty(&self).context("Failed to serialize state to TOML")?;

        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, &content)
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace state file: {}", path.display()))?;

        log::debug!("Saved state to {}", path.display());
        Ok(())
    }

    /// Fold the changes one process made (`before` to `after`) into this
    /// freshly read state
    ///
    /// Entries are merged by keypath, approvals by text and units by id, so
    /// updates to different services made by other processes survive. When
    /// the set of services itself changed (populate, invalidation) the
    /// service list is taken from `after` as a whole.
    pub fn merge_changes(&mut self, before: &Self, after: &Self) {
        if service_keys(before) == service_keys(after) {
            for entry in &after.services {
                let unchanged = before
                    .services
                    .iter()
                    .any(|old| old.keypath == entry.keypath && old == entry);
                if unchanged {
                    continue;
                }
                if let Some(slot) = self.services.iter_mut().find(|e| e.keypath == entry.keypath) {
                    *slot = entry.clone();
                }
            }
            if self.tracked_fingerprint == before.tracked_fingerprint {
                self.tracked_fingerprint.clone_from(&after.tracked_fingerprint);
            }
        } else {
            self.services.clone_from(&after.services);
            self.tracked_fingerprint.clone_from(&after.tracked_fingerprint);
        }

        for diff in before.approved_diffs.iter() {
            if !after.approved_diffs.contains(diff) {
                self.approved_diffs.remove(diff);
            }
        }
        for diff in after.approved_diffs.iter() {
            if !before.approved_diffs.contains(diff) {
                self.approved_diffs.insert(diff);
            }
        }

        self.schedule.merge_changes(&before.schedule, &after.schedule);
    }
}

fn service_keys(state: &BsaState) -> BTreeSet<&str> {
    state.services.iter().map(|e| e.keypath.as_str()).collect()
}

// ============================================================================
// State Lock
// ============================================================================

/// Advisory lock on `state.toml`, held through a sibling `.lock` file
///
/// Released when dropped.
pub struct StateLock {
    file: File,
}

impl StateLock {
    /// Block until no other process reads or writes the state
    pub fn exclusive(state_path: &Path) -> Result<Self> {
        let file = open_lock_file(state_path)?;
        FileExt::lock_exclusive(&file).with_context(|| {
            format!("Failed to lock state file: {}", state_path.display())
        })?;
        Ok(Self { file })
    }

    /// Block until no other process writes the state
    pub fn shared(state_path: &Path) -> Result<Self> {
        let file = open_lock_file(state_path)?;
        FileExt::lock_shared(&file).with_context(|| {
            format!("Failed to lock state file: {}", state_path.display())
        })?;
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            log::debug!("Failed to release state lock: {err}");
        }
    }
}

fn open_lock_file(state_path: &Path) -> Result<File> {
    let lock_path = state_path.with_extension("toml.lock");
    if let Some(dir) = lock_path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open state lock: {}", lock_path.display()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bulkops::{
        CommitFlags, DeviceOutput, Mode, Preview, Registry, ScheduleRequest, SublayerEntry,
        TargetSpec,
    };

    fn sample_state() -> BsaState {
        let mut entry = ServiceEntry::new("/services/vpn{a}");
        entry.redeploy_ready = true;
        entry.preview = Some(Preview {
            fetched_at: Utc::now(),
            raw_output_by_device: vec![DeviceOutput::new("ce0", "ip 10.0.0.1\n")],
            normalized_output_by_device: vec![DeviceOutput::new("ce0", "ip *WILDCARD1*\n")],
        });
        let mut sub = SublayerEntry::new("/services/l2{a-1}");
        sub.last_error = Some("out of sync".into());
        entry.modified_services.push(sub);

        let registry = Registry::from_entries([entry.clone()]);
        let now = Utc::now();
        let mut schedule = Scheduler::new();
        schedule
            .schedule(
                ScheduleRequest {
                    name: "nightly".into(),
                    target: TargetSpec::All,
                    mode: Mode::ReconcileSublayers,
                    commit_flags: CommitFlags::default(),
                    start_at: now,
                    interval_secs: 30,
                },
                &registry,
                now,
            )
            .unwrap();

        BsaState {
            last_updated: now,
            tracked_fingerprint: Some("abc".into()),
            approved_diffs: ["ip *WILDCARD1*\n"].into_iter().collect(),
            services: vec![entry, ServiceEntry::new("/services/vpn{b}")],
            schedule,
        }
    }

    #[test]
    fn test_missing_state_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = BsaState::load_from(&dir.path().join("state.toml")).unwrap();
        assert!(state.services.is_empty());
        assert!(state.tracked_fingerprint.is_none());
    }

    #[test]
    fn test_state_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bsa").join("state.toml");
        let mut state = sample_state();

        state.save_to(&path).unwrap();
        let loaded = BsaState::load_from(&path).unwrap();

        assert_eq!(loaded, state);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        fs::write(&path, "services = 42").unwrap();
        assert!(BsaState::load_from(&path).is_err());
    }

    #[test]
    fn test_merge_keeps_entries_changed_elsewhere() {
        let base = sample_state();

        let mut ours = base.clone();
        ours.services[0].last_error = Some("boom".into());
        ours.approved_diffs.insert("+ mtu 9000");

        let mut disk = base.clone();
        disk.services[1].redeploy_ready = true;
        disk.approved_diffs.remove("ip *WILDCARD1*\n");

        disk.merge_changes(&base, &ours);
        assert_eq!(disk.services[0].last_error.as_deref(), Some("boom"));
        assert!(disk.services[1].redeploy_ready);
        assert!(disk.approved_diffs.contains("+ mtu 9000"));
        assert!(!disk.approved_diffs.contains("ip *WILDCARD1*\n"));
        assert_eq!(disk.schedule, base.schedule);
    }

    #[test]
    fn test_merge_takes_rebuilt_service_list_whole() {
        let base = sample_state();

        let mut ours = base.clone();
        ours.services = vec![ServiceEntry::new("/services/vpn{c}")];
        ours.tracked_fingerprint = Some("def".into());

        let mut disk = base.clone();
        disk.services[0].redeploy_ready = false;

        disk.merge_changes(&base, &ours);
        assert_eq!(disk.services, ours.services);
        assert_eq!(disk.tracked_fingerprint.as_deref(), Some("def"));
    }

    #[test]
    fn test_merge_drops_updates_to_services_gone_from_disk() {
        let base = sample_state();

        let mut ours = base.clone();
        ours.services[1].last_error = Some("late".into());

        let mut disk = base.clone();
        disk.services.truncate(1);

        disk.merge_changes(&base, &ours);
        assert_eq!(disk.services.len(), 1);
        assert_eq!(disk.services[0], base.services[0]);
    }

    #[test]
    fn test_lock_file_sits_beside_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bsa").join("state.toml");
        {
            let _shared = StateLock::shared(&path).unwrap();
            let _also_shared = StateLock::shared(&path).unwrap();
        }
        let _exclusive = StateLock::exclusive(&path).unwrap();
        assert!(dir.path().join("bsa").join("state.toml.lock").exists());
        assert!(!path.exists());
    }
}
