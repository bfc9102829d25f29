//! Loaded configuration and state for one bsa invocation
//!
//! A session owns the in-memory registry, approvals and schedule built from
//! `state.toml`, plus the parsed `config.toml`. Commands mutate it and call
//! [`Session::save`] when done.
//!
//! Several bsa processes may share one state file (a long-running schedule
//! worker next to interactive commands). Saving re-reads the file under an
//! exclusive lock and writes back only what this session changed since it
//! last loaded or saved.

use crate::paths;
use crate::schema::BsaConfig;
use crate::state::{BsaState, StateLock};
use anyhow::Result;
use bulkops::populate::invalidate;
use bulkops::{ApprovedDiffs, Executor, Registry, Scheduler, ServiceBackend, WildcardPatterns};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct Session {
    pub config: BsaConfig,
    pub registry: Registry,
    pub approvals: ApprovedDiffs,
    pub scheduler: Scheduler,
    pub patterns: WildcardPatterns,
    /// Set when the service list was wiped on load
    pub invalidated: usize,
    config_path: PathBuf,
    state_path: PathBuf,
    /// State as this session last read or wrote it
    baseline: Mutex<BsaState>,
}

impl Session {
    /// Open the session at the default locations
    pub fn open() -> Result<Self> {
        Self::open_at(&paths::config_file()?, &paths::state_file()?)
    }

    pub fn open_at(config_path: &Path, state_path: &Path) -> Result<Self> {
        let config = BsaConfig::load_from(config_path)?;
        let state = {
            let _lock = StateLock::shared(state_path)?;
            BsaState::load_from(state_path)?
        };
        let baseline = Mutex::new(state.clone());
        let patterns = config.patterns()?;

        let registry = Registry::from_entries(state.services);
        let current = config.service_list.fingerprint();
        let mut invalidated = 0;
        if state
            .tracked_fingerprint
            .as_deref()
            .is_some_and(|stored| stored != current)
            && !registry.is_empty()
        {
            invalidated = invalidate(&registry, "tracked service types changed in config");
        }

        Ok(Self {
            config,
            registry,
            approvals: state.approved_diffs,
            scheduler: state.schedule,
            patterns,
            invalidated,
            config_path: config_path.to_path_buf(),
            state_path: state_path.to_path_buf(),
            baseline,
        })
    }

    /// Executor over this session's state
    pub fn executor<'a>(&'a self, backend: &'a dyn ServiceBackend) -> Executor<'a> {
        Executor::new(&self.registry, &self.approvals, &self.patterns, backend)
    }

    /// Persist this session's changes to registry, approvals and schedule
    ///
    /// Changes other processes saved in the meantime are kept.
    pub fn save(&self) -> Result<()> {
        let ours = self.snapshot();
        let mut baseline = match self.baseline.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let _lock = StateLock::exclusive(&self.state_path)?;
        let mut stored = BsaState::load_from(&self.state_path)?;
        stored.merge_changes(&baseline, &ours);
        stored.save_to(&self.state_path)?;

        *baseline = ours;
        Ok(())
    }

    /// Run `f` on the schedule as currently stored and persist the result
    ///
    /// The state stays locked throughout, so units created or deleted by
    /// other processes are seen and kept. This session's own copy of the
    /// schedule is left alone.
    pub fn with_stored_schedule<T>(&self, f: impl FnOnce(&mut Scheduler) -> T) -> Result<T> {
        let _lock = StateLock::exclusive(&self.state_path)?;
        let mut stored = BsaState::load_from(&self.state_path)?;
        let result = f(&mut stored.schedule);
        stored.save_to(&self.state_path)?;
        Ok(result)
    }

    fn snapshot(&self) -> BsaState {
        BsaState {
            tracked_fingerprint: Some(self.config.service_list.fingerprint()),
            approved_diffs: self.approvals.clone(),
            services: self.registry.snapshot(),
            schedule: self.scheduler.clone(),
            ..BsaState::default()
        }
    }

    /// Persist the configuration and refresh the compiled patterns
    pub fn save_config(&mut self) -> Result<()> {
        self.config.validate()?;
        self.patterns = self.config.patterns()?;
        self.config.save_to(&self.config_path)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }
}
