//! Operation executor - runs redeploy/reconcile against the backend
//!
//! Every execution path (direct batch or scheduled unit) goes through
//! [`Executor::execute`], which calls the backend without holding any
//! registry lock and then applies the resulting transition to the entry in a
//! single atomic update. Per-service failures never abort a batch: they are
//! recorded in the entry (apply) or in the output (preview) and counted.

use crate::approval::ApprovedDiffs;
use crate::backend::{RedeployRequest, ServiceBackend};
use crate::context::ProgressCallback;
use crate::error::{Error, Result};
use crate::normalize::WildcardPatterns;
use crate::output::OutputSet;
use crate::registry::Registry;
use crate::types::{CommitFlags, Mode, OperationState, SublayerEntry};
use chrono::Utc;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Mutex;

pub const MSG_NOT_POPULATED: &str = "Please run services populate first!";
pub const MSG_ERRORS: &str = "There were errors during one or more redeploys";
pub const MSG_NOT_READY: &str = "Redeploy-ready not set for one or more services";

/// Result of one unit of work (a top-level service or one sublayer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Dry-run stored; `ready` is the service's readiness afterwards, `None`
    /// for sublayers, which carry no readiness of their own
    Previewed { ready: Option<bool> },
    /// Real apply succeeded
    Applied,
    /// Apply refused because the service was not ready
    Refused,
    /// The backend reported a failure or timed out
    Failed { error: String },
    /// Entry disappeared from the registry
    Missing,
    /// Nothing to do (e.g. no tracked sublayers)
    Skipped,
}

impl Outcome {
    fn severity(&self) -> u8 {
        match self {
            Self::Skipped => 0,
            Self::Previewed { .. } => 1,
            Self::Applied => 2,
            Self::Missing => 3,
            Self::Refused => 4,
            Self::Failed { .. } => 5,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Previewed { .. } | Self::Applied | Self::Skipped)
    }
}

/// Everything one `execute` call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub keypath: String,
    pub mode: Mode,
    /// Per-unit outcomes, keyed by the unit's own keypath
    pub units: Vec<(String, Outcome)>,
    pub messages: OutputSet,
}

impl Execution {
    fn new(keypath: &str, mode: Mode) -> Self {
        Self {
            keypath: keypath.to_string(),
            mode,
            units: Vec::new(),
            messages: OutputSet::new(),
        }
    }

    fn record(&mut self, unit: &str, outcome: Outcome) {
        match &outcome {
            Outcome::Previewed { ready: Some(ready) } => {
                self.messages
                    .add(format!("{unit}: dry-run fetched (redeploy-ready {ready})"));
            }
            Outcome::Previewed { ready: None } => {
                self.messages.add(format!("{unit}: dry-run fetched"));
            }
            Outcome::Applied => {
                self.messages.add(format!("{unit}: redeployed"));
            }
            Outcome::Refused => {
                self.messages.add(MSG_NOT_READY);
                let reason = match self.mode {
                    Mode::RedeployTopLevel => "not flagged as redeploy-ready",
                    Mode::ReconcileSublayers => {
                        "not flagged as redeploy-ready or not yet redeployed"
                    }
                };
                self.messages
                    .add(format!("Service {} {reason}, skipping", self.keypath));
            }
            Outcome::Failed { error } => {
                self.messages.add(MSG_ERRORS);
                self.messages.add(format!("{unit}: {error}"));
            }
            Outcome::Missing => {
                self.messages
                    .add(format!("{unit}: no longer in the service list, skipping"));
            }
            Outcome::Skipped => {
                self.messages
                    .add(format!("{unit}: no tracked sublayers, nothing to reconcile"));
            }
        }
        self.units.push((unit.to_string(), outcome));
    }

    /// Most severe unit outcome, used for progress reporting
    pub fn outcome(&self) -> Outcome {
        self.units
            .iter()
            .map(|(_, outcome)| outcome)
            .max_by_key(|outcome| outcome.severity())
            .cloned()
            .unwrap_or(Outcome::Skipped)
    }

    /// Whether every unit succeeded
    pub fn is_success(&self) -> bool {
        self.units.iter().all(|(_, outcome)| outcome.is_success())
    }
}

/// Aggregate result of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub messages: OutputSet,
    pub previewed: usize,
    pub applied: usize,
    pub refused: usize,
    pub failed: usize,
    pub missing: usize,
    pub skipped: usize,
}

impl BatchReport {
    /// Fold one execution into the report
    pub fn add(&mut self, execution: Execution) {
        for (_, outcome) in &execution.units {
            match outcome {
                Outcome::Previewed { .. } => self.previewed += 1,
                Outcome::Applied => self.applied += 1,
                Outcome::Refused => self.refused += 1,
                Outcome::Failed { .. } => self.failed += 1,
                Outcome::Missing => self.missing += 1,
                Outcome::Skipped => self.skipped += 1,
            }
        }
        self.messages.merge(execution.messages);
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.messages.merge(other.messages);
        self.previewed += other.previewed;
        self.applied += other.applied;
        self.refused += other.refused;
        self.failed += other.failed;
        self.missing += other.missing;
        self.skipped += other.skipped;
    }

    /// Total number of units processed
    pub fn total(&self) -> usize {
        self.previewed + self.applied + self.refused + self.failed + self.missing + self.skipped
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.refused > 0
    }
}

/// Runs operations for single services against the shared state
pub struct Executor<'a> {
    registry: &'a Registry,
    approvals: &'a ApprovedDiffs,
    patterns: &'a WildcardPatterns,
    backend: &'a dyn ServiceBackend,
}

impl<'a> Executor<'a> {
    pub fn new(
        registry: &'a Registry,
        approvals: &'a ApprovedDiffs,
        patterns: &'a WildcardPatterns,
        backend: &'a dyn ServiceBackend,
    ) -> Self {
        Self {
            registry,
            approvals,
            patterns,
            backend,
        }
    }

    /// Execute one service
    pub fn execute(&self, keypath: &str, mode: Mode, flags: CommitFlags) -> Execution {
        let mut execution = Execution::new(keypath, mode);
        match mode {
            Mode::RedeployTopLevel => self.redeploy_top_level(&mut execution, flags),
            Mode::ReconcileSublayers => self.reconcile_sublayers(&mut execution, flags),
        }
        execution
    }

    fn redeploy_top_level(&self, execution: &mut Execution, flags: CommitFlags) {
        let keypath = execution.keypath.clone();
        let Some(entry) = self.registry.get(&keypath) else {
            execution.record(&keypath, Outcome::Missing);
            return;
        };

        if !flags.dry_run && !entry.redeploy_ready {
            log::warn!("Refusing to redeploy {keypath}: not redeploy-ready");
            execution.record(&keypath, Outcome::Refused);
            return;
        }

        let request = RedeployRequest::new(flags, false);
        let result = self.backend.redeploy(&keypath, &request);
        let now = Utc::now();

        let outcome = match result {
            Ok(outputs) if flags.dry_run => {
                let preview = self.patterns.preview(outputs, now);
                self.registry.update(&keypath, |entry| {
                    entry.record_preview(preview);
                    self.approvals.evaluate_readiness(entry);
                    Outcome::Previewed {
                        ready: Some(entry.redeploy_ready),
                    }
                })
            }
            Ok(_) => self.registry.update(&keypath, |entry| {
                entry.record_apply_success(now);
                Outcome::Applied
            }),
            Err(err) if flags.dry_run => Some(Outcome::Failed {
                error: err.to_string(),
            }),
            Err(err) => self.registry.update(&keypath, |entry| {
                entry.record_apply_failure(err.to_string());
                Outcome::Failed {
                    error: err.to_string(),
                }
            }),
        };

        let outcome = outcome.unwrap_or(Outcome::Missing);
        log::debug!("{keypath}: {outcome:?}");
        execution.record(&keypath, outcome);
    }

    fn reconcile_sublayers(&self, execution: &mut Execution, flags: CommitFlags) {
        let keypath = execution.keypath.clone();
        let Some(entry) = self.registry.get(&keypath) else {
            execution.record(&keypath, Outcome::Missing);
            return;
        };

        if entry.modified_services.is_empty() {
            execution.record(&keypath, Outcome::Skipped);
            return;
        }

        let allowed = entry.redeploy_ready || entry.redeployed_at.is_some();
        let request = RedeployRequest::new(flags, true);

        for sublayer in &entry.modified_services {
            let sub = sublayer.keypath.as_str();
            if !flags.dry_run && !allowed {
                log::warn!("Refusing to reconcile {sub}: {keypath} not ready nor redeployed");
                execution.record(sub, Outcome::Refused);
                continue;
            }

            let result = self.backend.redeploy(sub, &request);
            let now = Utc::now();

            let outcome = match result {
                Ok(outputs) if flags.dry_run => {
                    let preview = self.patterns.preview(outputs, now);
                    self.update_sublayer(&keypath, sub, |s| {
                        s.record_preview(preview);
                        Outcome::Previewed { ready: None }
                    })
                }
                Ok(_) => self.update_sublayer(&keypath, sub, |s| {
                    s.record_apply_success(now);
                    Outcome::Applied
                }),
                Err(err) if flags.dry_run => Some(Outcome::Failed {
                    error: err.to_string(),
                }),
                Err(err) => self.update_sublayer(&keypath, sub, |s| {
                    s.record_apply_failure(err.to_string());
                    Outcome::Failed {
                        error: err.to_string(),
                    }
                }),
            };

            let outcome = outcome.unwrap_or(Outcome::Missing);
            log::debug!("{sub}: {outcome:?}");
            execution.record(sub, outcome);
        }
    }

    fn update_sublayer<R>(
        &self,
        parent: &str,
        sublayer: &str,
        f: impl FnOnce(&mut SublayerEntry) -> R,
    ) -> Option<R> {
        self.registry
            .update(parent, |entry| entry.sublayer_mut(sublayer).map(f))
            .flatten()
    }

    /// Execute every resolved service
    ///
    /// Runs sequentially when `jobs` is 1, otherwise on a dedicated thread
    /// pool. Results are folded in keypath order so the output is stable
    /// regardless of completion order.
    pub fn run_batch<P: ProgressCallback>(
        &self,
        keypaths: &BTreeSet<String>,
        mode: Mode,
        flags: CommitFlags,
        jobs: usize,
        progress: &mut P,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        if self.registry.is_empty() {
            report.messages.add(MSG_NOT_POPULATED);
            return Ok(report);
        }

        report.messages.add(format!(
            "{mode} action called with dry-run {} and no-networking {} for {} service(s)",
            flags.dry_run,
            flags.no_networking,
            keypaths.len()
        ));
        log::debug!("{mode} targets: {keypaths:?}");

        progress.on_batch_start(keypaths.len());

        let executions = if jobs <= 1 || keypaths.len() <= 1 {
            keypaths
                .iter()
                .map(|keypath| {
                    progress.on_service_start(keypath);
                    let execution = self.execute(keypath, mode, flags);
                    progress.on_service_complete(keypath, &execution.outcome());
                    execution
                })
                .collect::<Vec<_>>()
        } else {
            self.execute_parallel(keypaths, mode, flags, jobs, progress)?
        };

        for execution in executions {
            report.add(execution);
        }

        progress.on_batch_complete();
        Ok(report)
    }

    fn execute_parallel<P: ProgressCallback>(
        &self,
        keypaths: &BTreeSet<String>,
        mode: Mode,
        flags: CommitFlags,
        jobs: usize,
        progress: &mut P,
    ) -> Result<Vec<Execution>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;

        let progress = Mutex::new(progress);
        let report = |f: &mut dyn FnMut(&mut P)| {
            let mut guard = match progress.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut **guard);
        };

        let keypaths: Vec<&String> = keypaths.iter().collect();
        Ok(pool.install(|| {
            keypaths
                .par_iter()
                .map(|keypath| {
                    report(&mut |p| p.on_service_start(keypath));
                    let execution = self.execute(keypath, mode, flags);
                    let outcome = execution.outcome();
                    report(&mut |p| p.on_service_complete(keypath, &outcome));
                    execution
                })
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::context::NoProgress;
    use crate::types::{DeviceOutput, Preview, ServiceEntry};

    const KP: &str = "/services/vpn{a}";

    fn preview(outputs: &[&str]) -> Preview {
        let devices: Vec<DeviceOutput> = outputs
            .iter()
            .map(|o| DeviceOutput::new("ce0", *o))
            .collect();
        Preview {
            fetched_at: Utc::now(),
            raw_output_by_device: devices.clone(),
            normalized_output_by_device: devices,
        }
    }

    struct Fixture {
        registry: Registry,
        approvals: ApprovedDiffs,
        patterns: WildcardPatterns,
        backend: MockBackend,
    }

    impl Fixture {
        fn new(entries: Vec<ServiceEntry>, backend: MockBackend) -> Self {
            Self {
                registry: Registry::from_entries(entries),
                approvals: ApprovedDiffs::new(),
                patterns: WildcardPatterns::default(),
                backend,
            }
        }

        fn executor(&self) -> Executor<'_> {
            Executor::new(&self.registry, &self.approvals, &self.patterns, &self.backend)
        }

        fn entry(&self, keypath: &str) -> ServiceEntry {
            self.registry.get(keypath).expect("entry exists")
        }
    }

    #[test]
    fn test_apply_refused_when_not_ready() {
        let mut entry = ServiceEntry::new(KP);
        entry.preview = Some(preview(&["x"]));
        entry.last_error = Some("old".into());
        let before = entry.clone();
        let fx = Fixture::new(vec![entry], MockBackend::new());

        let execution = fx.executor().execute(KP, Mode::RedeployTopLevel, CommitFlags::commit());

        assert_eq!(execution.outcome(), Outcome::Refused);
        assert!(execution.messages.contains(MSG_NOT_READY));
        assert!(fx.backend.calls().is_empty());
        assert_eq!(fx.entry(KP), before);
    }

    #[test]
    fn test_dry_run_with_empty_diff_is_ready() {
        let fx = Fixture::new(
            vec![ServiceEntry::new(KP)],
            MockBackend::new().with_output(KP, &[("ce0", ""), ("ce1", "")]),
        );

        let execution = fx.executor().execute(KP, Mode::RedeployTopLevel, CommitFlags::default());

        assert_eq!(execution.outcome(), Outcome::Previewed { ready: Some(true) });
        let entry = fx.entry(KP);
        assert!(entry.redeploy_ready);
        assert_eq!(entry.preview.expect("preview").normalized_output_by_device.len(), 2);
        let (_, request) = &fx.backend.calls()[0];
        assert!(request.dry_run);
        assert!(!request.reconcile);
    }

    #[test]
    fn test_dry_run_normalizes_and_clears_error() {
        let mut entry = ServiceEntry::new(KP);
        entry.last_error = Some("old".into());
        let mut fx = Fixture::new(
            vec![entry],
            MockBackend::new().with_output(KP, &[("ce0", "ip 10.0.0.1")]),
        );
        fx.patterns = WildcardPatterns::new([r"\d+\.\d+\.\d+\.\d+"]).expect("valid");

        fx.executor().execute(KP, Mode::RedeployTopLevel, CommitFlags::default());

        let entry = fx.entry(KP);
        let preview = entry.preview.expect("preview");
        assert!(entry.last_error.is_none());
        assert!(!entry.redeploy_ready);
        assert_eq!(preview.raw_output_by_device[0].output, "ip 10.0.0.1");
        assert_eq!(preview.normalized_output_by_device[0].output, "ip *WILDCARD1*");
    }

    #[test]
    fn test_dry_run_with_approved_diff_is_ready() {
        let mut fx = Fixture::new(
            vec![ServiceEntry::new(KP)],
            MockBackend::new().with_output(KP, &[("ce0", "line1"), ("ce1", "line2")]),
        );
        fx.approvals = ["line1", "line2"].into_iter().collect();

        fx.executor().execute(KP, Mode::RedeployTopLevel, CommitFlags::default());
        assert!(fx.entry(KP).redeploy_ready);
    }

    #[test]
    fn test_dry_run_failure_leaves_entry_alone() {
        let mut entry = ServiceEntry::new(KP);
        entry.preview = Some(preview(&["x"]));
        let before = entry.clone();
        let fx = Fixture::new(vec![entry], MockBackend::new().with_failure(KP, "boom"));

        let execution = fx.executor().execute(KP, Mode::RedeployTopLevel, CommitFlags::default());

        assert!(!execution.is_success());
        assert!(execution.messages.contains(MSG_ERRORS));
        assert_eq!(fx.entry(KP), before);
    }

    #[test]
    fn test_apply_success_clears_preview_and_error() {
        let mut entry = ServiceEntry::new(KP);
        entry.redeploy_ready = true;
        entry.preview = Some(preview(&["x"]));
        entry.last_error = Some("X".into());
        let fx = Fixture::new(vec![entry], MockBackend::new());

        let before = Utc::now();
        let execution = fx.executor().execute(KP, Mode::RedeployTopLevel, CommitFlags::commit());

        assert_eq!(execution.outcome(), Outcome::Applied);
        let entry = fx.entry(KP);
        assert!(entry.preview.is_none());
        assert!(entry.last_error.is_none());
        assert!(entry.redeployed_at.expect("timestamp") >= before);
        assert!(entry.redeploy_ready);
    }

    #[test]
    fn test_apply_failure_sets_error_only() {
        let earlier = Utc::now() - chrono::Duration::days(1);
        let mut entry = ServiceEntry::new(KP);
        entry.redeploy_ready = true;
        entry.redeployed_at = Some(earlier);
        let fx = Fixture::new(vec![entry], MockBackend::new().with_failure(KP, "device locked"));

        fx.executor().execute(KP, Mode::RedeployTopLevel, CommitFlags::commit());

        let entry = fx.entry(KP);
        assert_eq!(entry.last_error.as_deref(), Some("device locked"));
        assert_eq!(entry.redeployed_at, Some(earlier));
        assert!(entry.redeploy_ready);
    }

    #[test]
    fn test_reconcile_calls_backend_per_sublayer() {
        let entry = ServiceEntry::new(KP)
            .with_sublayer("/services/sub{1}")
            .with_sublayer("/services/sub{2}");
        let fx = Fixture::new(
            vec![entry],
            MockBackend::new().with_output("/services/sub{1}", &[("pe0", "vlan 10")]),
        );

        let execution =
            fx.executor().execute(KP, Mode::ReconcileSublayers, CommitFlags::default());

        let calls = fx.backend.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, r)| r.reconcile && r.dry_run));
        assert_eq!(execution.units.len(), 2);
        assert!(execution.units.iter().all(|(_, o)| *o == Outcome::Previewed { ready: None }));
        assert!(execution.messages.contains("/services/sub{1}: dry-run fetched"));
        assert!(!execution.messages.iter().any(|m| m.contains("redeploy-ready")));
        let entry = fx.entry(KP);
        assert!(entry.preview.is_none());
        assert!(entry.modified_services.iter().all(|s| s.preview.is_some()));
    }

    #[test]
    fn test_reconcile_apply_gated_on_parent() {
        let entry = ServiceEntry::new(KP).with_sublayer("/services/sub{1}");
        let fx = Fixture::new(vec![entry], MockBackend::new());

        let execution = fx.executor().execute(KP, Mode::ReconcileSublayers, CommitFlags::commit());
        assert_eq!(execution.outcome(), Outcome::Refused);
        assert!(fx.backend.calls().is_empty());
        assert_eq!(fx.entry(KP).modified_services[0], SublayerEntry::new("/services/sub{1}"));
    }

    #[test]
    fn test_reconcile_apply_allowed_after_parent_redeploy() {
        let mut entry = ServiceEntry::new(KP).with_sublayer("/services/sub{1}");
        entry.redeployed_at = Some(Utc::now());
        let fx = Fixture::new(
            vec![entry],
            MockBackend::new().with_failure("/services/sub{1}", "out of sync"),
        );

        fx.executor().execute(KP, Mode::ReconcileSublayers, CommitFlags::commit());

        let entry = fx.entry(KP);
        assert_eq!(entry.modified_services[0].last_error.as_deref(), Some("out of sync"));
        assert!(entry.last_error.is_none());
    }

    #[test]
    fn test_reconcile_without_sublayers_is_skipped() {
        let fx = Fixture::new(vec![ServiceEntry::new(KP)], MockBackend::new());
        let execution =
            fx.executor().execute(KP, Mode::ReconcileSublayers, CommitFlags::default());
        assert_eq!(execution.outcome(), Outcome::Skipped);
        assert!(execution.is_success());
    }

    #[test]
    fn test_missing_entry_is_reported() {
        let fx = Fixture::new(vec![ServiceEntry::new(KP)], MockBackend::new());
        let execution =
            fx.executor().execute("/services/gone", Mode::RedeployTopLevel, CommitFlags::default());
        assert_eq!(execution.outcome(), Outcome::Missing);
    }

    #[test]
    fn test_batch_on_empty_registry() {
        let fx = Fixture::new(Vec::new(), MockBackend::new());
        let report = fx
            .executor()
            .run_batch(
                &BTreeSet::new(),
                Mode::RedeployTopLevel,
                CommitFlags::default(),
                1,
                &mut NoProgress,
            )
            .expect("batch runs");
        assert_eq!(report.messages.iter().collect::<Vec<_>>(), vec![MSG_NOT_POPULATED]);
    }

    #[test]
    fn test_batch_continues_past_failures() {
        let keys: Vec<String> = (0..20).map(|i| format!("/services/vpn{{{i:02}}}")).collect();
        let mut backend = MockBackend::new();
        for key in keys.iter().step_by(3) {
            backend = backend.with_failure(key, "boom");
        }
        let entries = keys
            .iter()
            .map(|k| {
                let mut e = ServiceEntry::new(k.as_str());
                e.redeploy_ready = true;
                e
            })
            .collect();
        let fx = Fixture::new(entries, backend);
        let targets: BTreeSet<String> = keys.iter().cloned().collect();

        for jobs in [1, 4] {
            let report = fx
                .executor()
                .run_batch(
                    &targets,
                    Mode::RedeployTopLevel,
                    CommitFlags::default(),
                    jobs,
                    &mut NoProgress,
                )
                .expect("batch runs");
            assert_eq!(report.failed, 7, "jobs={jobs}");
            assert_eq!(report.previewed, 13, "jobs={jobs}");
            assert_eq!(report.total(), 20);
            assert_eq!(
                report.messages.iter().filter(|m| *m == MSG_ERRORS).count(),
                1
            );
        }
    }

    #[test]
    fn test_parallel_and_sequential_messages_match() {
        let keys: Vec<String> = (0..10).map(|i| format!("k{i}")).collect();
        let fx = Fixture::new(
            keys.iter().map(|k| ServiceEntry::new(k.as_str())).collect(),
            MockBackend::new().with_failure("k3", "boom"),
        );
        let targets: BTreeSet<String> = keys.into_iter().collect();
        let run = |jobs| {
            fx.executor()
                .run_batch(
                    &targets,
                    Mode::RedeployTopLevel,
                    CommitFlags::default(),
                    jobs,
                    &mut NoProgress,
                )
                .expect("batch runs")
                .messages
        };
        assert_eq!(run(1), run(3));
    }
}
