//! Scheduler - fans a target set out into independently-timed units
//!
//! Each resolved service gets exactly one unit so that every unit stays
//! within the backend's single-operation timeout. Start offsets throttle
//! issuance only; units may overlap and complete in any order.
//!
//! Finished units are kept until explicitly deleted or pruned.

use crate::error::{Error, Result};
use crate::executor::Execution;
use crate::registry::Registry;
use crate::target::TargetSpec;
use crate::types::{CommitFlags, Mode};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Default stagger between consecutive units
pub const DEFAULT_INTERVAL_SECS: u64 = 30;

static DELAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:(\d+)\s*h)?\s*(?:(\d+)\s*m)?\s*$").expect("delay pattern is valid")
});

/// Lifecycle of a scheduled unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl UnitState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One single-service execution bound to a start time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledUnit {
    /// `<name>_<mode>_<keypath>`
    pub id: String,
    pub schedule_name: String,
    pub mode: Mode,
    pub keypath: String,
    pub start_at: DateTime<Utc>,
    pub state: UnitState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages: Vec<String>,
    pub commit_flags: CommitFlags,
}

impl ScheduledUnit {
    pub fn unit_id(name: &str, mode: Mode, keypath: &str) -> String {
        format!("{name}_{mode}_{keypath}")
    }
}

/// Parameters for [`Scheduler::schedule`]
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub name: String,
    pub target: TargetSpec,
    pub mode: Mode,
    pub commit_flags: CommitFlags,
    pub start_at: DateTime<Utc>,
    pub interval_secs: u64,
}

/// All scheduled units, in creation order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scheduler {
    units: Vec<ScheduledUnit>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_units(units: Vec<ScheduledUnit>) -> Self {
        Self { units }
    }

    pub fn units(&self) -> &[ScheduledUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Names of all schedules, in creation order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for unit in &self.units {
            if !names.contains(&unit.schedule_name.as_str()) {
                names.push(&unit.schedule_name);
            }
        }
        names
    }

    /// Create one unit per resolved target
    ///
    /// The target is resolved once, now. Unit `i` starts at
    /// `start_at + i * interval`. Returns the new unit ids.
    pub fn schedule(
        &mut self,
        request: ScheduleRequest,
        registry: &Registry,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        if request.interval_secs == 0 {
            return Err(Error::InvalidInterval);
        }
        if request.start_at < now {
            return Err(Error::StartInPast(request.start_at));
        }
        if self.units.iter().any(|u| u.schedule_name == request.name) {
            return Err(Error::DuplicateSchedule(request.name));
        }

        let interval = i64::try_from(request.interval_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or(Error::InvalidInterval)?;
        let keypaths = request.target.resolve(registry);

        let mut starts = Vec::with_capacity(keypaths.len());
        let mut start_at = request.start_at;
        for index in 0..keypaths.len() {
            if index > 0 {
                start_at = start_at
                    .checked_add_signed(interval)
                    .ok_or(Error::InvalidInterval)?;
            }
            starts.push(start_at);
        }

        let mut ids = Vec::with_capacity(keypaths.len());
        for (keypath, start_at) in keypaths.into_iter().zip(starts) {
            let id = ScheduledUnit::unit_id(&request.name, request.mode, &keypath);
            self.units.push(ScheduledUnit {
                id: id.clone(),
                schedule_name: request.name.clone(),
                mode: request.mode,
                keypath,
                commit_flags: request.commit_flags,
                start_at,
                state: UnitState::Pending,
                started_at: None,
                finished_at: None,
                messages: Vec::new(),
            });
            ids.push(id);
        }

        log::info!(
            "Scheduled {} {} units for `{}` starting {}",
            ids.len(),
            request.mode,
            request.name,
            request.start_at
        );
        Ok(ids)
    }

    /// Move every due pending unit to running
    ///
    /// A unit is due strictly at or after its start time. Returns copies of
    /// the claimed units.
    pub fn claim_due(&mut self, now: DateTime<Utc>) -> Vec<ScheduledUnit> {
        self.units
            .iter_mut()
            .filter(|u| u.state == UnitState::Pending && u.start_at <= now)
            .map(|unit| {
                unit.state = UnitState::Running;
                unit.started_at = Some(now);
                unit.clone()
            })
            .collect()
    }

    /// Record the result of a running unit
    ///
    /// Returns `false` if the unit no longer exists (deleted while running).
    pub fn complete(&mut self, id: &str, execution: &Execution, now: DateTime<Utc>) -> bool {
        let messages = execution.messages.iter().map(str::to_string).collect();
        self.finish(id, execution.is_success(), messages, now)
    }

    /// Mark a running unit failed without an execution, e.g. when its
    /// worker could not load the service list
    pub fn fail(&mut self, id: &str, message: impl Into<String>, now: DateTime<Utc>) -> bool {
        self.finish(id, false, vec![message.into()], now)
    }

    fn finish(
        &mut self,
        id: &str,
        succeeded: bool,
        messages: Vec<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(unit) = self.units.iter_mut().find(|u| u.id == id) else {
            log::warn!("Unit {id} was deleted while running, dropping its result");
            return false;
        };
        unit.state = if succeeded {
            UnitState::Succeeded
        } else {
            UnitState::Failed
        };
        unit.finished_at = Some(now);
        unit.messages = messages;
        log::debug!("Unit {id} {}", unit.state);
        true
    }

    /// Apply the unit-level changes between `before` and `after` to this
    /// schedule
    ///
    /// Units changed in `after` overwrite their copy here, units only in
    /// `after` are appended and units dropped from `before` are removed.
    /// A changed unit that is no longer here stays deleted.
    pub fn merge_changes(&mut self, before: &Self, after: &Self) {
        let find = |units: &[ScheduledUnit], id: &str| units.iter().position(|u| u.id == id);

        self.units.retain(|u| {
            find(&before.units, &u.id).is_none() || find(&after.units, &u.id).is_some()
        });

        for unit in &after.units {
            match (find(&before.units, &unit.id), find(&self.units, &unit.id)) {
                (Some(old), Some(here)) if before.units[old] != *unit => {
                    self.units[here] = unit.clone();
                }
                (None, Some(here)) => self.units[here] = unit.clone(),
                (None, None) => self.units.push(unit.clone()),
                _ => {}
            }
        }
    }

    /// Delete every unit of a named schedule
    ///
    /// Deleting a running unit does not stop its in-flight call.
    pub fn delete(&mut self, name: &str) -> usize {
        let before = self.units.len();
        self.units.retain(|u| {
            if u.schedule_name == name && u.state == UnitState::Running {
                log::warn!("Deleting running unit {}; its operation keeps going", u.id);
            }
            u.schedule_name != name
        });
        before - self.units.len()
    }

    /// Remove finished units
    pub fn prune(&mut self) -> usize {
        let before = self.units.len();
        self.units.retain(|u| !u.state.is_finished());
        before - self.units.len()
    }

    /// Earliest start among pending units
    pub fn next_start(&self) -> Option<DateTime<Utc>> {
        self.units
            .iter()
            .filter(|u| u.state == UnitState::Pending)
            .map(|u| u.start_at)
            .min()
    }

    pub fn has_pending(&self) -> bool {
        self.units.iter().any(|u| u.state == UnitState::Pending)
    }
}

/// Parse a relative delay such as `1h30m`, `2h` or `45m`
pub fn parse_delay(input: &str) -> Result<Duration> {
    let invalid = || Error::InvalidDelay(input.to_string());
    let caps = DELAY_RE.captures(input).ok_or_else(invalid)?;

    let hours = caps.get(1).map(|m| m.as_str().parse::<i64>());
    let minutes = caps.get(2).map(|m| m.as_str().parse::<i64>());
    if hours.is_none() && minutes.is_none() {
        return Err(invalid());
    }

    let hours = hours.transpose().map_err(|_| invalid())?.unwrap_or(0);
    let minutes = minutes.transpose().map_err(|_| invalid())?.unwrap_or(0);
    Duration::try_hours(hours)
        .zip(Duration::try_minutes(minutes))
        .and_then(|(h, m)| h.checked_add(&m))
        .ok_or_else(invalid)
}
