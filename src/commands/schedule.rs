//! Schedule command - create, inspect and run staggered units

use anyhow::{Context, Result, bail};
use bulkops::{Execution, Mode, ScheduleRequest, ScheduledUnit, UnitState, parse_delay};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use colored::Colorize;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use super::{backend, open_session, target_spec};
use crate::Context as AppContext;
use crate::cli::{ScheduleCommand, ScheduleCreateArgs};
use crate::session::Session;
use crate::ui;

/// Longest the worker waits before re-reading the state file
const MAX_IDLE: Duration = Duration::from_secs(30);

pub fn run(ctx: &AppContext, cmd: ScheduleCommand) -> Result<()> {
    match cmd {
        ScheduleCommand::Create(args) => create(args),
        ScheduleCommand::List { name } => list(name.as_deref()),
        ScheduleCommand::Delete { name } => delete(&name),
        ScheduleCommand::Prune => prune(),
        ScheduleCommand::Run { once, jobs } => worker(ctx, once, jobs),
    }
}

fn create(args: ScheduleCreateArgs) -> Result<()> {
    let mut session = open_session()?;
    let now = Utc::now();
    let start_at = start_time(args.at.as_deref(), args.delay.as_deref(), now)?;
    let mode: Mode = args.action.into();

    let request = ScheduleRequest {
        name: args.name.clone(),
        target: target_spec(&session.config, &args.target)?,
        mode,
        commit_flags: args.flags.into(),
        start_at,
        interval_secs: args.interval.unwrap_or(session.config.scheduler.interval_secs),
    };
    let interval = request.interval_secs;
    let ids = session
        .scheduler
        .schedule(request, &session.registry, now)?;
    session.save()?;

    if ids.is_empty() {
        ui::warn("No services matched; nothing scheduled");
        return Ok(());
    }
    ui::success(&format!(
        "Scheduled {} {mode} unit(s) as '{}'",
        ids.len(),
        args.name
    ));
    ui::kv("First start", &ui::timestamp(Some(start_at)));
    ui::kv("Interval", &format!("{interval}s"));
    ui::dim("Run `bsa schedule run` to execute due units");
    Ok(())
}

/// Resolve `--at` or `--in` into an absolute start time
fn start_time(at: Option<&str>, delay: Option<&str>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match (at, delay) {
        (Some(at), None) => parse_start(at),
        (None, Some(delay)) => now
            .checked_add_signed(parse_delay(delay)?)
            .with_context(|| format!("Delay '{delay}' reaches past the supported time range")),
        _ => bail!("Give exactly one of --at or --in"),
    }
}

/// RFC 3339, or a local `YYYY-MM-DDTHH:MM[:SS]` (space separator accepted)
fn parse_start(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(input) {
        return Ok(at.with_timezone(&Utc));
    }

    let normalized = input.replacen(' ', "T", 1);
    let naive = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M"))
        .with_context(|| format!("Invalid start time '{input}'"))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
        .with_context(|| format!("'{input}' does not exist in the local time zone"))
}

fn list(name: Option<&str>) -> Result<()> {
    let session = open_session()?;
    let units: Vec<&ScheduledUnit> = session
        .scheduler
        .units()
        .iter()
        .filter(|u| name.is_none_or(|n| u.schedule_name == n))
        .collect();

    if units.is_empty() {
        println!("{}", "No scheduled units.".dimmed());
        return Ok(());
    }

    for schedule in session.scheduler.names() {
        if name.is_some_and(|n| n != schedule) {
            continue;
        }
        ui::section(schedule);
        for unit in units.iter().filter(|u| u.schedule_name == schedule) {
            let state = match unit.state {
                UnitState::Pending => unit.state.as_str().normal(),
                UnitState::Running => unit.state.as_str().cyan(),
                UnitState::Succeeded => unit.state.as_str().green(),
                UnitState::Failed => unit.state.as_str().red(),
            };
            println!(
                "  {:<19} {:<10} {:<20} {} {}",
                ui::timestamp(Some(unit.start_at)),
                state,
                unit.mode.as_str().dimmed(),
                ui::truncate_keypath(&unit.keypath, 48),
                if unit.commit_flags.dry_run { "" } else { "(commit)" }.yellow()
            );
            if unit.state == UnitState::Failed {
                for message in &unit.messages {
                    ui::dim(message);
                }
            }
        }
    }
    Ok(())
}

fn delete(name: &str) -> Result<()> {
    let mut session = open_session()?;
    let removed = session.scheduler.delete(name);
    if removed == 0 {
        bail!("No schedule named '{name}'");
    }
    session.save()?;
    ui::success(&format!("Deleted {removed} unit(s) of '{name}'"));
    Ok(())
}

fn prune() -> Result<()> {
    let mut session = open_session()?;
    let removed = session.scheduler.prune();
    session.save()?;
    ui::success(&format!("Removed {removed} finished unit(s)"));
    Ok(())
}

// ============================================================================
// Worker
// ============================================================================

/// A unit handed back by the pool, with what running it produced
type Finished = (ScheduledUnit, Result<Execution>);

fn worker(ctx: &AppContext, once: bool, jobs: Option<usize>) -> Result<()> {
    let session = open_session()?;
    let jobs = jobs.unwrap_or(session.config.scheduler.jobs).max(1);
    run_worker(&session, once, jobs, ctx.quiet)
}

/// Claim due units on a timer and run each on the pool as soon as it is due
///
/// Claims and results go straight to the stored schedule, so units created
/// by other processes are picked up while earlier ones are still running.
fn run_worker(session: &Session, once: bool, jobs: usize, quiet: bool) -> Result<()> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("Failed to start worker pool")?;
    let (tx, rx) = mpsc::channel::<Finished>();
    let mut running = 0_usize;
    let mut started = 0_usize;
    let mut claiming = true;

    loop {
        let now = Utc::now();
        let (claimed, next) = if claiming {
            session.with_stored_schedule(|s| (s.claim_due(now), s.next_start()))?
        } else {
            (Vec::new(), None)
        };
        claiming = !once;

        for unit in claimed {
            log::info!("Starting {} (due {})", unit.id, unit.start_at);
            running += 1;
            started += 1;
            let tx = tx.clone();
            let config_path = session.config_path().to_path_buf();
            let state_path = session.state_path().to_path_buf();
            pool.spawn(move || {
                let result = execute_unit(&config_path, &state_path, &unit);
                if tx.send((unit, result)).is_err() {
                    log::warn!("Worker stopped before a unit finished");
                }
            });
        }

        if running == 0 && (once || next.is_none()) {
            if started == 0 && !quiet {
                match next {
                    Some(next) => ui::info(&format!(
                        "Nothing due; next unit at {}",
                        ui::timestamp(Some(next))
                    )),
                    None => ui::info("No pending units"),
                }
            }
            return Ok(());
        }

        let wait = next.map_or(MAX_IDLE, |next| {
            (next - Utc::now()).to_std().unwrap_or_default().min(MAX_IDLE)
        });
        log::debug!("{running} unit(s) running, waiting up to {wait:?}");
        match rx.recv_timeout(wait) {
            Ok(finished) => {
                running -= 1;
                record(session, finished);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("Worker pool stopped unexpectedly"),
        }
        while let Ok(finished) = rx.try_recv() {
            running -= 1;
            record(session, finished);
        }
    }
}

/// Run one unit against a fresh view of the service list and persist its entry
fn execute_unit(config_path: &Path, state_path: &Path, unit: &ScheduledUnit) -> Result<Execution> {
    let session = Session::open_at(config_path, state_path)?;
    let backend = backend(&session.config)?;
    let execution = session
        .executor(&backend)
        .execute(&unit.keypath, unit.mode, unit.commit_flags);
    session.save()?;
    Ok(execution)
}

fn record(session: &Session, (unit, result): Finished) {
    let now = Utc::now();
    let stored = session.with_stored_schedule(|schedule| match &result {
        Ok(execution) => schedule.complete(&unit.id, execution, now),
        Err(err) => schedule.fail(&unit.id, format!("{err:#}"), now),
    });
    if let Err(err) = stored {
        log::error!("Failed to persist result of {}: {err:#}", unit.id);
    }

    if result.as_ref().is_ok_and(Execution::is_success) {
        ui::success(&unit.id);
    } else {
        ui::error(&unit.id);
    }
}
