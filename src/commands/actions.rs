//! `redeploy` and `reconcile`

use anyhow::Result;
use bulkops::executor::MSG_NOT_POPULATED;
use bulkops::{CommitFlags, Mode};

use super::{backend, open_session, print_report, target_spec};
use crate::Context as AppContext;
use crate::cli::ActionArgs;
use crate::progress::BatchProgress;
use crate::ui;

pub fn run(ctx: &AppContext, mode: Mode, args: ActionArgs) -> Result<()> {
    let session = open_session()?;
    let flags: CommitFlags = args.flags.into();
    let jobs = args.jobs.unwrap_or(session.config.scheduler.jobs).max(1);

    let spec = target_spec(&session.config, &args.target)?;
    let keypaths = spec.resolve(&session.registry);
    log::info!("{mode}: {} of {} services selected", keypaths.len(), session.registry.len());

    if !ctx.quiet {
        ui::header(&format!(
            "{} ({})",
            match mode {
                Mode::RedeployTopLevel => "Redeploy",
                Mode::ReconcileSublayers => "Reconcile",
            },
            if flags.dry_run { "dry-run" } else { "commit" }
        ));
    }

    if session.registry.is_empty() {
        ui::warn(MSG_NOT_POPULATED);
        return Ok(());
    }

    let backend = backend(&session.config)?;
    let mut progress = BatchProgress::new(ctx.quiet);
    let report = session
        .executor(&backend)
        .run_batch(&keypaths, mode, flags, jobs, &mut progress)?;

    session.save()?;
    print_report(&report);

    if !flags.dry_run && report.has_failures() {
        ui::warn("Some services were not applied; see `bsa services list --errors`");
    }
    Ok(())
}
