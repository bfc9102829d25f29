//! Tools command - readiness, approvals and wildcard maintenance

use anyhow::{Result, bail};
use bulkops::normalize;
use bulkops::{ApprovedDiffs, Registry};
use colored::Colorize;

use super::{open_session, target_spec};
use crate::Context as AppContext;
use crate::cli::{ApprovalsCommand, ReadyCommand, TargetArgs, ToolsCommand, WildcardsToolCommand};
use crate::ui;

pub fn run(_ctx: &AppContext, cmd: ToolsCommand) -> Result<()> {
    match cmd {
        ToolsCommand::Ready(ReadyCommand::Add(target)) => set_ready(&target, true),
        ToolsCommand::Ready(ReadyCommand::Remove(target)) => set_ready(&target, false),
        ToolsCommand::Approve { keypaths } => approve(&keypaths),
        ToolsCommand::CheckApprovals => check_approvals(),
        ToolsCommand::Wildcards(WildcardsToolCommand::Update) => wildcards_update(),
        ToolsCommand::Wildcards(WildcardsToolCommand::Rollback) => wildcards_rollback(),
        ToolsCommand::Approvals(ApprovalsCommand::List) => approvals_list(),
        ToolsCommand::Approvals(ApprovalsCommand::Remove { entry }) => approvals_remove(&entry),
    }
}

fn set_ready(target: &TargetArgs, ready: bool) -> Result<()> {
    let session = open_session()?;
    let spec = target_spec(&session.config, target)?;
    let changed = set_ready_flags(&session.registry, &spec.resolve(&session.registry), ready);
    session.save()?;

    ui::success(&format!(
        "{} redeploy-ready on {changed} service(s)",
        if ready { "Set" } else { "Cleared" }
    ));
    Ok(())
}

/// Set or clear the flag; returns how many entries actually changed
fn set_ready_flags<'a>(
    registry: &Registry,
    keypaths: impl IntoIterator<Item = &'a String>,
    ready: bool,
) -> usize {
    keypaths
        .into_iter()
        .filter_map(|keypath| {
            registry.update(keypath, |entry| {
                let changed = entry.redeploy_ready != ready;
                entry.redeploy_ready = ready;
                changed
            })
        })
        .filter(|changed| *changed)
        .count()
}

fn approve(inputs: &[String]) -> Result<()> {
    let mut session = open_session()?;

    let mut added = 0;
    for input in inputs {
        let keypath = session.config.expand_keypath(input)?;
        if !session.registry.contains(&keypath) {
            ui::warn(&format!("Not in the service list: {keypath}"));
            continue;
        }
        added += session.approvals.approve(&session.registry, &keypath);
    }
    let ready = session.approvals.check_all(&session.registry);
    session.save()?;

    ui::success(&format!(
        "Approved {added} new diff(s); {ready} service(s) now redeploy-ready"
    ));
    Ok(())
}

fn check_approvals() -> Result<()> {
    let session = open_session()?;
    let ready = session.approvals.check_all(&session.registry);
    session.save()?;
    ui::success(&format!("{ready} service(s) newly redeploy-ready"));
    Ok(())
}

fn wildcards_update() -> Result<()> {
    let mut session = open_session()?;
    let previews = normalize::update(&session.registry, &session.patterns);
    let added = session.approvals.renormalize(&session.patterns);
    let ready = session.approvals.check_all(&session.registry);
    session.save()?;

    ui::success(&format!(
        "Re-normalized {previews} dry-run output(s) with {} wildcard(s)",
        session.patterns.len()
    ));
    if added > 0 {
        ui::info(&format!("Added {added} re-normalized approved diff(s)"));
    }
    if ready > 0 {
        ui::info(&format!("{ready} service(s) newly redeploy-ready"));
    }
    Ok(())
}

fn wildcards_rollback() -> Result<()> {
    let session = open_session()?;
    let restored = normalize::rollback(&session.registry);
    session.save()?;
    ui::success(&format!("Restored {restored} dry-run output(s) to unaltered form"));
    Ok(())
}

fn approvals_list() -> Result<()> {
    let session = open_session()?;
    ui::header(&format!("Approved diffs ({})", session.approvals.len()));
    if session.approvals.is_empty() {
        println!("{}", "No approved diffs.".dimmed());
        println!();
        println!("Approve a service's dry-run with: bsa tools approve <keypath>");
        return Ok(());
    }
    for (index, diff) in session.approvals.iter().enumerate() {
        println!();
        println!("{}", format!("[{}]", index + 1).blue().bold());
        for line in diff.lines() {
            println!("  {line}");
        }
    }
    Ok(())
}

fn approvals_remove(entry: &str) -> Result<()> {
    let mut session = open_session()?;
    let Some(removed) = remove_approval(&mut session.approvals, entry) else {
        bail!("No approved diff matches '{entry}'");
    };
    session.save()?;
    ui::success("Removed approved diff:");
    for line in removed.lines() {
        ui::dim(line);
    }
    Ok(())
}

/// Remove by 1-based index, falling back to exact text
fn remove_approval(approvals: &mut ApprovedDiffs, entry: &str) -> Option<String> {
    if let Ok(position) = entry.trim().parse::<usize>() {
        if let Some(removed) = approvals.remove_at(position) {
            return Some(removed);
        }
    }
    approvals.remove(entry).then(|| entry.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkops::ServiceEntry;

    #[test]
    fn test_set_ready_flags_counts_changes() {
        let mut ready = ServiceEntry::new("/b");
        ready.redeploy_ready = true;
        let registry = Registry::from_entries([ServiceEntry::new("/a"), ready]);
        let keys = registry.keys();

        assert_eq!(set_ready_flags(&registry, &keys, true), 1);
        assert_eq!(set_ready_flags(&registry, &keys, true), 0);
        assert_eq!(set_ready_flags(&registry, &keys, false), 2);
        assert!(!registry.get("/b").unwrap().redeploy_ready);
    }

    #[test]
    fn test_set_ready_ignores_unknown() {
        let registry = Registry::from_entries([ServiceEntry::new("/a")]);
        let keys = vec!["/nope".to_string()];
        assert_eq!(set_ready_flags(&registry, &keys, true), 0);
    }

    #[test]
    fn test_remove_approval_by_index_and_text() {
        let mut approvals: ApprovedDiffs = ["+ a", "+ b", "+ c"].into_iter().collect();

        assert_eq!(remove_approval(&mut approvals, "2").as_deref(), Some("+ b"));
        assert_eq!(remove_approval(&mut approvals, "+ c").as_deref(), Some("+ c"));
        assert_eq!(remove_approval(&mut approvals, "9"), None);
        assert_eq!(approvals.len(), 1);
    }
}
