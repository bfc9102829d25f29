//! Services command - populate, list, show and clear the service list

use anyhow::{Result, bail};
use bulkops::populate::populate;
use bulkops::{ConfirmCallback, DeviceOutput, Preview, ServiceEntry, SublayerEntry};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

use super::{PromptConfirm, backend, open_session, target_spec};
use crate::Context as AppContext;
use crate::cli::{ServicesCommand, TargetArgs};
use crate::ui;

pub fn run(ctx: &AppContext, cmd: ServicesCommand) -> Result<()> {
    match cmd {
        ServicesCommand::Populate => populate_list(ctx),
        ServicesCommand::List { target, errors } => list(&target, errors),
        ServicesCommand::Show {
            keypath,
            raw,
            compare,
            json,
        } => show(&keypath, raw, compare, json),
        ServicesCommand::Clear { target, yes } => clear(&target, yes),
    }
}

fn populate_list(ctx: &AppContext) -> Result<()> {
    let session = open_session()?;
    let backend = backend(&session.config)?;

    if !ctx.quiet {
        ui::info(&format!(
            "Listing {} tracked service type(s)...",
            session.config.service_list.top_level_types.len()
        ));
    }

    let output = populate(&session.registry, &backend, &session.config.service_list)?;
    session.save()?;

    for message in output.iter() {
        println!("  {message}");
    }
    ui::success("Service list populated");
    Ok(())
}

// ============================================================================
// List
// ============================================================================

fn list(target: &TargetArgs, errors: bool) -> Result<()> {
    let session = open_session()?;
    let spec = target_spec(&session.config, target)?;
    let keypaths = spec.resolve(&session.registry);
    let entries: Vec<ServiceEntry> = keypaths
        .iter()
        .filter_map(|keypath| session.registry.get(keypath))
        .collect();

    if session.registry.is_empty() {
        println!("{}", "The service list is empty.".dimmed());
        println!();
        println!("Build it with: bsa services populate");
        return Ok(());
    }

    if errors {
        return list_errors(&entries);
    }

    ui::header(&format!("Services ({} of {})", entries.len(), session.registry.len()));
    println!(
        "  {:<48} {:<5} {:<19} {:<19} {}",
        "KEYPATH".dimmed(),
        "READY".dimmed(),
        "DRY-RUN FETCHED".dimmed(),
        "REDEPLOYED".dimmed(),
        "ERROR".dimmed()
    );
    for entry in &entries {
        let diff = match &entry.preview {
            Some(preview) if preview.has_diff() => "*".yellow(),
            _ => " ".normal(),
        };
        println!(
            "  {:<48} {:<5} {:<19}{} {:<19} {}",
            ui::truncate_keypath(&entry.keypath, 48),
            ui::flag(entry.redeploy_ready),
            ui::timestamp(entry.preview.as_ref().map(|p| p.fetched_at)),
            diff,
            ui::timestamp(entry.redeployed_at),
            if entry.last_error.is_some() {
                "yes".red()
            } else {
                "".normal()
            }
        );
        for sub in &entry.modified_services {
            println!(
                "    {} {:<44} {:<19} {}",
                "└".dimmed(),
                ui::truncate_keypath(&sub.keypath, 44).dimmed(),
                ui::timestamp(sub.redeployed_at),
                if sub.last_error.is_some() {
                    "error".red()
                } else {
                    "".normal()
                }
            );
        }
    }
    println!();
    ui::dim("* dry-run reported device changes");
    Ok(())
}

fn list_errors(entries: &[ServiceEntry]) -> Result<()> {
    let mut shown = 0;
    for entry in entries {
        let sub_errors: Vec<&SublayerEntry> = entry
            .modified_services
            .iter()
            .filter(|s| s.last_error.is_some())
            .collect();
        if entry.last_error.is_none() && sub_errors.is_empty() {
            continue;
        }
        shown += 1;
        println!("{}", entry.keypath.bold());
        if let Some(error) = &entry.last_error {
            println!("  {}", error.red());
        }
        for sub in sub_errors {
            let error = sub.last_error.as_deref().unwrap_or_default();
            println!("  {} {}", sub.keypath.dimmed(), error.red());
        }
    }
    if shown == 0 {
        ui::success("No errors recorded");
    }
    Ok(())
}

// ============================================================================
// Show
// ============================================================================

/// Serialized form of an entry; unaltered output is opt-in
#[derive(Debug, Serialize)]
struct ServiceView<'a> {
    keypath: &'a str,
    redeploy_ready: bool,
    redeployed_at: Option<DateTime<Utc>>,
    last_error: Option<&'a str>,
    preview: Option<PreviewView<'a>>,
    sublayers: Vec<SublayerView<'a>>,
}

#[derive(Debug, Serialize)]
struct SublayerView<'a> {
    keypath: &'a str,
    redeployed_at: Option<DateTime<Utc>>,
    last_error: Option<&'a str>,
    preview: Option<PreviewView<'a>>,
}

#[derive(Debug, Serialize)]
struct PreviewView<'a> {
    fetched_at: DateTime<Utc>,
    normalized_output_by_device: &'a [DeviceOutput],
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_output_by_device: Option<&'a [DeviceOutput]>,
}

impl<'a> PreviewView<'a> {
    fn new(preview: &'a Preview, raw: bool) -> Self {
        Self {
            fetched_at: preview.fetched_at,
            normalized_output_by_device: &preview.normalized_output_by_device,
            raw_output_by_device: raw.then_some(preview.raw_output_by_device.as_slice()),
        }
    }
}

impl<'a> ServiceView<'a> {
    fn new(entry: &'a ServiceEntry, raw: bool) -> Self {
        Self {
            keypath: &entry.keypath,
            redeploy_ready: entry.redeploy_ready,
            redeployed_at: entry.redeployed_at,
            last_error: entry.last_error.as_deref(),
            preview: entry.preview.as_ref().map(|p| PreviewView::new(p, raw)),
            sublayers: entry
                .modified_services
                .iter()
                .map(|sub| SublayerView {
                    keypath: &sub.keypath,
                    redeployed_at: sub.redeployed_at,
                    last_error: sub.last_error.as_deref(),
                    preview: sub.preview.as_ref().map(|p| PreviewView::new(p, raw)),
                })
                .collect(),
        }
    }
}

fn show(input: &str, raw: bool, compare: bool, json: bool) -> Result<()> {
    let session = open_session()?;
    let keypath = session.config.expand_keypath(input)?;
    let Some(entry) = session.registry.get(&keypath) else {
        bail!("Service not in the service list: {keypath}");
    };

    if json {
        let view = ServiceView::new(&entry, raw);
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    ui::header(&entry.keypath);
    ui::kv("Redeploy ready", &ui::flag(entry.redeploy_ready).to_string());
    ui::kv("Redeployed at", &ui::timestamp(entry.redeployed_at));
    if let Some(error) = &entry.last_error {
        ui::kv("Last error", &error.red().to_string());
    }
    print_preview(entry.preview.as_ref(), raw, compare);

    for sub in &entry.modified_services {
        ui::section(&format!("Sublayer {}", sub.keypath));
        ui::kv("Redeployed at", &ui::timestamp(sub.redeployed_at));
        if let Some(error) = &sub.last_error {
            ui::kv("Last error", &error.red().to_string());
        }
        print_preview(sub.preview.as_ref(), raw, compare);
    }
    Ok(())
}

fn print_preview(preview: Option<&Preview>, raw: bool, compare: bool) {
    let Some(preview) = preview else {
        ui::dim("No dry-run fetched");
        return;
    };
    ui::kv("Dry-run fetched", &ui::timestamp(Some(preview.fetched_at)));
    if !preview.has_diff() {
        ui::dim("No device changes");
        return;
    }

    for (position, normalized) in preview.normalized_output_by_device.iter().enumerate() {
        let unaltered = preview.raw_output_by_device.get(position);
        println!();
        println!("  {}", normalized.device.cyan().bold());
        if compare {
            if let Some(unaltered) = unaltered {
                print_compare(&unaltered.output, &normalized.output);
            }
            continue;
        }
        print_block(&normalized.output);
        if raw {
            if let Some(unaltered) = unaltered {
                println!("  {}", "unaltered:".dimmed());
                print_block(&unaltered.output);
            }
        }
    }
}

fn print_block(text: &str) {
    for line in text.lines() {
        println!("    {line}");
    }
}

/// Line diff of what the wildcards replaced
fn print_compare(unaltered: &str, normalized: &str) {
    let diff = similar::TextDiff::from_lines(unaltered, normalized);
    let mut has_changes = false;

    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Delete => {
                has_changes = true;
                print!("    {}", format!("- {change}").red());
            }
            similar::ChangeTag::Insert => {
                has_changes = true;
                print!("    {}", format!("+ {change}").green());
            }
            similar::ChangeTag::Equal => print!("      {change}"),
        }
    }

    if !has_changes {
        println!("    {}", "(no wildcard substitutions)".dimmed());
    }
}

// ============================================================================
// Clear
// ============================================================================

fn clear(target: &TargetArgs, yes: bool) -> Result<()> {
    let session = open_session()?;
    let spec = target_spec(&session.config, target)?;
    let keypaths = spec.resolve(&session.registry);

    if keypaths.is_empty() {
        ui::info("Nothing to clear");
        return Ok(());
    }

    let mut confirm = PromptConfirm { assume_yes: yes };
    if target.is_unrestricted()
        && !confirm.confirm(&format!("Clear all {} services from the list?", keypaths.len()))?
    {
        ui::info("Cancelled");
        return Ok(());
    }

    let cleared = session.registry.remove(&keypaths);
    session.save()?;

    for keypath in &cleared {
        ui::dim(keypath);
    }
    ui::success(&format!("Cleared {} service(s)", cleared.len()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ServiceEntry {
        let mut entry = ServiceEntry::new("/services/vpn{a}").with_sublayer("/services/l2{a-1}");
        entry.preview = Some(Preview {
            fetched_at: Utc::now(),
            raw_output_by_device: vec![DeviceOutput::new("ce0", "ip 10.0.0.1\n")],
            normalized_output_by_device: vec![DeviceOutput::new("ce0", "ip *WILDCARD1*\n")],
        });
        entry
    }

    #[test]
    fn test_json_view_hides_unaltered_output() {
        let entry = entry();
        let json = serde_json::to_string(&ServiceView::new(&entry, false)).unwrap();
        assert!(json.contains("*WILDCARD1*"));
        assert!(!json.contains("10.0.0.1"));
        assert!(!json.contains("raw_output_by_device"));
    }

    #[test]
    fn test_json_view_with_raw() {
        let entry = entry();
        let json = serde_json::to_string(&ServiceView::new(&entry, true)).unwrap();
        assert!(json.contains("10.0.0.1"));
        assert!(json.contains("/services/l2{a-1}"));
    }
}
