//! Settings command - view and edit config.toml

use anyhow::{Result, bail};
use bulkops::TrackedTypes;
use bulkops::normalize::placeholder;
use bulkops::populate::retrack;
use colored::Colorize;

use super::{PromptConfirm, open_session};
use crate::Context as AppContext;
use crate::cli::{AliasCommand, SettingsCommand, TrackedListCommand, WildcardsSettingsCommand};
use crate::ui;

pub fn run(_ctx: &AppContext, cmd: SettingsCommand) -> Result<()> {
    match cmd {
        SettingsCommand::Show => show(),
        SettingsCommand::Wildcards(cmd) => wildcards(cmd),
        SettingsCommand::TopLevelTypes(cmd) => tracked(cmd, TrackedKind::TopLevelTypes),
        SettingsCommand::Sublayers(cmd) => tracked(cmd, TrackedKind::Sublayers),
        SettingsCommand::Alias(cmd) => alias(cmd),
    }
}

fn show() -> Result<()> {
    let session = open_session()?;
    let config = &session.config;

    ui::header("bsa settings");
    ui::kv("Config file", &session.config_path().display().to_string());
    ui::kv("State file", &session.state_path().display().to_string());

    ui::section("Service list");
    print_list("Top-level types", &config.service_list.top_level_types);
    print_list("Sublayers", &config.service_list.target_sublayers);
    ui::kv("Services", &session.registry.len().to_string());

    ui::section("Diff checking");
    if config.diff_checking.wildcards.is_empty() {
        ui::dim("No wildcards configured");
    }
    for (index, pattern) in config.diff_checking.wildcards.iter().enumerate() {
        println!("  {:<14} {pattern}", placeholder(index + 1).cyan());
    }
    ui::kv("Approved diffs", &session.approvals.len().to_string());

    ui::section("Backend");
    if config.backend.command.is_empty() {
        ui::dim("No bridge command configured");
    } else {
        ui::kv("Command", &config.backend.command);
        if !config.backend.args.is_empty() {
            ui::kv("Arguments", &config.backend.args.join(" "));
        }
    }

    ui::section("Scheduler");
    ui::kv("Interval", &format!("{}s", config.scheduler.interval_secs));
    ui::kv("Jobs", &config.scheduler.jobs.to_string());
    ui::kv("Scheduled units", &session.scheduler.len().to_string());

    if !config.aliases.is_empty() {
        ui::section("Aliases");
        for (name, prefix) in &config.aliases {
            println!("  {}::<id> → {prefix}{{<id>}}", name.bold());
        }
    }
    Ok(())
}

fn print_list(label: &str, values: &[String]) {
    if values.is_empty() {
        ui::kv(label, &"none".dimmed().to_string());
    } else {
        ui::kv(label, &values.join(", "));
    }
}

// ============================================================================
// Wildcards
// ============================================================================

fn wildcards(cmd: WildcardsSettingsCommand) -> Result<()> {
    let mut session = open_session()?;
    match cmd {
        WildcardsSettingsCommand::List => {
            ui::header("Wildcards");
            if session.config.diff_checking.wildcards.is_empty() {
                println!("{}", "No wildcards configured.".dimmed());
                println!();
                println!("Add one with: bsa settings wildcards add '<regex>'");
            }
            for (index, pattern) in session.config.diff_checking.wildcards.iter().enumerate() {
                let number = format!("[{}]", index + 1);
                println!("  {} {:<14} {pattern}", number.blue(), placeholder(index + 1));
            }
            return Ok(());
        }
        WildcardsSettingsCommand::Add { pattern } => {
            if !add_unique(&mut session.config.diff_checking.wildcards, &pattern) {
                ui::info("Pattern already configured");
                return Ok(());
            }
            session.save_config()?;
            ui::success(&format!(
                "Added wildcard {}",
                placeholder(session.config.diff_checking.wildcards.len())
            ));
        }
        WildcardsSettingsCommand::Remove { entry } => {
            let Some(removed) = remove_entry(&mut session.config.diff_checking.wildcards, &entry)
            else {
                bail!("No wildcard matches '{entry}'");
            };
            session.save_config()?;
            ui::success(&format!("Removed wildcard {removed}"));
            if !session.config.diff_checking.wildcards.is_empty() {
                ui::warn("Placeholder numbers after the removed pattern have shifted");
            }
        }
    }
    ui::dim("Run `bsa tools wildcards update` to re-normalize stored dry-runs");
    Ok(())
}

// ============================================================================
// Tracked Types
// ============================================================================

#[derive(Clone, Copy)]
enum TrackedKind {
    TopLevelTypes,
    Sublayers,
}

impl TrackedKind {
    fn list_mut(self, tracked: &mut TrackedTypes) -> &mut Vec<String> {
        match self {
            Self::TopLevelTypes => &mut tracked.top_level_types,
            Self::Sublayers => &mut tracked.target_sublayers,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::TopLevelTypes => "top-level type",
            Self::Sublayers => "sublayer",
        }
    }
}

fn tracked(cmd: TrackedListCommand, kind: TrackedKind) -> Result<()> {
    let mut session = open_session()?;
    let mut proposed = session.config.service_list.clone();

    let (changed, yes, verb) = match &cmd {
        TrackedListCommand::Add { value, yes } => {
            (add_unique(kind.list_mut(&mut proposed), value), *yes, "Added")
        }
        TrackedListCommand::Remove { value, yes } => (
            remove_entry(kind.list_mut(&mut proposed), value).is_some(),
            *yes,
            "Removed",
        ),
    };
    if !changed {
        ui::info(&format!("No {} change", kind.label()));
        return Ok(());
    }

    if !session.registry.is_empty() {
        ui::warn("Changing tracked types wipes the service list");
    }
    let mut confirm = PromptConfirm { assume_yes: yes };
    if !retrack(
        &session.registry,
        &session.config.service_list,
        &proposed,
        &mut confirm,
    )? {
        ui::info("Cancelled");
        return Ok(());
    }

    session.config.service_list = proposed;
    session.save_config()?;
    session.save()?;
    ui::success(&format!("{verb} {}", kind.label()));
    ui::dim("Run `bsa services populate` to rebuild the service list");
    Ok(())
}

// ============================================================================
// Aliases
// ============================================================================

fn alias(cmd: AliasCommand) -> Result<()> {
    let mut session = open_session()?;
    match cmd {
        AliasCommand::Set { name, prefix } => {
            session.config.aliases.insert(name.clone(), prefix.clone());
            session.save_config()?;
            ui::success(&format!("{name}::<id> → {prefix}{{<id>}}"));
        }
        AliasCommand::Remove { name } => {
            if session.config.aliases.remove(&name).is_none() {
                bail!("No alias named '{name}'");
            }
            session.save_config()?;
            ui::success(&format!("Removed alias {name}"));
        }
    }
    Ok(())
}

// ============================================================================
// List Editing
// ============================================================================

/// Append unless present; returns whether the list changed
fn add_unique(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|v| v == value) {
        return false;
    }
    list.push(value.to_string());
    true
}

/// Remove by exact text, or by 1-based index when no entry has that text
fn remove_entry(list: &mut Vec<String>, entry: &str) -> Option<String> {
    if let Some(position) = list.iter().position(|v| v == entry) {
        return Some(list.remove(position));
    }
    let index = entry.trim().parse::<usize>().ok()?;
    (1..=list.len()).contains(&index).then(|| list.remove(index - 1))
}
