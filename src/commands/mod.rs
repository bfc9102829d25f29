pub mod actions;
pub mod schedule;
pub mod services;
pub mod settings;
pub mod tools;

use crate::backend::CommandBackend;
use crate::cli::{CommitArgs, TargetArgs};
use crate::schema::BsaConfig;
use crate::session::Session;
use crate::ui;
use anyhow::{Context, Result};
use bulkops::{BatchReport, CommitFlags, ConfirmCallback, TargetSpec};
use colored::Colorize;
use std::io;
use std::path::Path;

// ============================================================================
// Shared Helpers
// ============================================================================

/// Turn target arguments into a [`TargetSpec`], expanding aliases
pub fn target_spec(config: &BsaConfig, args: &TargetArgs) -> Result<TargetSpec> {
    let mut keypaths = Vec::new();
    for input in &args.keypaths {
        keypaths.push(config.expand_keypath(input)?);
    }
    if let Some(file) = &args.input_file {
        for line in read_keypath_file(file)? {
            keypaths.push(config.expand_keypath(&line)?);
        }
    }
    Ok(TargetSpec::from_parts(keypaths, args.all, args.subset_flags()))
}

/// Keypaths from a file, one per line, skipping blanks and `#` comments
fn read_keypath_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read keypath file: {}", path.display()))?;
    Ok(parse_keypath_lines(&content))
}

fn parse_keypath_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

impl From<CommitArgs> for CommitFlags {
    fn from(args: CommitArgs) -> Self {
        Self {
            dry_run: !args.commit,
            no_networking: args.no_networking,
        }
    }
}

/// Open the session, persisting any load-time invalidation right away
pub fn open_session() -> Result<Session> {
    let session = Session::open()?;
    if session.invalidated > 0 {
        ui::warn(&format!(
            "Tracked service types changed: cleared {} services. Run `bsa services populate`.",
            session.invalidated
        ));
        session.save()?;
    }
    Ok(session)
}

pub fn backend(config: &BsaConfig) -> Result<CommandBackend> {
    CommandBackend::from_config(&config.backend)
}

/// Print the deduplicated messages and the outcome counts
pub fn print_report(report: &BatchReport) {
    for message in report.messages.iter() {
        println!("  {message}");
    }

    println!();
    let mut parts = Vec::new();
    if report.previewed > 0 {
        parts.push(format!("{} previewed", report.previewed).cyan());
    }
    if report.applied > 0 {
        parts.push(format!("{} applied", report.applied).green());
    }
    if report.refused > 0 {
        parts.push(format!("{} refused", report.refused).yellow());
    }
    if report.failed > 0 {
        parts.push(format!("{} failed", report.failed).red());
    }
    if report.missing > 0 {
        parts.push(format!("{} missing", report.missing).yellow());
    }
    if report.skipped > 0 {
        parts.push(format!("{} skipped", report.skipped).dimmed());
    }

    if parts.is_empty() {
        ui::dim("Nothing was executed");
    } else {
        let summary: Vec<String> = parts.iter().map(ToString::to_string).collect();
        println!("{} {}", "Summary:".bold(), summary.join(", "));
    }
}

/// Ask on the terminal, or accept outright when `--yes` was given
pub struct PromptConfirm {
    pub assume_yes: bool,
}

impl ConfirmCallback for PromptConfirm {
    fn confirm(&mut self, prompt: &str) -> io::Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkops::SubsetFlag;
    use std::collections::BTreeSet;

    fn config() -> BsaConfig {
        let mut config = BsaConfig::default();
        config.aliases.insert("vpn".into(), "/services/vpn".into());
        config
    }

    #[test]
    fn test_parse_keypath_lines() {
        let lines = parse_keypath_lines("/a\n\n  # comment\n  /b  \nvpn::c\n");
        assert_eq!(lines, vec!["/a", "/b", "vpn::c"]);
    }

    #[test]
    fn test_target_spec_expands_aliases_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("targets.txt");
        std::fs::write(&file, "vpn::2\n# skip\n").unwrap();

        let args = TargetArgs {
            keypaths: vec!["vpn::1".into()],
            input_file: Some(file),
            ..Default::default()
        };
        let spec = target_spec(&config(), &args).unwrap();
        let expected: BTreeSet<String> =
            ["/services/vpn{1}", "/services/vpn{2}"].map(String::from).into();
        assert_eq!(spec, TargetSpec::Explicit(expected));
    }

    #[test]
    fn test_target_spec_all_except() {
        let args = TargetArgs {
            keypaths: vec!["/x".into()],
            all: true,
            ..Default::default()
        };
        let spec = target_spec(&config(), &args).unwrap();
        assert_eq!(spec, TargetSpec::AllExcept(["/x".to_string()].into()));
    }

    #[test]
    fn test_target_spec_subset() {
        let args = TargetArgs {
            ready: true,
            ..Default::default()
        };
        let spec = target_spec(&config(), &args).unwrap();
        assert_eq!(
            spec,
            TargetSpec::SubsetFlags([SubsetFlag::IsRedeployReady].into())
        );
    }

    #[test]
    fn test_missing_keypath_file_is_an_error() {
        let args = TargetArgs {
            input_file: Some("/nonexistent/bsa-targets.txt".into()),
            ..Default::default()
        };
        assert!(target_spec(&config(), &args).is_err());
    }

    #[test]
    fn test_commit_args_to_flags() {
        let flags: CommitFlags = CommitArgs::default().into();
        assert_eq!(flags, CommitFlags::default());
        let flags: CommitFlags = CommitArgs {
            commit: true,
            no_networking: true,
        }
        .into();
        assert!(!flags.dry_run);
        assert!(flags.no_networking);
    }

    #[test]
    fn test_assume_yes_skips_prompt() {
        let mut confirm = PromptConfirm { assume_yes: true };
        assert!(confirm.confirm("really?").unwrap());
    }
}
