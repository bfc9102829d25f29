use bulkops::{Mode, SubsetFlag};
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bsa")]
#[command(version)]
#[command(about = "Bulk redeploy and reconcile of managed network services", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build, inspect and clear the service list
    #[command(subcommand)]
    Services(ServicesCommand),

    /// Dry-run or commit a re-deploy of top-level services
    Redeploy(ActionArgs),

    /// Dry-run or commit a reconcile of tracked sublayers
    Reconcile(ActionArgs),

    /// Readiness, approvals and wildcard maintenance
    #[command(subcommand)]
    Tools(ToolsCommand),

    /// Time-staggered runs
    #[command(subcommand)]
    Schedule(ScheduleCommand),

    /// View and edit config.toml
    #[command(subcommand)]
    Settings(SettingsCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Targets
// ============================================================================

/// Which services a command acts on
///
/// Keypaths alone select exactly those services; with `--all` they are
/// excluded instead. Subset flags apply only when no keypath is given, and
/// select services matching any of them.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Service keypath or `<alias>::<id>` (repeatable)
    #[arg(short, long = "keypath", value_name = "KEYPATH")]
    pub keypaths: Vec<String>,

    /// Read keypaths from a file, one per line (`#` starts a comment)
    #[arg(short = 'f', long, value_name = "FILE")]
    pub input_file: Option<PathBuf>,

    /// Every service (minus any keypaths given)
    #[arg(short, long)]
    pub all: bool,

    /// Services whose last apply failed
    #[arg(long)]
    pub with_error: bool,

    /// Services with no device diff in their dry-run
    #[arg(long)]
    pub without_diff: bool,

    /// Services never dry-run
    #[arg(long)]
    pub never_previewed: bool,

    /// Services never successfully applied
    #[arg(long)]
    pub never_redeployed: bool,

    /// Services applied at least once
    #[arg(long)]
    pub redeployed: bool,

    /// Services flagged redeploy-ready
    #[arg(long)]
    pub ready: bool,
}

impl TargetArgs {
    pub fn subset_flags(&self) -> Vec<SubsetFlag> {
        [
            (self.with_error, SubsetFlag::HasLastError),
            (self.without_diff, SubsetFlag::HasNoPreviewDiff),
            (self.never_previewed, SubsetFlag::HasNoPreviewFetch),
            (self.never_redeployed, SubsetFlag::HasNoSuccess),
            (self.redeployed, SubsetFlag::HasSuccess),
            (self.ready, SubsetFlag::IsRedeployReady),
        ]
        .into_iter()
        .filter_map(|(set, flag)| set.then_some(flag))
        .collect()
    }

    /// True when nothing narrows the selection
    pub fn is_unrestricted(&self) -> bool {
        self.keypaths.is_empty() && self.input_file.is_none() && self.subset_flags().is_empty()
    }
}

/// Commit flags shared by actions and schedules
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct CommitArgs {
    /// Apply for real (default is a dry-run)
    #[arg(long)]
    pub commit: bool,

    /// Update the engine without touching devices
    #[arg(long)]
    pub no_networking: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ActionArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub flags: CommitArgs,

    /// Parallel executions (defaults to scheduler.jobs)
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

// ============================================================================
// Services Commands
// ============================================================================

#[derive(Subcommand)]
pub enum ServicesCommand {
    /// Rebuild the service list from the tracked types
    Populate,

    /// List services with their state
    List {
        #[command(flatten)]
        target: TargetArgs,

        /// Only show services with an error, and the error text
        #[arg(short, long)]
        errors: bool,
    },

    /// Show one service in detail
    Show {
        /// Service keypath or `<alias>::<id>`
        keypath: String,

        /// Include the unaltered device output
        #[arg(long)]
        raw: bool,

        /// Diff unaltered against normalized output
        #[arg(long)]
        compare: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove services from the list
    Clear {
        #[command(flatten)]
        target: TargetArgs,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

// ============================================================================
// Tools Commands
// ============================================================================

#[derive(Subcommand)]
pub enum ToolsCommand {
    /// Set or clear the redeploy-ready flag by hand
    #[command(subcommand)]
    Ready(ReadyCommand),

    /// Approve the current dry-run diffs of services
    Approve {
        /// Service keypaths or `<alias>::<id>`
        #[arg(required = true)]
        keypaths: Vec<String>,
    },

    /// Re-evaluate readiness of every service against approved diffs
    CheckApprovals,

    /// Re-normalize stored output
    #[command(subcommand)]
    Wildcards(WildcardsToolCommand),

    /// Inspect or edit approved diffs
    #[command(subcommand)]
    Approvals(ApprovalsCommand),
}

#[derive(Subcommand)]
pub enum ReadyCommand {
    /// Flag services as redeploy-ready
    Add(TargetArgs),
    /// Clear the redeploy-ready flag
    Remove(TargetArgs),
}

#[derive(Subcommand)]
pub enum WildcardsToolCommand {
    /// Re-apply the current wildcard list to all stored output
    Update,
    /// Restore normalized output to the unaltered device output
    Rollback,
}

#[derive(Subcommand)]
pub enum ApprovalsCommand {
    /// List approved diffs with their index
    List,
    /// Remove an approved diff by index or exact text
    Remove {
        /// 1-based index from `approvals list`, or the diff text
        entry: String,
    },
}

// ============================================================================
// Schedule Commands
// ============================================================================

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ActionKind {
    Redeploy,
    Reconcile,
}

impl From<ActionKind> for Mode {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Redeploy => Self::RedeployTopLevel,
            ActionKind::Reconcile => Self::ReconcileSublayers,
        }
    }
}

#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Schedule one unit per target service, staggered by the interval
    Create(ScheduleCreateArgs),

    /// List scheduled units
    List {
        /// Only units of this schedule
        name: Option<String>,
    },

    /// Delete every unit of a schedule
    Delete {
        name: String,
    },

    /// Remove finished units
    Prune,

    /// Execute due units
    Run {
        /// Run what is due now and exit
        #[arg(long)]
        once: bool,

        /// Parallel executions (defaults to scheduler.jobs)
        #[arg(short, long)]
        jobs: Option<usize>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ScheduleCreateArgs {
    /// Schedule name, part of every unit id
    pub name: String,

    /// Operation to run
    #[arg(long, value_enum)]
    pub action: ActionKind,

    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub flags: CommitArgs,

    /// Absolute start (RFC 3339 or local `YYYY-MM-DDTHH:MM[:SS]`)
    #[arg(long, conflicts_with = "delay", required_unless_present = "delay")]
    pub at: Option<String>,

    /// Relative start such as `1h30m`
    #[arg(long = "in", value_name = "DELAY")]
    pub delay: Option<String>,

    /// Seconds between units (defaults to scheduler.interval_secs)
    #[arg(long)]
    pub interval: Option<u64>,
}

// ============================================================================
// Settings Commands
// ============================================================================

#[derive(Subcommand)]
pub enum SettingsCommand {
    /// Show the configuration and file locations
    Show,

    /// Edit the wildcard pattern list
    #[command(subcommand)]
    Wildcards(WildcardsSettingsCommand),

    /// Edit tracked top-level service types (clears the service list)
    #[command(subcommand)]
    TopLevelTypes(TrackedListCommand),

    /// Edit tracked sublayer names (clears the service list)
    #[command(subcommand)]
    Sublayers(TrackedListCommand),

    /// Edit keypath aliases
    #[command(subcommand)]
    Alias(AliasCommand),
}

#[derive(Subcommand)]
pub enum WildcardsSettingsCommand {
    /// List patterns with their placeholder index
    List,
    /// Append a pattern
    Add { pattern: String },
    /// Remove a pattern by index or exact text
    Remove { entry: String },
}

#[derive(Subcommand)]
pub enum TrackedListCommand {
    Add {
        value: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    Remove {
        value: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum AliasCommand {
    /// Map `<name>::<id>` to `<prefix>{<id>}`
    Set { name: String, prefix: String },
    Remove { name: String },
}
