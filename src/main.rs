mod backend;
mod cli;
mod commands;
mod paths;
mod progress;
mod schema;
mod session;
mod state;
mod ui;

use anyhow::Result;
use bulkops::Mode;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };
    log::trace!("verbosity {}", ctx.verbose);

    match cli.command {
        Command::Services(cmd) => commands::services::run(&ctx, cmd),
        Command::Redeploy(args) => commands::actions::run(&ctx, Mode::RedeployTopLevel, args),
        Command::Reconcile(args) => commands::actions::run(&ctx, Mode::ReconcileSublayers, args),
        Command::Tools(cmd) => commands::tools::run(&ctx, cmd),
        Command::Schedule(cmd) => commands::schedule::run(&ctx, cmd),
        Command::Settings(cmd) => commands::settings::run(&ctx, cmd),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "bsa", &mut io::stdout());
            Ok(())
        }
    }
}
