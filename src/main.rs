mod cli;
mod commands;
mod config;
mod lockfile;
mod paths;
mod session;
mod state;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command, LocksCommand};
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

    match cli.command {
        Command::Run(args) => commands::pipeline::run(&ctx, args),
        Command::Undo(args) => commands::pipeline::undo(&ctx, args),
        Command::Steps { profile, json } => commands::steps::run(&ctx, profile.as_deref(), json),
        Command::Status { cluster_id, json } => {
            commands::status::run(&ctx, cluster_id.as_deref(), json)
        }
        Command::Reset { cluster_id, yes } => commands::reset::run(&ctx, &cluster_id, yes),
        Command::Locks(cmd) => match cmd {
            LocksCommand::List { json } => commands::locks::list(&ctx, json),
            LocksCommand::Reclaim => commands::locks::reclaim(&ctx),
        },
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "clusterforge", &mut io::stdout());
            Ok(())
        }
    }
}
