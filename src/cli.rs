use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "clusterforge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Resumable provisioning and teardown of database clusters", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
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
    /// Run provisioning steps forward
    Run(RunArgs),

    /// Undo provisioning steps, in the order given
    Undo(UndoArgs),

    /// Show the step table of a profile
    Steps {
        /// Profile to show (default: all)
        #[arg(short, long)]
        profile: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show progress and completion records of a cluster
    Status {
        /// Cluster id (default: every known cluster)
        cluster_id: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget completion records so the next run starts over
    Reset {
        /// Cluster id
        cluster_id: String,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect and clean up resource leases
    #[command(subcommand)]
    Locks(LocksCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Pipeline Arguments
// ============================================================================

#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Cluster description file (TOML)
    pub cluster: String,

    /// Steps to run, comma-separated (default: the profile's full table)
    #[arg(short, long, value_delimiter = ',')]
    pub steps: Vec<String>,

    /// Profile (default: detected from the cluster options)
    #[arg(short, long)]
    pub profile: Option<String>,

    /// Override a cluster option (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Request id used as lock holder prefix (default: generated)
    #[arg(long)]
    pub request_id: Option<String>,

    /// Remote user for ssh
    #[arg(long, env = "CLUSTERFORGE_SSH_USER")]
    pub ssh_user: Option<String>,

    /// Print commands instead of running them; nothing is persisted
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Output the pipeline result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Forget completion records first instead of resuming
    #[arg(long)]
    pub fresh: bool,
}

#[derive(Args, Debug, Clone)]
pub struct UndoArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Run undo actions even where no forward record exists
    #[arg(long)]
    pub force: bool,

    /// Skip confirmation
    #[arg(short, long)]
    pub yes: bool,
}

// ============================================================================
// Locks Commands
// ============================================================================

#[derive(Subcommand)]
pub enum LocksCommand {
    /// List current leases
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove leases whose holder stopped renewing them
    Reclaim,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_steps_split_on_comma() {
        let cli = Cli::parse_from([
            "clusterforge",
            "run",
            "clu1.toml",
            "--steps",
            "create-vm,create-user",
            "--set",
            "db_version=19",
            "--fresh",
        ]);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.pipeline.steps, vec!["create-vm", "create-user"]);
                assert_eq!(args.pipeline.overrides, vec!["db_version=19"]);
                assert!(args.fresh);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_undo_flags() {
        let cli = Cli::parse_from(["clusterforge", "-vv", "undo", "clu1.toml", "--force", "-y"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Undo(args) => {
                assert!(args.force && args.yes);
                assert!(args.pipeline.steps.is_empty());
            }
            _ => panic!("expected undo"),
        }
    }
}
