use clap::{ArgGroup, Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "forge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Install and configure Satellite servers", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file (defaults to ./forge.toml, then the config dir)
    #[arg(short, long, global = true, env = "FORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Server section to use instead of the one marked default
    #[arg(short, long, global = true, env = "FORGE_SERVER")]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Install Satellite on this host
    Install(InstallArgs),

    /// Create or update server objects from the configuration
    #[command(subcommand)]
    Make(MakeCommand),

    /// Inspect server state
    #[command(subcommand)]
    Check(CheckCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Install
// ============================================================================

#[derive(Args)]
pub struct InstallArgs {
    /// Steps to skip (repeatable or comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Only run these steps (repeatable or comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,
}

// ============================================================================
// Make
// ============================================================================

#[derive(Subcommand)]
pub enum MakeCommand {
    /// Settings, sync plans, lifecycle environments, domains and subnets
    Init,
}

// ============================================================================
// Check
// ============================================================================

#[derive(Subcommand)]
pub enum CheckCommand {
    /// Show or wait for background tasks
    Task(TaskArgs),

    /// Show the last synchronization of every repository
    Sync,
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("query")
        .required(true)
        .args(["id", "incomplete", "bad", "wait_idle", "reset_pulp"])
))]
pub struct TaskArgs {
    /// Show a single task
    #[arg(long)]
    pub id: Option<String>,

    /// Show tasks that have not stopped
    #[arg(long)]
    pub incomplete: bool,

    /// Show tasks that ended in error
    #[arg(long)]
    pub bad: bool,

    /// Block until no task is running
    #[arg(long)]
    pub wait_idle: bool,

    /// Clear the stuck pulp sub-task of a paused task and resume it
    #[arg(long, value_name = "TASK_ID")]
    pub reset_pulp: Option<String>,
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
    fn test_install_step_lists() {
        let cli = Cli::parse_from([
            "forge",
            "-vv",
            "install",
            "--skip",
            "pkg-install,set-default-loc",
            "--only",
            "satellite-install",
        ]);
        assert_eq!(cli.verbose, 2);
        let Command::Install(args) = cli.command else {
            panic!("expected install");
        };
        assert_eq!(args.skip, vec!["pkg-install", "set-default-loc"]);
        assert_eq!(args.only, vec!["satellite-install"]);
    }

    #[test]
    fn test_task_query_is_required_and_exclusive() {
        assert!(Cli::try_parse_from(["forge", "check", "task"]).is_err());
        assert!(Cli::try_parse_from(["forge", "check", "task", "--bad", "--incomplete"]).is_err());

        let cli = Cli::try_parse_from(["forge", "-s", "lab", "check", "task", "--wait-idle"]).unwrap();
        assert_eq!(cli.server.as_deref(), Some("lab"));
        let Command::Check(CheckCommand::Task(args)) = cli.command else {
            panic!("expected check task");
        };
        assert!(args.wait_idle);
    }

    #[test]
    fn test_check_sync() {
        let cli = Cli::try_parse_from(["forge", "check", "sync"]).unwrap();
        assert!(matches!(cli.command, Command::Check(CheckCommand::Sync)));
        assert!(Cli::try_parse_from(["forge", "check", "sync", "--bad"]).is_err());
    }
}
