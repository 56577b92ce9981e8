mod cli;
mod commands;
mod config;
mod logging;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{CheckCommand, Cli, Command, MakeCommand};
use config::ForgeConfig;
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config_path: Option<PathBuf>,
    pub server: Option<String>,
}

impl Context {
    /// Locate and load the configuration file.
    pub fn load_config(&self) -> Result<ForgeConfig> {
        let path = config::locate(self.config_path.as_deref())?;
        log::debug!("Loading configuration from {}", path.display());
        ForgeConfig::load(&path)
    }

    /// Transcript file of the selected server. Configuration problems are
    /// left for the command to report.
    fn transcript_path(&self) -> Option<PathBuf> {
        let config = self.load_config().ok()?;
        let (name, _) = config.server(self.server.as_deref()).ok()?;
        Some(logging::transcript_path(name))
    }
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
    let level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        log_level
    };

    // Relayed installer output stays visible unless asked to be quiet
    let step_level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        level.max(log::LevelFilter::Info)
    };

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config_path: cli.config,
        server: cli.server,
    };

    // Everything that talks to a server leaves a Debug transcript behind
    let transcript = if matches!(cli.command, Command::Completions { .. }) {
        None
    } else {
        ctx.transcript_path()
            .and_then(|path| match logging::open_transcript(&path) {
                Ok(file) => Some(logging::transcript(file)),
                Err(err) => {
                    ui::warn(&format!("{err:#}"));
                    None
                }
            })
    };
    logging::install(logging::screen(level, step_level), transcript)?;

    let result = match cli.command {
        Command::Install(args) => commands::install::run(&ctx, &args),
        Command::Make(MakeCommand::Init) => commands::make::init(&ctx),
        Command::Check(CheckCommand::Task(args)) => commands::task::run(&ctx, &args),
        Command::Check(CheckCommand::Sync) => commands::sync::run(&ctx),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "forge", &mut io::stdout());
            Ok(())
        }
    };

    // Remote failures get a hint before the error chain is printed
    if let Err(err) = &result
        && let Some(remote) = err.chain().find_map(|e| e.downcast_ref::<reconcile::Error>())
    {
        let category = remote.category();
        ui::error(category.description());
        ui::info(category.advice());
    }
    result
}
