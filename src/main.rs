mod cli;
mod commands;
mod engine;
mod paths;
mod progress;
mod prompt;
mod schema;
mod state;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::process::ExitCode;

use schema::{LoadedConfig, StagehandConfig};

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub yes: bool,
    pub config: Option<String>,
}

impl Context {
    /// Locate and parse the config file.
    pub fn load_config(&self) -> Result<LoadedConfig> {
        let path = paths::config_file(self.config.as_deref())?;
        StagehandConfig::load(&path)
    }
}

/// The engine error behind an anyhow chain, if any.
pub fn library_error(err: &anyhow::Error) -> Option<&releasekit::Error> {
    err.chain().find_map(|e| e.downcast_ref::<releasekit::Error>())
}

fn main() -> ExitCode {
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
        yes: cli.yes,
        config: cli.config,
    };

    match run(&ctx, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn run(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Deploy(args) => commands::deploy::run(ctx, &args),
        Command::Verify(args) => commands::deploy::verify(ctx, &args),
        Command::Unlock(args) => commands::deploy::unlock(ctx, &args.stage),
        Command::Rollback(args) => commands::releases::rollback(ctx, &args),
        Command::Releases(args) => commands::releases::list(ctx, &args),
        Command::DbBackup(args) => commands::db::backup(ctx, &args.stage),
        Command::DbBackups(args) => commands::db::list(ctx, &args),
        Command::DbRestore(args) => commands::db::restore(ctx, &args),
        Command::DbEnsureSqlite(args) => commands::db::ensure_sqlite(ctx, &args.stage),
        Command::MigrateStatus(args) => commands::migrate::status(ctx, &args.stage),
        Command::MigratePretend(args) => commands::migrate::pretend(ctx, &args.stage),
        Command::Preflight(args) => commands::preflight::run(ctx, &args.stage),
        Command::PreflightDisk(args) => commands::preflight::disk(ctx, &args.stage),
        Command::PreflightServices(args) => commands::preflight::services(ctx, &args.stage),
        Command::CacheStatus(args) => commands::cache::status(ctx, &args.stage),
        Command::CacheClear(args) => commands::cache::clear(ctx, &args.stage),
        Command::EnvShow(args) => commands::env::show(ctx, &args.stage),
        Command::EnvDiff(args) => commands::env::diff(ctx, &args),
        Command::Status(args) => commands::status::run(ctx, &args),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "stagehand", &mut io::stdout());
            Ok(())
        }
    }
}

/// Print an error with its remediation instead of a backtrace.
fn report(err: &anyhow::Error) {
    ui::error(&format!("{err:#}"));
    if let Some(engine) = library_error(err) {
        eprintln!("  {}: {}", engine.category().description(), engine.guidance());
    }
}
