use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

use crate::paths::ENV_CONFIG;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version)]
#[command(about = "Ship releases safely: preflight, cached builds, guarded migrations, health-gated rollback", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Answer yes to every confirmation
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Config file (default: stagehand.toml or deploy/stagehand.toml)
    #[arg(short, long, global = true, env = ENV_CONFIG)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy a new release to one or more stages
    Deploy(DeployArgs),

    /// Verify the live release of a stage
    #[command(name = "deploy:verify")]
    Verify(VerifyArgs),

    /// Remove a stale deploy lock
    #[command(name = "deploy:unlock")]
    Unlock(StageArgs),

    /// Roll the active release back
    Rollback(RollbackArgs),

    /// List releases on a stage
    Releases(ListArgs),

    /// Back up the database of a stage
    #[command(name = "db:backup")]
    DbBackup(StageArgs),

    /// List database backups of a stage, newest first
    #[command(name = "db:backups")]
    DbBackups(ListArgs),

    /// Restore a database backup
    #[command(name = "db:restore")]
    DbRestore(RestoreArgs),

    /// Create the SQLite database file if it is missing
    #[command(name = "db:ensure-sqlite")]
    DbEnsureSqlite(StageArgs),

    /// Show migration status of the live release
    #[command(name = "migrate:status")]
    MigrateStatus(StageArgs),

    /// Show the SQL pending migrations would run
    #[command(name = "migrate:pretend")]
    MigratePretend(StageArgs),

    /// Run preflight checks against a stage
    Preflight(StageArgs),

    /// Show disk and memory usage of a stage's host
    #[command(name = "preflight:disk")]
    PreflightDisk(StageArgs),

    /// Show the state of the services a stage depends on
    #[command(name = "preflight:services")]
    PreflightServices(StageArgs),

    /// Show build cache fingerprints and artifacts
    #[command(name = "cache:status")]
    CacheStatus(StageArgs),

    /// Delete every cached build artifact of a stage
    #[command(name = "cache:clear")]
    CacheClear(StageArgs),

    /// Print the environment file a deploy would write, secrets masked
    #[command(name = "env:show")]
    EnvShow(StageArgs),

    /// Compare the live environment file with the one a deploy would write
    #[command(name = "env:diff")]
    EnvDiff(EnvDiffArgs),

    /// Show what this machine remembers about each stage
    Status(StatusArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Arguments
// ============================================================================

#[derive(Args)]
pub struct StageArgs {
    /// Stage name from [environments.<stage>]
    pub stage: String,
}

#[derive(Args)]
pub struct ListArgs {
    /// Stage name
    pub stage: String,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct DeployArgs {
    /// Stages to deploy
    #[arg(required = true)]
    pub stages: Vec<String>,

    /// Number of stages deployed in parallel
    #[arg(short, long, default_value = "1")]
    pub jobs: usize,
}

#[derive(Args)]
pub struct VerifyArgs {
    /// Stage name
    pub stage: String,

    /// Single attempt, no body inspection
    #[arg(long, conflicts_with = "deep")]
    pub quick: bool,

    /// Also run deep probes (database, cache, queue)
    #[arg(long)]
    pub deep: bool,
}

#[derive(Args)]
pub struct RollbackArgs {
    /// Stage name
    pub stage: String,

    /// Release to roll back to (default: the one before the active release)
    #[arg(long)]
    pub to: Option<String>,

    /// Delete the release that was rolled back from
    #[arg(long)]
    pub cleanup: bool,

    /// Roll back even if the active release is not marked unhealthy
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct RestoreArgs {
    /// Stage name
    pub stage: String,

    /// Restore the newest backup
    #[arg(long, conflicts_with = "file")]
    pub latest: bool,

    /// Backup file name to restore
    #[arg(long)]
    pub file: Option<String>,
}

#[derive(Args)]
pub struct EnvDiffArgs {
    /// Stage name
    pub stage: String,

    /// Print a line diff of the rendered files
    #[arg(long)]
    pub unified: bool,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}
