use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "octolab",
    about = "Operator-side maintenance jobs for the lab lifecycle core",
    version
)]
pub struct Cli {
    /// Postgres connection string. Falls back to an in-memory store (state
    /// lost on exit) when neither this nor DATABASE_URL is set — useful for
    /// dry runs against nothing, never for a real deployment.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Purge evidence for terminal labs whose retention window has elapsed.
    Retention {
        /// Only consider labs whose evidence window elapsed more than N
        /// days ago (kept for operator ergonomics; the window itself is
        /// computed per-lab at finalization time).
        #[arg(long)]
        days: u32,

        /// Log what would be purged without deleting anything or mutating
        /// the store. Mutually exclusive with --execute.
        #[arg(long, conflicts_with = "execute")]
        dry_run: bool,

        /// Actually delete evidence artifacts and mark labs purged.
        #[arg(long, conflicts_with = "dry_run")]
        execute: bool,

        /// Cap on how many labs a single invocation processes.
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },

    /// Force-resolve labs the Teardown Worker appears to have dropped.
    Watchdog {
        /// Resolve a single lab by id, bypassing the stuck-since scan.
        #[arg(long)]
        lab_id: Option<Uuid>,

        /// Only consider ENDING labs whose last update is older than this.
        #[arg(long, default_value_t = 15, conflicts_with = "lab_id")]
        older_than_minutes: u32,

        /// Cap on how many labs a single invocation processes.
        #[arg(long, default_value_t = 50)]
        max_labs: u32,

        /// Log what would be acted on without mutating anything.
        #[arg(long)]
        dry_run: bool,

        /// How to resolve a stuck lab once claimed.
        #[arg(long, default_value = "force")]
        action: WatchdogActionArg,
    },

    /// Sweep expired labs, purge retained evidence, and optionally reclaim
    /// orphaned backend volumes in one pass.
    Gc {
        /// Log what would happen without mutating anything or deleting
        /// volumes.
        #[arg(long)]
        dry_run: bool,

        /// Also scan for and remove compose volumes with no corresponding
        /// live lab.
        #[arg(long)]
        include_volumes: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum WatchdogActionArg {
    Force,
    Fail,
}
