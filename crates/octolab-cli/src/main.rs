mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = run(cli).await;

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) if e.downcast_ref::<Interrupted>().is_some() => std::process::exit(130),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Sentinel error distinguishing an operator-requested interrupt from a
/// real failure, so `main` can map it to exit code 130 instead of 1.
#[derive(Debug)]
struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted")
    }
}

impl std::error::Error for Interrupted {}

async fn run(cli: Cli) -> Result<()> {
    let config = octolab_config::OctolabConfig::from_env()?;

    match cli.command {
        Command::Retention {
            days,
            dry_run,
            execute,
            limit,
        } => commands::retention(cli.database_url, config, days, dry_run, execute, limit).await,

        Command::Watchdog {
            lab_id,
            older_than_minutes,
            max_labs,
            dry_run,
            action,
        } => {
            commands::watchdog(
                cli.database_url,
                config,
                lab_id,
                older_than_minutes,
                max_labs,
                dry_run,
                action,
            )
            .await
        }

        Command::Gc {
            dry_run,
            include_volumes,
        } => {
            tokio::select! {
                result = commands::gc(cli.database_url, config, dry_run, include_volumes) => result,
                _ = tokio::signal::ctrl_c() => Err(Interrupted.into()),
            }
        }
    }
}
