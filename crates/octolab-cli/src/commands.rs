use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use octolab_config::OctolabConfig;
use octolab_core::{GcJob, RetentionJob, Watchdog, WatchdogAction};
use octolab_runtime::{ComposeRuntime, LabRuntime, MicrovmRuntime, NoopRuntime, RuntimeRegistry};
use octolab_store::{InMemoryStore, PostgresStore, StateStore};
use uuid::Uuid;

use crate::cli::WatchdogActionArg;

async fn build_store(database_url: Option<String>) -> Result<Arc<dyn StateStore>> {
    match database_url {
        Some(url) => {
            let store = PostgresStore::connect(&url)
                .await
                .context("failed to connect to Postgres")?;
            Ok(Arc::new(store))
        }
        None => {
            eprintln!("warning: no --database-url/DATABASE_URL set, using an ephemeral in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// Builds the same three-backend registry the server wires up, so the
/// watchdog and gc commands exercise the real configured backend rather
/// than assuming noop.
fn build_registry(config: &OctolabConfig, store: Arc<dyn StateStore>) -> Result<Arc<RuntimeRegistry>> {
    let state_root = PathBuf::from(&config.state_root);

    let compose: Arc<dyn LabRuntime> = Arc::new(ComposeRuntime::new(
        state_root.join("compose"),
        config.startup_timeout_seconds,
        config.teardown_timeout_seconds,
    ));

    let microvm: Arc<dyn LabRuntime> = Arc::new(MicrovmRuntime::new(
        store,
        state_root.join("microvm"),
        state_root.join("images/rootfs.img"),
        state_root.join("images/vmlinux"),
        config.startup_timeout_seconds,
        config.teardown_timeout_seconds,
        config.dev_unsafe_allow_no_jailer,
    ));

    let noop: Arc<dyn LabRuntime> = Arc::new(NoopRuntime::new());

    let registry = RuntimeRegistry::new(config.clone(), compose, microvm, noop)
        .context("backend failed its readiness check")?;
    Ok(Arc::new(registry))
}

// ── Retention ─────────────────────────────────────────────────────────────

pub async fn retention(
    database_url: Option<String>,
    config: OctolabConfig,
    _days: u32,
    dry_run: bool,
    execute: bool,
    limit: u32,
) -> Result<()> {
    let store = build_store(database_url).await?;
    let evidence_root = PathBuf::from(&config.state_root).join("evidence");
    let job = RetentionJob::new(store, evidence_root);

    let execute = execute && !dry_run;
    let summary = job.run(limit, execute).await?;

    println!(
        "retention: examined={} purged={} dry_run={}",
        summary.examined, summary.purged, summary.dry_run
    );
    Ok(())
}

// ── Watchdog ──────────────────────────────────────────────────────────────

pub async fn watchdog(
    database_url: Option<String>,
    config: OctolabConfig,
    lab_id: Option<Uuid>,
    older_than_minutes: u32,
    max_labs: u32,
    dry_run: bool,
    action: WatchdogActionArg,
) -> Result<()> {
    let store = build_store(database_url).await?;
    let registry = build_registry(&config, store.clone())?;
    let watchdog = Watchdog::new(store, registry, config);

    let action = match action {
        WatchdogActionArg::Force => WatchdogAction::Force,
        WatchdogActionArg::Fail => WatchdogAction::Fail,
    };

    let report = match lab_id {
        Some(id) => {
            watchdog
                .resolve_by_id(octolab_domain::LabId(id), action, dry_run)
                .await?
        }
        None => {
            watchdog
                .sweep(older_than_minutes, max_labs, action, dry_run)
                .await?
        }
    };

    println!(
        "watchdog: examined={} acted_on={} dry_run={}",
        report.examined.len(),
        report.acted_on.len(),
        report.dry_run
    );
    Ok(())
}

// ── GC ────────────────────────────────────────────────────────────────────

pub async fn gc(
    database_url: Option<String>,
    config: OctolabConfig,
    dry_run: bool,
    include_volumes: bool,
) -> Result<()> {
    let store = build_store(database_url).await?;
    let evidence_root = PathBuf::from(&config.state_root).join("evidence");
    let retention = RetentionJob::new(store.clone(), evidence_root);
    let job = GcJob::new(store, retention);

    let summary = job.run(dry_run, include_volumes, 500).await?;

    println!(
        "gc: expired_labs={} evidence_purged={} orphan_volumes_removed={} dry_run={}",
        summary.expired_labs, summary.evidence_purged, summary.orphan_volumes_removed, summary.dry_run
    );
    Ok(())
}
