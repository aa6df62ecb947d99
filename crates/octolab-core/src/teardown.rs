use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use octolab_config::OctolabConfig;
use octolab_domain::{Lab, LabStatus};
use octolab_runtime::RuntimeRegistry;
use octolab_store::StateStore;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::evidence::finalize_evidence;

/// Drains `ENDING` labs on a fixed interval, tearing down backend resources
/// and moving each lab to its terminal state. One worker instance per
/// process; concurrent instances are safe because `claim_ending_labs` uses
/// `FOR UPDATE SKIP LOCKED`.
pub struct TeardownWorker {
    store: Arc<dyn StateStore>,
    registry: Arc<RuntimeRegistry>,
    config: OctolabConfig,
}

impl TeardownWorker {
    pub fn new(store: Arc<dyn StateStore>, registry: Arc<RuntimeRegistry>, config: OctolabConfig) -> Self {
        TeardownWorker {
            store,
            registry,
            config,
        }
    }

    /// Runs until `shutdown` fires. Performs one immediate tick on startup
    /// when `teardown_worker.startup_tick` is set, then ticks on the
    /// configured interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.teardown_worker.enabled {
            info!("teardown worker disabled by configuration");
            return;
        }

        if self.config.teardown_worker.startup_tick {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "startup teardown tick failed");
            }
        }

        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.teardown_worker.interval_seconds as u64,
        ));
        interval.tick().await; // consume the immediate first tick; we already ran one above

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "teardown tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("teardown worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One pass: claim a batch of `ENDING` labs and drive each to its
    /// terminal state. Errors on individual labs are logged, not
    /// propagated, so one bad lab never blocks the rest of the batch.
    pub async fn tick(&self) -> Result<(), CoreError> {
        let claimed = self
            .store
            .claim_ending_labs(self.config.teardown_worker.batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(());
        }
        debug!(count = claimed.len(), "teardown worker claimed labs");

        for lab in claimed {
            if let Err(e) = self.teardown_one(lab).await {
                warn!(error = %e, "failed to tear down claimed lab");
            }
        }
        Ok(())
    }

    async fn teardown_one(&self, lab: Lab) -> Result<(), CoreError> {
        let backend = self.registry.active();
        let lab_id = lab.id;

        let still_exists = backend.resources_exist_for_lab(&lab).await?;
        if !still_exists {
            self.finish(lab, LabStatus::Finished).await?;
            let _ = self.store.release_port(&lab_id, None).await;
            return Ok(());
        }

        let timeout = Duration::from_secs(self.config.teardown_timeout_seconds as u64);
        let outcome = tokio::time::timeout(timeout, backend.destroy_lab(&lab)).await;

        let final_status = match &outcome {
            Ok(Ok(result)) if result.success => LabStatus::Finished,
            Ok(Ok(result)) => {
                warn!(
                    %lab_id,
                    containers_remaining = result.containers_remaining,
                    networks_remaining = result.networks_remaining,
                    "teardown left resources behind"
                );
                LabStatus::Failed
            }
            Ok(Err(e)) => {
                warn!(%lab_id, error = %e, "destroy_lab errored");
                LabStatus::Failed
            }
            Err(_) => {
                warn!(%lab_id, "teardown timed out");
                LabStatus::Failed
            }
        };

        self.finish(lab, final_status).await?;
        let _ = self.store.release_port(&lab_id, None).await;
        Ok(())
    }

    async fn finish(&self, mut lab: Lab, status: LabStatus) -> Result<(), CoreError> {
        if lab.status.validate_transition(status)? {
            lab.status = status;
            if lab.finished_at.is_none() {
                lab.finished_at = Some(Utc::now());
            }
        }
        finalize_evidence(&mut lab, &self.config);
        lab.updated_at = Utc::now();
        self.store.update_lab(&lab).await?;
        info!(lab_id = %lab.id, status = %lab.status, evidence_state = %lab.evidence_state, "lab torn down");
        Ok(())
    }
}
