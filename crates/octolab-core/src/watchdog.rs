use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use octolab_domain::{Lab, LabId, LabStatus};
use octolab_runtime::RuntimeRegistry;
use octolab_store::StateStore;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::evidence::finalize_evidence;

/// What to do with a lab the watchdog finds stuck in `ENDING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Attempt a real teardown, same as the Teardown Worker would; succeeds
    /// to FINISHED only if resources are confirmed gone afterward.
    Force,
    /// Skip the teardown attempt entirely and mark the lab FAILED. An
    /// emergency drain for when the backend itself is unresponsive.
    Fail,
}

#[derive(Debug, Clone, Default)]
pub struct WatchdogReport {
    pub examined: Vec<LabId>,
    pub acted_on: Vec<LabId>,
    pub dry_run: bool,
}

/// Finds `ENDING` labs that have sat past a threshold — ones the Teardown
/// Worker appears to have dropped — and force-resolves them. Invoked by an
/// operator or a cron job, not a long-running loop like the worker.
pub struct Watchdog {
    store: Arc<dyn StateStore>,
    registry: Arc<RuntimeRegistry>,
    config: octolab_config::OctolabConfig,
}

impl Watchdog {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<RuntimeRegistry>,
        config: octolab_config::OctolabConfig,
    ) -> Self {
        Watchdog {
            store,
            registry,
            config,
        }
    }

    pub async fn sweep(
        &self,
        older_than_minutes: u32,
        max_labs: u32,
        action: WatchdogAction,
        dry_run: bool,
    ) -> Result<WatchdogReport, CoreError> {
        let stuck_since = Utc::now() - chrono::Duration::minutes(older_than_minutes as i64);
        let stuck = self
            .store
            .claim_stuck_ending_labs(stuck_since, max_labs)
            .await?;

        let mut report = WatchdogReport {
            examined: stuck.iter().map(|l| l.id).collect(),
            acted_on: Vec::new(),
            dry_run,
        };

        for lab in stuck {
            if dry_run {
                info!(lab_id = %lab.id, owner_suffix = %owner_suffix(&lab), "watchdog dry-run: would act on stuck lab");
                continue;
            }
            self.resolve_one(lab.clone(), action).await?;
            report.acted_on.push(lab.id);
        }

        Ok(report)
    }

    /// Operator override for a single known-bad lab, bypassing the
    /// stuck-since scan `sweep` uses. Still requires the lab to be in
    /// `ENDING` — this is a resolution tool, not a way to force-kill a
    /// healthy lab.
    pub async fn resolve_by_id(
        &self,
        lab_id: LabId,
        action: WatchdogAction,
        dry_run: bool,
    ) -> Result<WatchdogReport, CoreError> {
        let lab = self
            .store
            .get_lab(&lab_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(lab_id.to_string()))?;

        if lab.status != LabStatus::Ending {
            return Err(CoreError::WrongState {
                lab_id: lab_id.to_string(),
                status: lab.status.to_string(),
            });
        }

        let mut report = WatchdogReport {
            examined: vec![lab.id],
            acted_on: Vec::new(),
            dry_run,
        };

        if dry_run {
            info!(lab_id = %lab.id, owner_suffix = %owner_suffix(&lab), "watchdog dry-run: would act on stuck lab");
            return Ok(report);
        }

        self.resolve_one(lab.clone(), action).await?;
        report.acted_on.push(lab.id);
        Ok(report)
    }

    async fn resolve_one(&self, mut lab: Lab, action: WatchdogAction) -> Result<(), CoreError> {
        let final_status = match action {
            WatchdogAction::Fail => {
                warn!(lab_id = %lab.id, "watchdog: failing stuck lab without teardown attempt");
                LabStatus::Failed
            }
            WatchdogAction::Force => {
                let backend = self.registry.active();
                let timeout = Duration::from_secs(self.config.teardown_timeout_seconds as u64);
                let outcome = tokio::time::timeout(timeout, backend.destroy_lab(&lab)).await;
                match outcome {
                    Ok(Ok(result)) if result.success => LabStatus::Finished,
                    _ => LabStatus::Failed,
                }
            }
        };

        if lab.status.validate_transition(final_status)? {
            lab.status = final_status;
            if lab.finished_at.is_none() {
                lab.finished_at = Some(Utc::now());
            }
        }
        finalize_evidence(&mut lab, &self.config);
        lab.updated_at = Utc::now();
        self.store.update_lab(&lab).await?;
        let _ = self.store.release_port(&lab.id, None).await;
        info!(lab_id = %lab.id, status = %lab.status, "watchdog resolved stuck lab");
        Ok(())
    }
}

/// Redacted identifier for a dry-run log line: last 8 hex characters of the
/// owner id, never the full id.
fn owner_suffix(lab: &Lab) -> String {
    let full = lab.owner_id.to_string();
    full.chars().rev().take(8).collect::<String>().chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use octolab_domain::{OwnerId, RecipeId, RuntimeKind};
    use octolab_runtime::NoopRuntime;
    use octolab_store::InMemoryStore;
    use serde_json::Value;

    fn test_config() -> octolab_config::OctolabConfig {
        std::env::set_var("OCTOLAB_RUNTIME", "noop");
        std::env::set_var("OCTOLAB_PORT_MIN", "20000");
        std::env::set_var("OCTOLAB_PORT_MAX", "21000");
        std::env::set_var("OCTOLAB_STARTUP_TIMEOUT_SECONDS", "60");
        std::env::set_var("OCTOLAB_TEARDOWN_TIMEOUT_SECONDS", "30");
        std::env::set_var("OCTOLAB_STATE_ROOT", "/var/lib/octolab");
        std::env::set_var("OCTOLAB_INTERNAL_TOKEN", "test-token");
        octolab_config::OctolabConfig::from_env().unwrap()
    }

    fn stuck_ending_lab() -> Lab {
        let mut lab = Lab::new_requested(
            OwnerId(uuid::Uuid::new_v4()),
            RecipeId(uuid::Uuid::new_v4()),
            RuntimeKind::Compose,
            Value::Null,
            Utc::now() - chrono::Duration::hours(2),
        );
        lab.status = LabStatus::Ending;
        lab.updated_at = Utc::now() - chrono::Duration::hours(2);
        lab
    }

    #[tokio::test]
    async fn dry_run_examines_but_does_not_mutate() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let lab = stuck_ending_lab();
        store.insert_lab(&lab).await.unwrap();

        let noop: Arc<dyn octolab_runtime::LabRuntime> = Arc::new(NoopRuntime::new());
        let registry = Arc::new(
            RuntimeRegistry::new(test_config(), noop.clone(), noop.clone(), noop).unwrap(),
        );
        let watchdog = Watchdog::new(store.clone(), registry, test_config());

        let report = watchdog
            .sweep(30, 10, WatchdogAction::Force, true)
            .await
            .unwrap();
        assert_eq!(report.examined.len(), 1);
        assert!(report.acted_on.is_empty());

        let reloaded = store.get_lab(&lab.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, LabStatus::Ending);
    }

    #[tokio::test]
    async fn fail_action_marks_lab_failed_without_teardown() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let lab = stuck_ending_lab();
        store.insert_lab(&lab).await.unwrap();

        let noop: Arc<dyn octolab_runtime::LabRuntime> = Arc::new(NoopRuntime::new());
        let registry = Arc::new(
            RuntimeRegistry::new(test_config(), noop.clone(), noop.clone(), noop).unwrap(),
        );
        let watchdog = Watchdog::new(store.clone(), registry, test_config());

        let report = watchdog
            .sweep(30, 10, WatchdogAction::Fail, false)
            .await
            .unwrap();
        assert_eq!(report.acted_on.len(), 1);

        let reloaded = store.get_lab(&lab.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, LabStatus::Failed);
    }
}
