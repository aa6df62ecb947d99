use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use octolab_config::OctolabConfig;
use octolab_domain::{EvidenceState, Lab, LabStatus};
use octolab_hygiene::rmtree_hardened;
use octolab_store::StateStore;
use tracing::info;

use crate::error::CoreError;

/// Stamps `evidence_finalized_at`/`evidence_expires_at` on a lab entering a
/// terminal state. The retention window differs by how the lab ended:
/// a clean FINISHED keeps its evidence a full day for review, while a
/// FAILED lab is assumed to carry less useful evidence and is kept only
/// long enough for an operator to glance at it.
pub fn finalize_evidence(lab: &mut Lab, config: &OctolabConfig) {
    if lab.evidence_finalized_at.is_some() {
        return;
    }

    let now = Utc::now();
    lab.evidence_finalized_at = Some(now);

    let window = match lab.status {
        LabStatus::Finished => ChronoDuration::hours(24),
        LabStatus::Failed => ChronoDuration::hours(2),
        _ => ChronoDuration::hours(config.evidence_retention_hours as i64),
    };
    lab.evidence_expires_at = Some(now + window);
}

/// Sweeps terminal labs whose evidence window has elapsed and purges their
/// lab-specific artifacts. Defaults to dry-run: callers must opt in with
/// `execute = true` to actually delete anything or mutate the store, the
/// same posture the CLI retention/watchdog commands take.
pub struct RetentionJob {
    store: Arc<dyn StateStore>,
    evidence_root: std::path::PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionSummary {
    pub examined: u32,
    pub purged: u32,
    pub dry_run: bool,
}

impl RetentionJob {
    pub fn new(store: Arc<dyn StateStore>, evidence_root: std::path::PathBuf) -> Self {
        RetentionJob {
            store,
            evidence_root,
        }
    }

    pub async fn run(&self, max_labs: u32, execute: bool) -> Result<RetentionSummary, CoreError> {
        let now = Utc::now();
        let candidates = self.store.list_labs_for_retention(now, max_labs).await?;
        let mut summary = RetentionSummary {
            examined: candidates.len() as u32,
            purged: 0,
            dry_run: !execute,
        };

        for mut lab in candidates {
            if !execute {
                info!(lab_id = %lab.id, "retention dry-run: would purge evidence");
                continue;
            }

            let lab_dir = self.evidence_root.join(format!("lab_{}", lab.id.as_uuid()));
            rmtree_hardened(&lab_dir);

            lab.evidence_state = EvidenceState::Unavailable;
            lab.evidence_purged_at = Some(now);
            lab.updated_at = now;
            self.store.update_lab(&lab).await?;
            summary.purged += 1;
            info!(lab_id = %lab.id, "evidence purged");
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> OctolabConfig {
        std::env::set_var("OCTOLAB_RUNTIME", "noop");
        std::env::set_var("OCTOLAB_PORT_MIN", "20000");
        std::env::set_var("OCTOLAB_PORT_MAX", "21000");
        std::env::set_var("OCTOLAB_STARTUP_TIMEOUT_SECONDS", "60");
        std::env::set_var("OCTOLAB_TEARDOWN_TIMEOUT_SECONDS", "30");
        std::env::set_var("OCTOLAB_STATE_ROOT", "/var/lib/octolab");
        std::env::set_var("OCTOLAB_INTERNAL_TOKEN", "test-token");
        OctolabConfig::from_env().unwrap()
    }

    fn dummy_lab(status: LabStatus) -> Lab {
        let mut lab = Lab::new_requested(
            octolab_domain::OwnerId(uuid::Uuid::new_v4()),
            octolab_domain::RecipeId(uuid::Uuid::new_v4()),
            octolab_domain::RuntimeKind::Compose,
            serde_json::Value::Null,
            Utc::now(),
        );
        lab.status = status;
        lab
    }

    #[test]
    fn finished_labs_get_a_24_hour_window() {
        let mut lab = dummy_lab(LabStatus::Finished);
        finalize_evidence(&mut lab, &test_config());
        let delta = lab.evidence_expires_at.unwrap() - lab.evidence_finalized_at.unwrap();
        assert_eq!(delta.num_hours(), 24);
    }

    #[test]
    fn failed_labs_get_a_2_hour_window() {
        let mut lab = dummy_lab(LabStatus::Failed);
        finalize_evidence(&mut lab, &test_config());
        let delta = lab.evidence_expires_at.unwrap() - lab.evidence_finalized_at.unwrap();
        assert_eq!(delta.num_hours(), 2);
    }

    #[test]
    fn finalizing_twice_is_a_no_op() {
        let mut lab = dummy_lab(LabStatus::Finished);
        finalize_evidence(&mut lab, &test_config());
        let first = lab.evidence_expires_at;
        finalize_evidence(&mut lab, &test_config());
        assert_eq!(lab.evidence_expires_at, first);
    }
}
