use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use octolab_domain::LabStatus;
use octolab_store::StateStore;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::evidence::RetentionJob;

const VOLUME_LIST_TIMEOUT: Duration = Duration::from_secs(10);
const VOLUME_RM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct GcSummary {
    pub expired_labs: u32,
    pub evidence_purged: u32,
    pub orphan_volumes_removed: u32,
    pub dry_run: bool,
}

/// Runs the three sweeps the `gc` CLI command chains together: lab TTL
/// expiry, evidence retention, and (optionally) orphaned compose volumes.
/// Each sweep is independent — a failure in one does not block the others.
pub struct GcJob {
    store: Arc<dyn StateStore>,
    retention: RetentionJob,
}

impl GcJob {
    pub fn new(store: Arc<dyn StateStore>, retention: RetentionJob) -> Self {
        GcJob { store, retention }
    }

    pub async fn run(
        &self,
        dry_run: bool,
        include_volumes: bool,
        retention_max_labs: u32,
    ) -> Result<GcSummary, CoreError> {
        let mut summary = GcSummary {
            dry_run,
            ..Default::default()
        };

        summary.expired_labs = self.sweep_expired_labs(dry_run).await?;

        let retention_summary = self.retention.run(retention_max_labs, !dry_run).await?;
        summary.evidence_purged = retention_summary.purged;

        if include_volumes {
            summary.orphan_volumes_removed = self.sweep_orphan_volumes(dry_run).await;
        }

        Ok(summary)
    }

    /// Labs past `expires_at` in READY/DEGRADED are handed to the Teardown
    /// Worker the same way an explicit `terminate_lab` call would.
    async fn sweep_expired_labs(&self, dry_run: bool) -> Result<u32, CoreError> {
        let now = Utc::now();
        let mut count = 0u32;

        let candidates = self.store.list_expirable_labs(now).await?;
        for mut lab in candidates {
            if dry_run {
                info!(lab_id = %lab.id, "gc dry-run: lab past expiry, would terminate");
                count += 1;
                continue;
            }
            if lab.status.validate_transition(LabStatus::Ending)? {
                lab.status = LabStatus::Ending;
                lab.updated_at = now;
                self.store.update_lab(&lab).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Lists docker volumes named with the `octolab_` prefix and removes any
    /// whose embedded lab id no longer corresponds to a live lab. Grounded
    /// on the same curated-subprocess discipline as the compose backend:
    /// a cleared environment, piped output, and a bounded timeout.
    async fn sweep_orphan_volumes(&self, dry_run: bool) -> u32 {
        let names = match list_octolab_volumes().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "gc: failed to list docker volumes, skipping volume sweep");
                return 0;
            }
        };

        let live_ids = match self.store.list_all_lab_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "gc: failed to list labs, skipping volume sweep");
                return 0;
            }
        };

        let mut removed = 0;
        for name in names {
            let Some(lab_uuid) = extract_lab_uuid(&name) else {
                continue;
            };
            if live_ids.iter().any(|id| id.as_uuid() == lab_uuid) {
                continue;
            }
            if dry_run {
                info!(volume = %name, "gc dry-run: would remove orphaned volume");
                removed += 1;
                continue;
            }
            match remove_volume(&name).await {
                Ok(()) => {
                    info!(volume = %name, "gc: removed orphaned volume");
                    removed += 1;
                }
                Err(e) => warn!(volume = %name, error = %e, "gc: failed to remove volume"),
            }
        }
        removed
    }
}

fn extract_lab_uuid(volume_name: &str) -> Option<uuid::Uuid> {
    let rest = volume_name.strip_prefix("octolab_")?;
    let hex: String = rest.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() < 32 {
        return None;
    }
    uuid::Uuid::parse_str(&hex[..32]).ok()
}

async fn list_octolab_volumes() -> Result<Vec<String>, CoreError> {
    let mut cmd = tokio::process::Command::new("docker");
    cmd.args(["volume", "ls", "-q", "--filter", "name=octolab_"])
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = tokio::time::timeout(VOLUME_LIST_TIMEOUT, cmd.output())
        .await
        .map_err(|_| CoreError::Internal("docker volume ls timed out".to_string()))?
        .map_err(|e| CoreError::Internal(format!("docker volume ls failed: {e}")))?;

    if !output.status.success() {
        return Err(CoreError::Internal(format!(
            "docker volume ls exited with {}",
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

async fn remove_volume(name: &str) -> Result<(), CoreError> {
    let mut cmd = tokio::process::Command::new("docker");
    cmd.args(["volume", "rm", name])
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let status = tokio::time::timeout(VOLUME_RM_TIMEOUT, cmd.status())
        .await
        .map_err(|_| CoreError::Internal("docker volume rm timed out".to_string()))?
        .map_err(|e| CoreError::Internal(format!("docker volume rm failed: {e}")))?;

    if !status.success() {
        return Err(CoreError::Internal(format!("docker volume rm exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_lab_uuid_reads_simple_uuid_prefix() {
        let id = uuid::Uuid::new_v4();
        let name = format!("octolab_{}_evidence_user", id.simple());
        assert_eq!(extract_lab_uuid(&name), Some(id));
    }

    #[test]
    fn extract_lab_uuid_rejects_unrelated_volumes() {
        assert_eq!(extract_lab_uuid("some_other_volume"), None);
    }

    fn dummy_lab(owner: octolab_domain::OwnerId, status: LabStatus) -> octolab_domain::Lab {
        let mut lab = octolab_domain::Lab::new_requested(
            owner,
            octolab_domain::RecipeId(uuid::Uuid::new_v4()),
            octolab_domain::RuntimeKind::Compose,
            serde_json::Value::Null,
            Utc::now(),
        );
        lab.status = status;
        lab
    }

    #[tokio::test]
    async fn sweep_transitions_expired_ready_labs_to_ending() {
        let store: Arc<dyn StateStore> = Arc::new(octolab_store::InMemoryStore::new());
        let owner = octolab_domain::OwnerId(uuid::Uuid::new_v4());
        let mut lab = dummy_lab(owner, LabStatus::Ready);
        lab.expires_at = Some(Utc::now() - chrono::Duration::seconds(60));
        store.insert_lab(&lab).await.unwrap();

        let retention = RetentionJob::new(store.clone(), std::env::temp_dir());
        let job = GcJob::new(store.clone(), retention);

        let summary = job.run(false, false, 100).await.unwrap();
        assert_eq!(summary.expired_labs, 1);

        let reloaded = store.get_lab(&lab.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, LabStatus::Ending);
    }

    #[tokio::test]
    async fn dry_run_leaves_expired_labs_untouched() {
        let store: Arc<dyn StateStore> = Arc::new(octolab_store::InMemoryStore::new());
        let owner = octolab_domain::OwnerId(uuid::Uuid::new_v4());
        let mut lab = dummy_lab(owner, LabStatus::Ready);
        lab.expires_at = Some(Utc::now() - chrono::Duration::seconds(60));
        store.insert_lab(&lab).await.unwrap();

        let retention = RetentionJob::new(store.clone(), std::env::temp_dir());
        let job = GcJob::new(store.clone(), retention);

        let summary = job.run(true, false, 100).await.unwrap();
        assert_eq!(summary.expired_labs, 1);

        let reloaded = store.get_lab(&lab.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, LabStatus::Ready);
    }
}
