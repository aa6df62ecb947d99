use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octolab_domain::{EvidenceEvent, Lab, LabId, LabStatus, OwnerId, SubprocessRun};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::StateStore;

#[derive(Debug, Default)]
struct Inner {
    labs: HashMap<LabId, Lab>,
    events: HashMap<String, EvidenceEvent>,
    subprocess_runs: HashMap<(LabId, uuid::Uuid), SubprocessRun>,
}

/// In-memory implementation of [`StateStore`]. All data is lost on process
/// exit. Used by tests and the `noop` runtime's local-dev path.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get_lab(&self, id: &LabId) -> Result<Option<Lab>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.labs.get(id).cloned())
    }

    async fn list_labs_by_owner(&self, owner_id: &OwnerId) -> Result<Vec<Lab>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .labs
            .values()
            .filter(|l| &l.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn insert_lab(&self, lab: &Lab) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.labs.insert(lab.id, lab.clone());
        Ok(())
    }

    async fn update_lab(&self, lab: &Lab) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.labs.contains_key(&lab.id) {
            return Err(StoreError::LabNotFound(lab.id.to_string()));
        }
        guard.labs.insert(lab.id, lab.clone());
        Ok(())
    }

    async fn list_all_lab_ids(&self) -> Result<Vec<LabId>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.labs.keys().cloned().collect())
    }

    async fn list_expirable_labs(&self, now: DateTime<Utc>) -> Result<Vec<Lab>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .labs
            .values()
            .filter(|l| {
                matches!(l.status, LabStatus::Ready | LabStatus::Degraded)
                    && l.expires_at.is_some_and(|t| t <= now)
            })
            .cloned()
            .collect())
    }

    async fn claim_ending_labs(&self, batch_size: u32) -> Result<Vec<Lab>, StoreError> {
        let guard = self.inner.read().await;
        let mut labs: Vec<Lab> = guard
            .labs
            .values()
            .filter(|l| l.status == LabStatus::Ending)
            .cloned()
            .collect();
        labs.sort_by_key(|l| l.updated_at);
        labs.truncate(batch_size as usize);
        Ok(labs)
    }

    async fn claim_stuck_ending_labs(
        &self,
        stuck_since: DateTime<Utc>,
        max_labs: u32,
    ) -> Result<Vec<Lab>, StoreError> {
        let guard = self.inner.read().await;
        let mut labs: Vec<Lab> = guard
            .labs
            .values()
            .filter(|l| l.status == LabStatus::Ending && l.updated_at < stuck_since)
            .cloned()
            .collect();
        labs.sort_by_key(|l| l.updated_at);
        labs.truncate(max_labs as usize);
        Ok(labs)
    }

    async fn list_labs_for_retention(
        &self,
        now: DateTime<Utc>,
        max_labs: u32,
    ) -> Result<Vec<Lab>, StoreError> {
        let guard = self.inner.read().await;
        let mut labs: Vec<Lab> = guard
            .labs
            .values()
            .filter(|l| {
                l.evidence_purged_at.is_none()
                    && l.evidence_expires_at.is_some_and(|t| t <= now)
            })
            .cloned()
            .collect();
        labs.sort_by_key(|l| l.evidence_expires_at);
        labs.truncate(max_labs as usize);
        Ok(labs)
    }

    async fn try_allocate_port(
        &self,
        lab_id: &LabId,
        owner_id: &OwnerId,
        port: u16,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let port_taken = guard.labs.values().any(|l| l.novnc_host_port == Some(port));
        if port_taken {
            return Ok(false);
        }
        let Some(lab) = guard.labs.get_mut(lab_id) else {
            return Ok(false);
        };
        if lab.owner_id != *owner_id || lab.novnc_host_port.is_some() {
            return Ok(false);
        }
        lab.novnc_host_port = Some(port);
        Ok(true)
    }

    async fn release_port(
        &self,
        lab_id: &LabId,
        owner_id: Option<&OwnerId>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let Some(lab) = guard.labs.get_mut(lab_id) else {
            return Ok(false);
        };
        if let Some(owner_id) = owner_id {
            if lab.owner_id != *owner_id {
                return Ok(false);
            }
        }
        if lab.novnc_host_port.take().is_some() {
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn append_evidence_event(&self, event: &EvidenceEvent) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        if guard.events.contains_key(&event.event_hash) {
            return Ok(false);
        }
        guard.events.insert(event.event_hash.clone(), event.clone());
        Ok(true)
    }

    async fn list_evidence_events(&self, lab_id: &LabId) -> Result<Vec<EvidenceEvent>, StoreError> {
        let guard = self.inner.read().await;
        let mut events: Vec<EvidenceEvent> = guard
            .events
            .values()
            .filter(|e| &e.lab_id == lab_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn upsert_subprocess_run(&self, run: &SubprocessRun) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.subprocess_runs.insert((run.lab_id, run.id), run.clone());
        Ok(())
    }

    async fn list_subprocess_runs(&self, lab_id: &LabId) -> Result<Vec<SubprocessRun>, StoreError> {
        let guard = self.inner.read().await;
        let mut runs: Vec<SubprocessRun> = guard
            .subprocess_runs
            .values()
            .filter(|r| &r.lab_id == lab_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octolab_domain::{RecipeId, RuntimeKind};
    use serde_json::Value;

    fn dummy_lab(owner: OwnerId) -> Lab {
        Lab::new_requested(
            owner,
            RecipeId(uuid::Uuid::new_v4()),
            RuntimeKind::Compose,
            Value::Null,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryStore::new();
        let lab = dummy_lab(OwnerId(uuid::Uuid::new_v4()));
        store.insert_lab(&lab).await.unwrap();

        let got = store.get_lab(&lab.id).await.unwrap();
        assert_eq!(got.unwrap().id, lab.id);
    }

    #[tokio::test]
    async fn update_missing_lab_errors() {
        let store = InMemoryStore::new();
        let lab = dummy_lab(OwnerId(uuid::Uuid::new_v4()));
        assert!(store.update_lab(&lab).await.is_err());
    }

    #[tokio::test]
    async fn list_by_owner_filters() {
        let store = InMemoryStore::new();
        let owner_a = OwnerId(uuid::Uuid::new_v4());
        let owner_b = OwnerId(uuid::Uuid::new_v4());
        store.insert_lab(&dummy_lab(owner_a)).await.unwrap();
        store.insert_lab(&dummy_lab(owner_a)).await.unwrap();
        store.insert_lab(&dummy_lab(owner_b)).await.unwrap();

        let for_a = store.list_labs_by_owner(&owner_a).await.unwrap();
        assert_eq!(for_a.len(), 2);
    }

    #[tokio::test]
    async fn port_allocation_is_exclusive() {
        let store = InMemoryStore::new();
        let owner_a = OwnerId(uuid::Uuid::new_v4());
        let owner_b = OwnerId(uuid::Uuid::new_v4());
        let lab_a = dummy_lab(owner_a);
        let lab_b = dummy_lab(owner_b);
        store.insert_lab(&lab_a).await.unwrap();
        store.insert_lab(&lab_b).await.unwrap();

        assert!(store
            .try_allocate_port(&lab_a.id, &owner_a, 20500)
            .await
            .unwrap());
        assert!(!store
            .try_allocate_port(&lab_b.id, &owner_b, 20500)
            .await
            .unwrap());

        assert!(store.release_port(&lab_a.id, Some(&owner_a)).await.unwrap());
        assert!(!store.release_port(&lab_a.id, Some(&owner_a)).await.unwrap());
        assert!(store
            .try_allocate_port(&lab_b.id, &owner_b, 20500)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn evidence_event_append_is_idempotent_on_hash() {
        let store = InMemoryStore::new();
        let event = EvidenceEvent {
            event_hash: "hash-1".to_string(),
            lab_id: LabId::generate(),
            event_type: "container.started".to_string(),
            container_name: Some("vnc".to_string()),
            timestamp: Utc::now(),
            payload: Value::Null,
        };
        assert!(store.append_evidence_event(&event).await.unwrap());
        assert!(!store.append_evidence_event(&event).await.unwrap());
    }

    #[tokio::test]
    async fn claim_ending_labs_only_returns_ending() {
        let store = InMemoryStore::new();
        let mut lab = dummy_lab(OwnerId(uuid::Uuid::new_v4()));
        lab.status = LabStatus::Ending;
        store.insert_lab(&lab).await.unwrap();
        store.insert_lab(&dummy_lab(OwnerId(uuid::Uuid::new_v4()))).await.unwrap();

        let claimed = store.claim_ending_labs(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, LabStatus::Ending);
    }
}
