use std::sync::Arc;

use chrono::Utc;
use octolab_domain::{LabId, LabStatus, OwnerId};
use octolab_runtime::PortAllocator;
use octolab_store::StateStore;

use crate::error::CoreError;

/// Loads a lab scoped to its owner, returning a uniform `NotFound` both when
/// the row is absent and when it belongs to someone else — the same
/// anti-enumeration posture the Provisioner uses.
async fn load_owned(
    store: &Arc<dyn StateStore>,
    lab_id: LabId,
    owner_id: OwnerId,
) -> Result<octolab_domain::Lab, CoreError> {
    store
        .get_lab(&lab_id)
        .await?
        .filter(|l| l.owner_id == owner_id)
        .ok_or_else(|| CoreError::NotFound(lab_id.to_string()))
}

/// Transitions a `READY`/`DEGRADED` lab to `ENDING`, handing it off to the
/// Teardown Worker. Idempotent: already-`ENDING` (or otherwise terminal) is
/// reported as a no-op success rather than an error, since the caller's
/// intent — "stop this lab" — is already satisfied.
pub async fn terminate_lab(
    store: &Arc<dyn StateStore>,
    lab_id: LabId,
    owner_id: OwnerId,
) -> Result<(), CoreError> {
    let mut lab = load_owned(store, lab_id, owner_id).await?;

    if lab.status == LabStatus::Ending || lab.status.is_terminal() {
        return Ok(());
    }

    if !matches!(lab.status, LabStatus::Ready | LabStatus::Degraded) {
        return Err(CoreError::WrongState {
            lab_id: lab_id.to_string(),
            status: lab.status.to_string(),
        });
    }

    if lab.status.validate_transition(LabStatus::Ending)? {
        lab.status = LabStatus::Ending;
        lab.updated_at = Utc::now();
        store.update_lab(&lab).await?;
    }
    Ok(())
}

/// Allocates a port for a lab the caller owns. Thin tenant-scoping wrapper
/// around [`PortAllocator::allocate`], which itself is idempotent.
pub async fn allocate_port(
    store: &Arc<dyn StateStore>,
    ports: &PortAllocator,
    lab_id: LabId,
    owner_id: OwnerId,
) -> Result<u16, CoreError> {
    load_owned(store, lab_id, owner_id).await?;
    Ok(ports.allocate(&lab_id, &owner_id).await?)
}

/// Releases a lab's held port, tenant-scoped.
pub async fn release_port(
    store: &Arc<dyn StateStore>,
    ports: &PortAllocator,
    lab_id: LabId,
    owner_id: OwnerId,
) -> Result<bool, CoreError> {
    load_owned(store, lab_id, owner_id).await?;
    Ok(ports.release(&lab_id, Some(&owner_id)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use octolab_domain::{Lab, RecipeId, RuntimeKind};
    use octolab_store::InMemoryStore;
    use serde_json::Value;

    fn ready_lab(owner: OwnerId) -> Lab {
        let mut lab = Lab::new_requested(
            owner,
            RecipeId(uuid::Uuid::new_v4()),
            RuntimeKind::Compose,
            Value::Null,
            Utc::now(),
        );
        lab.status = LabStatus::Ready;
        lab
    }

    #[tokio::test]
    async fn terminate_moves_ready_lab_to_ending() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let owner = OwnerId(uuid::Uuid::new_v4());
        let lab = ready_lab(owner);
        store.insert_lab(&lab).await.unwrap();

        terminate_lab(&store, lab.id, owner).await.unwrap();

        let reloaded = store.get_lab(&lab.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, LabStatus::Ending);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_once_ending() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let owner = OwnerId(uuid::Uuid::new_v4());
        let lab = ready_lab(owner);
        store.insert_lab(&lab).await.unwrap();

        terminate_lab(&store, lab.id, owner).await.unwrap();
        terminate_lab(&store, lab.id, owner).await.unwrap();
    }

    #[tokio::test]
    async fn terminate_rejects_foreign_owner() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let owner = OwnerId(uuid::Uuid::new_v4());
        let stranger = OwnerId(uuid::Uuid::new_v4());
        let lab = ready_lab(owner);
        store.insert_lab(&lab).await.unwrap();

        let result = terminate_lab(&store, lab.id, stranger).await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }
}
