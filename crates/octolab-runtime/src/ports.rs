use std::sync::Arc;

use octolab_domain::{LabId, OwnerId};
use octolab_store::StateStore;
use rand::Rng;

use crate::error::RuntimeError;

const MAX_ALLOCATION_ATTEMPTS: u32 = 16;

/// Allocates `labs.novnc_host_port` values out of the configured range.
/// Holds no reservation state of its own — every allocation is a
/// conditional write straight to the store, which enforces exclusivity via
/// a SQL `UNIQUE` constraint (or the in-memory store's equivalent check).
pub struct PortAllocator {
    store: Arc<dyn StateStore>,
    port_min: u16,
    port_max: u16,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn StateStore>, port_min: u16, port_max: u16) -> Self {
        PortAllocator {
            store,
            port_min,
            port_max,
        }
    }

    /// Idempotent: if `lab_id` already holds a port, returns it unchanged.
    /// Otherwise tries up to [`MAX_ALLOCATION_ATTEMPTS`] random ports in
    /// `[port_min, port_max]`, relying on the store to reject collisions.
    pub async fn allocate(&self, lab_id: &LabId, owner_id: &OwnerId) -> Result<u16, RuntimeError> {
        if let Some(lab) = self.store.get_lab(lab_id).await? {
            if let Some(existing) = lab.novnc_host_port {
                return Ok(existing);
            }
        }

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let candidate = {
                let mut rng = rand::thread_rng();
                rng.gen_range(self.port_min..=self.port_max)
            };
            if self
                .store
                .try_allocate_port(lab_id, owner_id, candidate)
                .await?
            {
                return Ok(candidate);
            }
        }

        Err(RuntimeError::PortPoolExhausted {
            port_min: self.port_min,
            port_max: self.port_max,
        })
    }

    pub async fn release(
        &self,
        lab_id: &LabId,
        owner_id: Option<&OwnerId>,
    ) -> Result<bool, RuntimeError> {
        Ok(self.store.release_port(lab_id, owner_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octolab_domain::{Lab, RecipeId, RuntimeKind};
    use octolab_store::InMemoryStore;
    use serde_json::Value;

    fn dummy_lab(owner: OwnerId) -> Lab {
        Lab::new_requested(
            owner,
            RecipeId(uuid::Uuid::new_v4()),
            RuntimeKind::Compose,
            Value::Null,
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn allocate_is_idempotent_for_same_lab() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let owner = OwnerId(uuid::Uuid::new_v4());
        let lab = dummy_lab(owner);
        store.insert_lab(&lab).await.unwrap();

        let allocator = PortAllocator::new(store, 20000, 20010);
        let first = allocator.allocate(&lab.id, &owner).await.unwrap();
        let second = allocator.allocate(&lab.id, &owner).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn allocate_exhausts_a_single_port_pool() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let owner = OwnerId(uuid::Uuid::new_v4());
        let lab_a = dummy_lab(owner);
        let lab_b = dummy_lab(owner);
        store.insert_lab(&lab_a).await.unwrap();
        store.insert_lab(&lab_b).await.unwrap();

        let allocator = PortAllocator::new(store, 20000, 20000);
        allocator.allocate(&lab_a.id, &owner).await.unwrap();
        assert!(allocator.allocate(&lab_b.id, &owner).await.is_err());
    }

    #[tokio::test]
    async fn release_then_reallocate_succeeds() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let owner = OwnerId(uuid::Uuid::new_v4());
        let lab_a = dummy_lab(owner);
        let lab_b = dummy_lab(owner);
        store.insert_lab(&lab_a).await.unwrap();
        store.insert_lab(&lab_b).await.unwrap();

        let allocator = PortAllocator::new(store, 20000, 20000);
        allocator.allocate(&lab_a.id, &owner).await.unwrap();
        assert!(allocator.release(&lab_a.id, Some(&owner)).await.unwrap());
        let port = allocator.allocate(&lab_b.id, &owner).await.unwrap();
        assert_eq!(port, 20000);
    }
}
