use async_trait::async_trait;
use octolab_domain::Lab;
use serde_json::Value;
use tracing::debug;

use crate::error::RuntimeError;
use crate::lab_runtime::{LabRuntime, LabSecrets, TeardownResult};

/// A stub backend for local development and tests. Performs no I/O and
/// always reports success; used by the `noop` runtime selector.
#[derive(Debug, Default, Clone)]
pub struct NoopRuntime;

impl NoopRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LabRuntime for NoopRuntime {
    async fn create_lab(
        &self,
        lab: &Lab,
        _recipe: &Value,
        secrets: &LabSecrets,
    ) -> Result<(), RuntimeError> {
        debug!(
            lab_id = %lab.id,
            has_vnc_password = secrets.vnc_password.is_some(),
            "NoopRuntime: create_lab"
        );
        Ok(())
    }

    async fn destroy_lab(&self, lab: &Lab) -> Result<TeardownResult, RuntimeError> {
        debug!(lab_id = %lab.id, "NoopRuntime: destroy_lab");
        Ok(TeardownResult::clean())
    }

    async fn resources_exist_for_lab(&self, _lab: &Lab) -> Result<bool, RuntimeError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octolab_domain::{OwnerId, RecipeId, RuntimeKind};

    fn dummy_lab() -> Lab {
        Lab::new_requested(
            OwnerId(uuid::Uuid::new_v4()),
            RecipeId(uuid::Uuid::new_v4()),
            RuntimeKind::Compose,
            Value::Null,
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn create_and_destroy_always_succeed() {
        let runtime = NoopRuntime::new();
        let lab = dummy_lab();
        runtime
            .create_lab(&lab, &Value::Null, &LabSecrets::default())
            .await
            .unwrap();
        let result = runtime.destroy_lab(&lab).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn resources_never_exist() {
        let runtime = NoopRuntime::new();
        let lab = dummy_lab();
        assert!(!runtime.resources_exist_for_lab(&lab).await.unwrap());
    }
}
