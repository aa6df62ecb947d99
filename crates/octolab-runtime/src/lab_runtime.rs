use async_trait::async_trait;
use octolab_domain::Lab;
use serde::Serialize;
use serde_json::Value;

use crate::error::RuntimeError;

/// Credentials and other opaque bytes a backend needs to provision a lab
/// but the core never inspects. Never logged in full — a backend may log
/// presence (`vnc_password.is_some()`) but never the value itself.
#[derive(Debug, Clone, Default)]
pub struct LabSecrets {
    pub vnc_password: Option<String>,
}

/// Outcome of a teardown attempt. `success` is honest: it is true only if
/// the backend re-verified that no containers/processes and no networks
/// remain for this lab, not merely that the teardown command exited zero.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TeardownResult {
    pub success: bool,
    pub containers_remaining: u32,
    pub networks_remaining: u32,
}

impl TeardownResult {
    pub fn clean() -> Self {
        TeardownResult {
            success: true,
            containers_remaining: 0,
            networks_remaining: 0,
        }
    }
}

/// Capability contract every runtime backend implements. Narrowed to
/// exactly the three operations the core ever calls on a backend — recipe
/// interpretation, secret resolution, and everything above this boundary
/// stays in the provisioner's hands.
#[async_trait]
pub trait LabRuntime: Send + Sync + 'static {
    /// Idempotent per lab id: retrying a partially-created lab either
    /// succeeds or raises an error the caller pairs with a `destroy_lab`
    /// cleanup attempt.
    async fn create_lab(
        &self,
        lab: &Lab,
        recipe: &Value,
        secrets: &LabSecrets,
    ) -> Result<(), RuntimeError>;

    /// Best-effort teardown. Never raises on "already gone".
    async fn destroy_lab(&self, lab: &Lab) -> Result<TeardownResult, RuntimeError>;

    /// Cheap existence probe used by reconciliation to skip a destroy call
    /// for a lab whose resources are already gone.
    async fn resources_exist_for_lab(&self, lab: &Lab) -> Result<bool, RuntimeError>;
}
