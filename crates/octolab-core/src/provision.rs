use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use octolab_config::OctolabConfig;
use octolab_domain::{Lab, LabId, LabStatus, OwnerId, RecipeId};
use octolab_runtime::{LabSecrets, PortAllocator, RuntimeRegistry};
use octolab_store::StateStore;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::CoreError;

/// Recipe lookup is a neighbour concern (recipe authoring/versioning lives
/// outside this core); the provisioner only needs to resolve one opaque
/// JSON document per `RecipeId`.
#[async_trait]
pub trait RecipeSource: Send + Sync + 'static {
    async fn load_recipe(&self, recipe_id: RecipeId) -> Result<Option<Value>, CoreError>;
}

/// Drives a single lab from REQUESTED/PROVISIONING through to READY or
/// FAILED. One call handles one lab — there is no whole-graph diff here,
/// unlike a reconcile loop that owns a tree of dependent resources.
pub struct Provisioner {
    store: Arc<dyn StateStore>,
    ports: PortAllocator,
    registry: Arc<RuntimeRegistry>,
    recipes: Arc<dyn RecipeSource>,
    config: OctolabConfig,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn StateStore>,
        ports: PortAllocator,
        registry: Arc<RuntimeRegistry>,
        recipes: Arc<dyn RecipeSource>,
        config: OctolabConfig,
    ) -> Self {
        Provisioner {
            store,
            ports,
            registry,
            recipes,
            config,
        }
    }

    /// Runs the whole pipeline under a hard outer timeout. Subprocess calls
    /// made by the selected backend are themselves bounded, so cancellation
    /// stays observable within one subprocess tick rather than hanging
    /// until the backend gives up.
    pub async fn provision_lab(&self, lab_id: LabId, owner_id: OwnerId) -> Result<(), CoreError> {
        let timeout = Duration::from_secs(self.config.startup_timeout_seconds as u64);
        match tokio::time::timeout(timeout, self.provision_inner(lab_id, owner_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%lab_id, "provisioning timed out, marking lab failed");
                if let Some(lab) = self.store.get_lab(&lab_id).await? {
                    self.fail(lab, "provisioning-timeout").await?;
                }
                Err(CoreError::ProvisioningTimeout(
                    self.config.startup_timeout_seconds as u64,
                ))
            }
        }
    }

    async fn provision_inner(&self, lab_id: LabId, owner_id: OwnerId) -> Result<(), CoreError> {
        let mut lab = self
            .store
            .get_lab(&lab_id)
            .await?
            .filter(|l| l.owner_id == owner_id)
            .ok_or_else(|| CoreError::NotFound(lab_id.to_string()))?;

        if !matches!(lab.status, LabStatus::Requested | LabStatus::Provisioning) {
            return Err(CoreError::WrongState {
                lab_id: lab_id.to_string(),
                status: lab.status.to_string(),
            });
        }

        if lab.status.validate_transition(LabStatus::Provisioning)? {
            lab.status = LabStatus::Provisioning;
            lab.updated_at = Utc::now();
            self.store.update_lab(&lab).await?;
        }

        let recipe = match self.recipes.load_recipe(lab.recipe_id).await? {
            Some(recipe) => recipe,
            None => return self.fail(lab, "recipe-missing").await,
        };

        let port = match self.ports.allocate(&lab.id, &owner_id).await {
            Ok(port) => port,
            Err(e) => return self.fail(lab, &format!("port-pool-exhausted: {e}")).await,
        };
        lab.novnc_host_port = Some(port);
        lab.updated_at = Utc::now();
        self.store.update_lab(&lab).await?;

        if let Err(e) = self.registry.assert_ready_for_lab() {
            return self.fail(lab, &format!("backend-not-ready: {e}")).await;
        }

        let backend = self.registry.active();
        let secrets = LabSecrets::default();
        if let Err(e) = backend.create_lab(&lab, &recipe, &secrets).await {
            return self.fail(lab, &format!("backend-command-failure: {e}")).await;
        }

        if self.config.readiness.gating_enabled {
            if let Err(e) = self.wait_for_readiness(port).await {
                return self.fail(lab, &format!("{e}")).await;
            }
        }

        lab.connection_url = Some(format!("http://127.0.0.1:{port}/vnc.html"));
        lab.status = LabStatus::Ready;
        lab.updated_at = Utc::now();
        self.store.update_lab(&lab).await?;
        info!(lab_id = %lab.id, "lab provisioned");
        Ok(())
    }

    /// Diagnostics are collected and attached to the internal log only;
    /// never returned to the client verbatim.
    async fn fail(&self, mut lab: Lab, reason: &str) -> Result<(), CoreError> {
        warn!(lab_id = %lab.id, reason, "provisioning failed, rolling back");
        let _ = self.registry.active().destroy_lab(&lab).await;
        let _ = self.ports.release(&lab.id, Some(&lab.owner_id)).await;
        lab.status = LabStatus::Failed;
        lab.finished_at = Some(Utc::now());
        lab.updated_at = Utc::now();
        self.store.update_lab(&lab).await?;
        Err(CoreError::Internal(reason.to_string()))
    }

    /// TCP connect + HTTP GET of each configured path, polled until the
    /// first success or the probe timeout. 200 and 302 both count as ready.
    async fn wait_for_readiness(&self, port: u16) -> Result<(), CoreError> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.readiness.timeout_seconds as u64);
        let interval = Duration::from_secs(self.config.readiness.interval_seconds as u64);
        let client = reqwest::Client::new();

        loop {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                for path in &self.config.readiness.paths {
                    let url = format!("http://127.0.0.1:{port}{path}");
                    if let Ok(resp) = client.get(&url).send().await {
                        let status = resp.status().as_u16();
                        if status == 200 || status == 302 {
                            return Ok(());
                        }
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::Internal(
                    "readiness probe timed out".to_string(),
                ));
            }
            tokio::time::sleep(interval).await;
        }
    }
}
