use std::sync::Arc;

use octolab_config::OctolabConfig;
use octolab_core::{DedupCache, Provisioner, RateLimiter};
use octolab_runtime::RuntimeRegistry;
use octolab_store::StateStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub registry: Arc<RuntimeRegistry>,
    pub provisioner: Arc<Provisioner>,
    pub rate_limiter: Arc<RateLimiter>,
    pub dedup: Arc<DedupCache>,
    pub config: Arc<OctolabConfig>,
}
