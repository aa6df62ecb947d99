use std::sync::{Arc, RwLock};

use octolab_config::{OctolabConfig, RuntimeSelector};

use crate::doctor::{assert_ready, run_doctor};
use crate::error::RuntimeError;
use crate::lab_runtime::LabRuntime;

/// Holds the three backend instances and dispatches to whichever is
/// currently active: the configured selector, or an in-memory admin
/// override. The override is never persisted — it resets to the
/// configured selector on restart, per the resolved admin-override Open
/// Question.
pub struct RuntimeRegistry {
    config: OctolabConfig,
    compose: Arc<dyn LabRuntime>,
    microvm: Arc<dyn LabRuntime>,
    noop: Arc<dyn LabRuntime>,
    active_override: RwLock<Option<RuntimeSelector>>,
}

impl RuntimeRegistry {
    /// Runs the Doctor for the configured selector at construction time.
    /// A FATAL result is a fatal startup error — there is no fallback to
    /// compose, ever.
    pub fn new(
        config: OctolabConfig,
        compose: Arc<dyn LabRuntime>,
        microvm: Arc<dyn LabRuntime>,
        noop: Arc<dyn LabRuntime>,
    ) -> Result<Self, RuntimeError> {
        assert_ready(config.runtime, &config)?;
        Ok(RuntimeRegistry {
            config,
            compose,
            microvm,
            noop,
            active_override: RwLock::new(None),
        })
    }

    pub fn active_selector(&self) -> RuntimeSelector {
        self.active_override
            .read()
            .expect("registry override lock poisoned")
            .unwrap_or(self.config.runtime)
    }

    pub fn active(&self) -> Arc<dyn LabRuntime> {
        match self.active_selector() {
            RuntimeSelector::Compose => Arc::clone(&self.compose),
            RuntimeSelector::Microvm => Arc::clone(&self.microvm),
            RuntimeSelector::Noop => Arc::clone(&self.noop),
        }
    }

    /// Switching to `microvm` re-runs the Doctor; a FATAL result rejects the
    /// switch with an explanation rather than applying it. Switching to
    /// `compose`, or clearing the override, is always permitted — compose
    /// has no device prerequisites.
    pub fn set_override(&self, selector: Option<RuntimeSelector>) -> Result<(), RuntimeError> {
        if selector == Some(RuntimeSelector::Microvm) {
            assert_ready(RuntimeSelector::Microvm, &self.config)?;
        }
        *self.active_override.write().expect("registry override lock poisoned") = selector;
        Ok(())
    }

    /// Called at lab-creation time. For microVM this re-runs the Doctor so
    /// a host that degraded after startup still fails the individual
    /// request (400 "not ready") instead of silently downgrading to
    /// another backend.
    pub fn assert_ready_for_lab(&self) -> Result<(), RuntimeError> {
        let selector = self.active_selector();
        if selector == RuntimeSelector::Microvm {
            assert_ready(selector, &self.config)?;
        }
        Ok(())
    }

    pub fn doctor_report(&self) -> crate::doctor::DoctorReport {
        run_doctor(self.active_selector(), &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noop::NoopRuntime;

    fn noop_config() -> OctolabConfig {
        std::env::set_var("OCTOLAB_RUNTIME", "noop");
        std::env::set_var("OCTOLAB_PORT_MIN", "20000");
        std::env::set_var("OCTOLAB_PORT_MAX", "21000");
        std::env::set_var("OCTOLAB_STARTUP_TIMEOUT_SECONDS", "120");
        std::env::set_var("OCTOLAB_TEARDOWN_TIMEOUT_SECONDS", "60");
        std::env::set_var("OCTOLAB_STATE_ROOT", "/var/lib/octolab");
        std::env::set_var("OCTOLAB_INTERNAL_TOKEN", "test-token");
        OctolabConfig::from_env().unwrap()
    }

    fn registry() -> RuntimeRegistry {
        let noop: Arc<dyn LabRuntime> = Arc::new(NoopRuntime::new());
        RuntimeRegistry::new(noop_config(), noop.clone(), noop.clone(), noop).unwrap()
    }

    #[test]
    fn defaults_to_configured_selector() {
        let registry = registry();
        assert_eq!(registry.active_selector(), RuntimeSelector::Noop);
    }

    #[test]
    fn clearing_override_is_always_permitted() {
        let registry = registry();
        registry.set_override(None).unwrap();
        assert_eq!(registry.active_selector(), RuntimeSelector::Noop);
    }

    #[test]
    fn switching_to_microvm_without_devices_is_rejected() {
        let registry = registry();
        assert!(registry.set_override(Some(RuntimeSelector::Microvm)).is_err());
        assert_eq!(registry.active_selector(), RuntimeSelector::Noop);
    }
}
