use crate::error::ConfigError;
use crate::raw;

/// Which backend drives lab lifecycle operations. `Noop` exists for local
/// development and tests — it accepts create/destroy calls and reports
/// resources present, without shelling out to anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSelector {
    Compose,
    Microvm,
    Noop,
}

impl std::str::FromStr for RuntimeSelector {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compose" => Ok(RuntimeSelector::Compose),
            "microvm" => Ok(RuntimeSelector::Microvm),
            "noop" => Ok(RuntimeSelector::Noop),
            other => Err(ConfigError::Invalid {
                key: "OCTOLAB_RUNTIME".to_string(),
                message: format!("'{other}' is not one of compose, microvm, noop"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TeardownWorkerConfig {
    pub enabled: bool,
    pub interval_seconds: u32,
    pub batch_size: u32,
    pub startup_tick: bool,
}

#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub gating_enabled: bool,
    pub paths: Vec<String>,
    pub timeout_seconds: u32,
    pub interval_seconds: u32,
}

/// The fully validated, server-wide configuration. Loaded once at startup
/// by each binary; never re-read afterward. Every range invariant from
/// spec §6.1 is enforced here so a misconfigured deployment fails fast
/// instead of behaving unpredictably at runtime.
#[derive(Debug, Clone)]
pub struct OctolabConfig {
    pub runtime: RuntimeSelector,
    pub port_min: u16,
    pub port_max: u16,
    pub startup_timeout_seconds: u32,
    pub teardown_timeout_seconds: u32,
    pub teardown_worker: TeardownWorkerConfig,
    pub readiness: ReadinessConfig,
    pub evidence_retention_days: u32,
    pub evidence_retention_hours: u32,
    pub state_root: String,
    pub dev_unsafe_allow_no_jailer: bool,
    pub rate_limit_per_lab_per_minute: u32,
    pub dedup_ttl_seconds: u32,
    pub internal_token: String,
    pub slack_webhook_url: Option<String>,
    pub discord_webhook_url: Option<String>,
}

impl OctolabConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let runtime: RuntimeSelector = raw::required("OCTOLAB_RUNTIME")?.parse()?;

        let port_min = raw::required_u16("OCTOLAB_PORT_MIN")?;
        let port_max = raw::required_u16("OCTOLAB_PORT_MAX")?;
        if port_min < 1024 || port_max > 65535 || port_min >= port_max {
            return Err(ConfigError::Invalid {
                key: "OCTOLAB_PORT_MIN/OCTOLAB_PORT_MAX".to_string(),
                message: format!(
                    "expected 1024 <= port_min < port_max <= 65535, got {port_min}..{port_max}"
                ),
            });
        }

        let startup_timeout_seconds = raw::required_u32("OCTOLAB_STARTUP_TIMEOUT_SECONDS")?;
        if !(30..=600).contains(&startup_timeout_seconds) {
            return Err(ConfigError::Invalid {
                key: "OCTOLAB_STARTUP_TIMEOUT_SECONDS".to_string(),
                message: format!(
                    "expected 30..=600, got {startup_timeout_seconds}"
                ),
            });
        }

        let teardown_timeout_seconds = raw::required_u32("OCTOLAB_TEARDOWN_TIMEOUT_SECONDS")?;

        let teardown_worker = TeardownWorkerConfig {
            enabled: raw::bool_with_default("OCTOLAB_TEARDOWN_WORKER_ENABLED", true)?,
            interval_seconds: raw::u32_with_default(
                "OCTOLAB_TEARDOWN_WORKER_INTERVAL_SECONDS",
                15,
            )?,
            batch_size: raw::u32_with_default("OCTOLAB_TEARDOWN_WORKER_BATCH_SIZE", 10)?,
            startup_tick: raw::bool_with_default("OCTOLAB_TEARDOWN_WORKER_STARTUP_TICK", true)?,
        };

        let readiness = ReadinessConfig {
            gating_enabled: raw::bool_with_default("OCTOLAB_READINESS_GATING_ENABLED", true)?,
            paths: raw::string_list("OCTOLAB_READINESS_PATHS"),
            timeout_seconds: raw::u32_with_default("OCTOLAB_READINESS_TIMEOUT_SECONDS", 30)?,
            interval_seconds: raw::u32_with_default("OCTOLAB_READINESS_INTERVAL_SECONDS", 2)?,
        };

        let evidence_retention_days = raw::u32_with_default("OCTOLAB_EVIDENCE_RETENTION_DAYS", 1)?;
        let evidence_retention_hours =
            raw::u32_with_default("OCTOLAB_EVIDENCE_RETENTION_HOURS", 0)?;

        let state_root = raw::required("OCTOLAB_STATE_ROOT")?;
        if !state_root.starts_with('/') {
            return Err(ConfigError::Invalid {
                key: "OCTOLAB_STATE_ROOT".to_string(),
                message: "must be an absolute path".to_string(),
            });
        }

        let dev_unsafe_allow_no_jailer =
            raw::bool_with_default("OCTOLAB_DEV_UNSAFE_ALLOW_NO_JAILER", false)?;

        let rate_limit_per_lab_per_minute =
            raw::u32_with_default("OCTOLAB_RATE_LIMIT_PER_LAB_PER_MINUTE", 30)?;
        let dedup_ttl_seconds = raw::u32_with_default("OCTOLAB_DEDUP_TTL_SECONDS", 300)?;

        let internal_token = raw::required("OCTOLAB_INTERNAL_TOKEN")?;

        Ok(OctolabConfig {
            runtime,
            port_min,
            port_max,
            startup_timeout_seconds,
            teardown_timeout_seconds,
            teardown_worker,
            readiness,
            evidence_retention_days,
            evidence_retention_hours,
            state_root,
            dev_unsafe_allow_no_jailer,
            rate_limit_per_lab_per_minute,
            dedup_ttl_seconds,
            internal_token,
            slack_webhook_url: raw::optional("OCTOLAB_SLACK_WEBHOOK_URL"),
            discord_webhook_url: raw::optional("OCTOLAB_DISCORD_WEBHOOK_URL"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_minimal_env() {
        std::env::set_var("OCTOLAB_RUNTIME", "noop");
        std::env::set_var("OCTOLAB_PORT_MIN", "20000");
        std::env::set_var("OCTOLAB_PORT_MAX", "21000");
        std::env::set_var("OCTOLAB_STARTUP_TIMEOUT_SECONDS", "120");
        std::env::set_var("OCTOLAB_TEARDOWN_TIMEOUT_SECONDS", "60");
        std::env::set_var("OCTOLAB_STATE_ROOT", "/var/lib/octolab");
        std::env::set_var("OCTOLAB_INTERNAL_TOKEN", "test-token");
    }

    #[test]
    fn loads_minimal_valid_config() {
        set_minimal_env();
        let cfg = OctolabConfig::from_env().unwrap();
        assert_eq!(cfg.runtime, RuntimeSelector::Noop);
        assert_eq!(cfg.port_min, 20000);
        assert!(cfg.teardown_worker.enabled);
    }

    #[test]
    fn rejects_startup_timeout_out_of_range() {
        set_minimal_env();
        std::env::set_var("OCTOLAB_STARTUP_TIMEOUT_SECONDS", "10");
        assert!(OctolabConfig::from_env().is_err());
        std::env::set_var("OCTOLAB_STARTUP_TIMEOUT_SECONDS", "120");
    }

    #[test]
    fn rejects_inverted_port_range() {
        set_minimal_env();
        std::env::set_var("OCTOLAB_PORT_MIN", "30000");
        std::env::set_var("OCTOLAB_PORT_MAX", "20000");
        assert!(OctolabConfig::from_env().is_err());
        std::env::set_var("OCTOLAB_PORT_MIN", "20000");
        std::env::set_var("OCTOLAB_PORT_MAX", "21000");
    }

    #[test]
    fn rejects_unknown_runtime_selector() {
        set_minimal_env();
        std::env::set_var("OCTOLAB_RUNTIME", "bogus");
        assert!(OctolabConfig::from_env().is_err());
        std::env::set_var("OCTOLAB_RUNTIME", "noop");
    }
}
