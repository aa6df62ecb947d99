use std::path::{Path, PathBuf};

use octolab_config::{OctolabConfig, RuntimeSelector};
use octolab_hygiene::redact_path;
use serde::Serialize;

use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Fatal,
    Warn,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub severity: Severity,
    pub message: String,
    pub hint: Option<String>,
}

/// Aggregate result of [`run_doctor`]. `ok` is true iff every FATAL-severity
/// check passed — a failing WARN never blocks startup.
#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub ok: bool,
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    fn from_checks(checks: Vec<DoctorCheck>) -> Self {
        let ok = checks.iter().all(|c| c.severity != Severity::Fatal || c.ok);
        DoctorReport { ok, checks }
    }

    pub fn summary(&self) -> String {
        self.checks
            .iter()
            .filter(|c| !c.ok)
            .map(|c| format!("{}: {}", c.name, c.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn binary_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn check_compute_device() -> DoctorCheck {
    let device = Path::new("/dev/kvm");
    let ok = device.exists()
        && std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .is_ok();
    DoctorCheck {
        name: "compute_device".to_string(),
        ok,
        severity: Severity::Fatal,
        message: if ok {
            "kvm device available".to_string()
        } else {
            format!("{} missing or not openable read-write", redact_path("/dev/kvm"))
        },
        hint: (!ok).then(|| "enable nested virtualization or run on bare metal".to_string()),
    }
}

fn check_jailer(dev_unsafe_allow_no_jailer: bool) -> DoctorCheck {
    let found = binary_on_path("jailer").is_some();
    let severity = if dev_unsafe_allow_no_jailer {
        Severity::Warn
    } else {
        Severity::Fatal
    };
    DoctorCheck {
        name: "jailer".to_string(),
        ok: found,
        severity,
        message: if found {
            "jailer binary found on PATH".to_string()
        } else {
            "jailer binary not found on PATH".to_string()
        },
        hint: (!found && !dev_unsafe_allow_no_jailer)
            .then(|| "install firecracker's jailer or set OCTOLAB_DEV_UNSAFE_ALLOW_NO_JAILER=true for local dev".to_string()),
    }
}

fn check_path_exists(name: &str, path: &str) -> DoctorCheck {
    let ok = Path::new(path).exists();
    DoctorCheck {
        name: name.to_string(),
        ok,
        severity: Severity::Fatal,
        message: if ok {
            format!("{} present", redact_path(path))
        } else {
            format!("{} missing", redact_path(path))
        },
        hint: None,
    }
}

fn check_compose_cli() -> DoctorCheck {
    let found = binary_on_path("docker").is_some();
    DoctorCheck {
        name: "compose_cli".to_string(),
        ok: found,
        severity: Severity::Fatal,
        message: if found {
            "docker CLI found on PATH".to_string()
        } else {
            "docker CLI not found on PATH".to_string()
        },
        hint: (!found).then(|| "install Docker with the compose plugin".to_string()),
    }
}

/// Determine whether the host can run `selector` right now. Never panics;
/// every path-shaped field has already been passed through `redact_path`
/// before landing in the struct — the struct itself is a wire payload
/// (admin override endpoint), not just a log line.
pub fn run_doctor(selector: RuntimeSelector, config: &OctolabConfig) -> DoctorReport {
    let checks = match selector {
        RuntimeSelector::Noop => vec![DoctorCheck {
            name: "noop".to_string(),
            ok: true,
            severity: Severity::Warn,
            message: "noop backend performs no host checks".to_string(),
            hint: None,
        }],
        RuntimeSelector::Compose => vec![check_compose_cli()],
        RuntimeSelector::Microvm => {
            let state_root = Path::new(&config.state_root);
            vec![
                check_compute_device(),
                check_jailer(config.dev_unsafe_allow_no_jailer),
                check_path_exists("kernel_image", &format!("{}/vmlinux", config.state_root)),
                check_path_exists("rootfs_image", &format!("{}/rootfs.ext4", config.state_root)),
                DoctorCheck {
                    name: "state_dir".to_string(),
                    ok: state_root.exists(),
                    severity: Severity::Fatal,
                    message: if state_root.exists() {
                        "state root present".to_string()
                    } else {
                        format!("state root {} missing", redact_path(&config.state_root))
                    },
                    hint: None,
                },
                check_path_exists("vsock_device", "/dev/vsock"),
                check_path_exists("network_helper_socket", "/run/octolab/net-helper.sock"),
            ]
        }
    };
    DoctorReport::from_checks(checks)
}

/// Fatal-on-failure variant of [`run_doctor`], used at startup and before
/// admitting a lab to a backend. Never falls back to another backend —
/// the selected backend is either ready or startup fails outright.
pub fn assert_ready(selector: RuntimeSelector, config: &OctolabConfig) -> Result<(), RuntimeError> {
    let report = run_doctor(selector, config);
    if report.ok {
        Ok(())
    } else {
        Err(RuntimeError::DoctorFatal(report.summary()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_backend_always_passes() {
        let config = test_config();
        let report = run_doctor(RuntimeSelector::Noop, &config);
        assert!(report.ok);
    }

    #[test]
    fn warn_only_checks_do_not_block() {
        let checks = vec![DoctorCheck {
            name: "optional".to_string(),
            ok: false,
            severity: Severity::Warn,
            message: "missing but optional".to_string(),
            hint: None,
        }];
        let report = DoctorReport::from_checks(checks);
        assert!(report.ok);
    }

    #[test]
    fn any_fatal_failure_blocks() {
        let checks = vec![
            DoctorCheck {
                name: "a".to_string(),
                ok: true,
                severity: Severity::Fatal,
                message: "fine".to_string(),
                hint: None,
            },
            DoctorCheck {
                name: "b".to_string(),
                ok: false,
                severity: Severity::Fatal,
                message: "broken".to_string(),
                hint: None,
            },
        ];
        let report = DoctorReport::from_checks(checks);
        assert!(!report.ok);
    }

    fn test_config() -> OctolabConfig {
        std::env::set_var("OCTOLAB_RUNTIME", "noop");
        std::env::set_var("OCTOLAB_PORT_MIN", "20000");
        std::env::set_var("OCTOLAB_PORT_MAX", "21000");
        std::env::set_var("OCTOLAB_STARTUP_TIMEOUT_SECONDS", "120");
        std::env::set_var("OCTOLAB_TEARDOWN_TIMEOUT_SECONDS", "60");
        std::env::set_var("OCTOLAB_STATE_ROOT", "/var/lib/octolab");
        std::env::set_var("OCTOLAB_INTERNAL_TOKEN", "test-token");
        OctolabConfig::from_env().unwrap()
    }
}
