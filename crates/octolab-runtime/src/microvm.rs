use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use octolab_domain::Lab;
use octolab_hygiene::{redact_path, resolve_under_base, rmtree_hardened, safe_mkdir};
use octolab_store::StateStore;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rand::RngCore;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::lab_runtime::{LabRuntime, LabSecrets, TeardownResult};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn lab_dir_name(lab: &Lab) -> String {
    format!("lab_{}", lab.id.as_uuid())
}

/// Deterministic, `IFNAMSIZ`-safe tap device name so destroy can find and
/// remove it by name alone without consulting any other state.
fn tap_device_name(lab: &Lab) -> String {
    format!("oct{}", &lab.id.as_uuid().simple().to_string()[..9])
}

/// NAT rule comment used both to create and to later locate-and-remove
/// exactly this lab's iptables rule, nothing else.
fn nat_comment(lab: &Lab) -> String {
    let id = lab.id.as_uuid().simple().to_string();
    format!("octolab_{}", &id[id.len() - 12..])
}

/// Runs each lab as its own Firecracker microVM, jailed when available.
/// Every path this backend touches is built through `octolab_hygiene` so a
/// malformed lab id can never become a traversal primitive.
pub struct MicrovmRuntime {
    store: Arc<dyn StateStore>,
    state_root: PathBuf,
    base_rootfs: PathBuf,
    kernel_image: PathBuf,
    startup_timeout: Duration,
    teardown_timeout: Duration,
    allow_no_jailer: bool,
}

impl MicrovmRuntime {
    pub fn new(
        store: Arc<dyn StateStore>,
        state_root: PathBuf,
        base_rootfs: PathBuf,
        kernel_image: PathBuf,
        startup_timeout_seconds: u32,
        teardown_timeout_seconds: u32,
        allow_no_jailer: bool,
    ) -> Self {
        MicrovmRuntime {
            store,
            state_root,
            base_rootfs,
            kernel_image,
            startup_timeout: Duration::from_secs(startup_timeout_seconds as u64),
            teardown_timeout: Duration::from_secs(teardown_timeout_seconds as u64),
            allow_no_jailer,
        }
    }

    fn lab_dir(&self, lab: &Lab) -> Result<PathBuf, RuntimeError> {
        let relative = PathBuf::from(lab_dir_name(lab));
        Ok(resolve_under_base(&self.state_root, &relative)?)
    }

    fn socket_path(dir: &Path) -> PathBuf {
        dir.join("firecracker.sock")
    }
    fn rootfs_path(dir: &Path) -> PathBuf {
        dir.join("rootfs.ext4")
    }
    fn log_path(dir: &Path) -> PathBuf {
        dir.join("firecracker.log")
    }
    fn metrics_path(dir: &Path) -> PathBuf {
        dir.join("firecracker.metrics")
    }
    fn token_path(dir: &Path) -> PathBuf {
        dir.join(".token")
    }
    fn pid_path(dir: &Path) -> PathBuf {
        dir.join("firecracker.pid")
    }

    async fn jailer_available(&self) -> bool {
        Command::new("jailer")
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .is_ok()
    }

    async fn spawn_vm(&self, lab: &Lab, dir: &Path) -> Result<u32, RuntimeError> {
        let use_jailer = self.jailer_available().await;
        if !use_jailer && !self.allow_no_jailer {
            return Err(RuntimeError::ProvisionFailed(
                "jailer unavailable and OCTOLAB_DEV_UNSAFE_ALLOW_NO_JAILER is not set".to_string(),
            ));
        }

        let binary = if use_jailer { "jailer" } else { "firecracker" };
        let socket = Self::socket_path(dir);

        let mut cmd = Command::new(binary);
        cmd.args(["--api-sock", &socket.to_string_lossy()])
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env_clear()
            .env("LAB_ID", lab.id.to_string());

        let child = cmd
            .spawn()
            .map_err(|e| RuntimeError::ProvisionFailed(format!("spawn {binary}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| RuntimeError::ProvisionFailed("child exited immediately".to_string()))?;

        // Detach: the process is supervised by its own state dir (pid file,
        // socket) from here on, not by holding the `Child` handle — dropping
        // it does not kill the process since `kill_on_drop` is never set.
        drop(child);

        tokio::fs::write(Self::pid_path(dir), pid.to_string())
            .await
            .map_err(|e| RuntimeError::Internal(format!("write pid file: {e}")))?;

        Ok(pid)
    }

    async fn configure_network(&self, lab: &Lab) -> Result<(), RuntimeError> {
        let tap = tap_device_name(lab);
        let comment = nat_comment(lab);

        let tap_status = Command::new("ip")
            .args(["tuntap", "add", "dev", &tap, "mode", "tap"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if !matches!(tap_status, Ok(s) if s.success()) {
            return Err(RuntimeError::ProvisionFailed(format!(
                "failed to create tap device {tap}"
            )));
        }

        let nat_status = Command::new("iptables")
            .args([
                "-t", "nat", "-A", "POSTROUTING", "-o", &tap, "-j", "MASQUERADE",
                "-m", "comment", "--comment", &comment,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if !matches!(nat_status, Ok(s) if s.success()) {
            warn!(lab_id = %lab.id, "failed to install NAT rule for microvm network");
        }
        Ok(())
    }

    async fn wait_for_readiness(&self, dir: &Path) -> Result<(), RuntimeError> {
        let socket = Self::socket_path(dir);
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        while tokio::time::Instant::now() < deadline {
            if socket.exists() {
                return Ok(());
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
        Err(RuntimeError::ProvisionFailed(
            "guest agent readiness handshake timed out".to_string(),
        ))
    }

    async fn remove_tap_device(lab: &Lab) {
        let tap = tap_device_name(lab);
        let _ = Command::new("ip")
            .args(["link", "delete", &tap])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }

    async fn remove_nat_rule(&self, lab: &Lab) {
        let comment = nat_comment(lab);
        let list = Command::new("iptables")
            .args(["-t", "nat", "-S", "POSTROUTING"])
            .stdin(Stdio::null())
            .output()
            .await;
        let Ok(output) = list else { return };
        let text = String::from_utf8_lossy(&output.stdout);
        for line in text.lines() {
            if line.contains(&comment) {
                let args: Vec<&str> = line.split_whitespace().skip(1).collect();
                let mut del_args = vec!["-t", "nat", "-D", "POSTROUTING"];
                del_args.extend(args.iter().skip(1));
                let _ = Command::new("iptables")
                    .args(&del_args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
            }
        }
    }

    async fn graceful_shutdown(&self, pid: Option<u32>) -> bool {
        let Some(pid) = pid else { return true };
        if !process_alive(pid) {
            return true;
        }
        send_signal(pid, Signal::SIGTERM);
        let deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        false
    }

    async fn force_kill(pid: Option<u32>) {
        if let Some(pid) = pid {
            send_signal(pid, Signal::SIGKILL);
        }
    }

    async fn read_pid(dir: &Path) -> Option<u32> {
        let raw = tokio::fs::read_to_string(Self::pid_path(dir)).await.ok()?;
        raw.trim().parse().ok()
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// `/proc/<pid>` is cheaper than a signal-0 probe for liveness, so `kill`
/// here is only ever used to actually deliver a signal.
fn send_signal(pid: u32, signal: Signal) {
    let _ = kill(Pid::from_raw(pid as i32), signal);
}

#[async_trait]
impl LabRuntime for MicrovmRuntime {
    async fn create_lab(
        &self,
        lab: &Lab,
        _recipe: &Value,
        _secrets: &LabSecrets,
    ) -> Result<(), RuntimeError> {
        let dir = self.lab_dir(lab)?;

        // Idempotent: a prior partial attempt may have left the dir and pid
        // file behind. If the VM is already up, treat this as success.
        if let Some(pid) = Self::read_pid(&dir).await {
            if process_alive(pid) && Self::socket_path(&dir).exists() {
                return Ok(());
            }
        }

        safe_mkdir(&dir, 0o700)?;
        tokio::fs::copy(&self.base_rootfs, Self::rootfs_path(&dir))
            .await
            .map_err(|e| RuntimeError::ProvisionFailed(format!("stage rootfs: {e}")))?;
        let _ = &self.kernel_image;

        let pid = self.spawn_vm(lab, &dir).await?;

        let mut token_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_bytes);
        let token = hex_encode(&token_bytes);
        tokio::fs::write(Self::token_path(&dir), &token)
            .await
            .map_err(|e| RuntimeError::Internal(format!("write token: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(
                Self::token_path(&dir),
                std::fs::Permissions::from_mode(0o600),
            )
            .await;
        }

        self.configure_network(lab).await?;
        self.wait_for_readiness(&dir).await?;

        let mut lab = lab.clone();
        lab.runtime_meta.insert(
            "microvm".to_string(),
            json!({
                "pid": pid,
                "socket": redact_path(&Self::socket_path(&dir).to_string_lossy()),
                "log": redact_path(&Self::log_path(&dir).to_string_lossy()),
                "metrics": redact_path(&Self::metrics_path(&dir).to_string_lossy()),
            }),
        );
        self.store.update_lab(&lab).await?;

        Ok(())
    }

    async fn destroy_lab(&self, lab: &Lab) -> Result<TeardownResult, RuntimeError> {
        let dir = self.lab_dir(lab)?;
        if !dir.exists() {
            return Ok(TeardownResult::clean());
        }

        let pid = Self::read_pid(&dir).await;

        // Tier 1: graceful shutdown.
        if !self.graceful_shutdown(pid).await {
            debug!(lab_id = %lab.id, "graceful shutdown timed out, escalating");
            let deadline = tokio::time::Instant::now() + self.teardown_timeout;
            Self::force_kill(pid).await;
            while tokio::time::Instant::now() < deadline {
                let still_alive = pid.map(process_alive).unwrap_or(false);
                if !still_alive {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        // Tier 2: targeted cleanup.
        Self::remove_tap_device(lab).await;
        self.remove_nat_rule(lab).await;
        rmtree_hardened(&dir);

        // Tier 3: verify-remaining, honestly.
        let process_remaining = pid.is_some_and(process_alive);
        let dir_remaining = dir.exists();
        let tap_remaining = Command::new("ip")
            .args(["link", "show", &tap_device_name(lab)])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success());

        let containers_remaining = u32::from(process_remaining) + u32::from(dir_remaining);
        let networks_remaining = u32::from(tap_remaining);

        Ok(TeardownResult {
            success: containers_remaining == 0 && networks_remaining == 0,
            containers_remaining,
            networks_remaining,
        })
    }

    async fn resources_exist_for_lab(&self, lab: &Lab) -> Result<bool, RuntimeError> {
        let dir = self.lab_dir(lab)?;
        if !dir.exists() {
            return Ok(false);
        }
        Ok(Self::read_pid(&dir).await.is_some_and(process_alive))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use octolab_domain::{OwnerId, RecipeId, RuntimeKind};

    fn dummy_lab() -> Lab {
        Lab::new_requested(
            OwnerId(uuid::Uuid::new_v4()),
            RecipeId(uuid::Uuid::new_v4()),
            RuntimeKind::Microvm,
            Value::Null,
            chrono::Utc::now(),
        )
    }

    #[test]
    fn tap_device_name_fits_ifnamsiz() {
        let lab = dummy_lab();
        assert!(tap_device_name(&lab).len() <= 15);
    }

    #[test]
    fn nat_comment_is_derived_from_lab_id_suffix() {
        let lab = dummy_lab();
        let comment = nat_comment(&lab);
        assert!(comment.starts_with("octolab_"));
        assert_eq!(comment.len(), "octolab_".len() + 12);
    }

    #[tokio::test]
    async fn resources_do_not_exist_without_a_state_dir() {
        let store: Arc<dyn StateStore> = Arc::new(octolab_store::InMemoryStore::new());
        let runtime = MicrovmRuntime::new(
            store,
            std::env::temp_dir().join("octolab-test-missing"),
            PathBuf::from("/nonexistent/rootfs.ext4"),
            PathBuf::from("/nonexistent/vmlinux"),
            60,
            30,
            true,
        );
        let lab = dummy_lab();
        assert!(!runtime.resources_exist_for_lab(&lab).await.unwrap());
    }
}
