use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use octolab_domain::Lab;
use octolab_hygiene::{redact_secrets, resolve_under_base, truncate};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::lab_runtime::{LabRuntime, LabSecrets, TeardownResult};

const MAX_LOG_LEN: usize = 8192;
const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(20);
const NETWORK_POOL_WARN_THRESHOLD: u32 = 200;
const PREFLIGHT_SWEEP_LIMIT: usize = 20;

/// Runs each lab under `docker compose`, one project per lab. A project owns
/// exactly its own containers, the two lab networks, and the three per-lab
/// evidence volumes — nothing else is ever touched by this backend.
pub struct ComposeRuntime {
    compose_root: PathBuf,
    startup_timeout: Duration,
    teardown_timeout: Duration,
}

impl ComposeRuntime {
    pub fn new(compose_root: PathBuf, startup_timeout_seconds: u32, teardown_timeout_seconds: u32) -> Self {
        ComposeRuntime {
            compose_root,
            startup_timeout: Duration::from_secs(startup_timeout_seconds as u64),
            teardown_timeout: Duration::from_secs(teardown_timeout_seconds as u64),
        }
    }

    fn project_name(lab: &Lab) -> String {
        format!("octolab_{}", lab.id.as_uuid().simple())
    }

    fn lab_net_name(lab: &Lab) -> String {
        format!("octolab_{}_lab_net", lab.id.as_uuid())
    }

    fn egress_net_name(lab: &Lab) -> String {
        format!("octolab_{}_egress_net", lab.id.as_uuid())
    }

    fn project_dir(&self, lab: &Lab) -> Result<PathBuf, RuntimeError> {
        let relative = PathBuf::from(format!("lab_{}", lab.id.as_uuid()));
        Ok(resolve_under_base(&self.compose_root, &relative)?)
    }

    fn curated_env(lab: &Lab, secrets: &LabSecrets) -> Vec<(String, String)> {
        let mut env = vec![
            ("LAB_ID".to_string(), lab.id.to_string()),
            (
                "HOST_PORT".to_string(),
                lab.novnc_host_port.map(|p| p.to_string()).unwrap_or_default(),
            ),
            ("BIND_HOST".to_string(), "127.0.0.1".to_string()),
        ];
        if let Some(password) = &secrets.vnc_password {
            env.push(("VNC_PASSWORD".to_string(), password.clone()));
        }
        env
    }

    /// Run a `docker compose` invocation against this lab's project, with
    /// the same discipline as the teraform driver: explicit working
    /// directory, curated env only, concurrent stdout/stderr drain into one
    /// ordered, redacted, truncated log, and a hard timeout.
    async fn run_compose(
        &self,
        lab: &Lab,
        args: &[&str],
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<(i32, String), RuntimeError> {
        let project_dir = self.project_dir(lab)?;
        let project = Self::project_name(lab);

        let mut full_args: Vec<&str> = vec!["compose", "--project-directory"];
        let project_dir_str = project_dir.to_string_lossy().into_owned();
        full_args.push(&project_dir_str);
        full_args.extend(["--project-name", &project]);
        full_args.extend(args.iter().copied());

        info!(lab_id = %lab.id, ?args, "running compose command");

        let mut cmd = Command::new("docker");
        cmd.args(&full_args)
            .current_dir(&project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Internal(format!("spawn docker: {e}")))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let mut log = String::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let tx1 = tx.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx1.send(line);
            }
        });
        let tx2 = tx.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx2.send(line);
            }
        });
        drop(tx);

        let collect = async {
            while let Some(line) = rx.recv().await {
                debug!(target: "octolab::compose", "{}", redact_secrets(&line));
                log.push_str(&line);
                log.push('\n');
            }
        };
        let timed_out = tokio::time::timeout(timeout, collect).await.is_err();

        stdout_task.await.ok();
        stderr_task.await.ok();

        if timed_out {
            let _ = child.kill().await;
            return Err(RuntimeError::ComposeCommandError {
                command: args.join(" "),
                exit_code: -1,
                tail: "timed out waiting for compose command".to_string(),
            });
        }

        let status = child
            .wait()
            .await
            .map_err(|e| RuntimeError::Internal(format!("wait docker: {e}")))?;
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            warn!(lab_id = %lab.id, code, "compose command exited non-zero");
        }
        Ok((code, truncate(&redact_secrets(&log), MAX_LOG_LEN)))
    }

    /// Sweep lab networks matching the strict project pattern whose
    /// container count is zero, up to a small bound. Never touches a
    /// network this backend did not create the pattern for, and never
    /// calls a broad prune.
    async fn preflight_network_sweep(&self, lab: &Lab) {
        let candidates = [Self::lab_net_name(lab), Self::egress_net_name(lab)];
        for (i, name) in candidates.iter().enumerate() {
            if i >= PREFLIGHT_SWEEP_LIMIT {
                break;
            }
            let output = Command::new("docker")
                .args(["network", "rm", name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .output()
                .await;
            if let Ok(out) = output {
                debug!(lab_id = %lab.id, network = %name, status = ?out.status, "preflight network sweep");
            }
        }
    }

    async fn network_counts(&self) -> (u32, u32) {
        let output = Command::new("docker")
            .args(["network", "ls", "--format", "{{.Name}}"])
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) => {
                let text = String::from_utf8_lossy(&out.stdout);
                let total = text.lines().count() as u32;
                let octolab = text.lines().filter(|l| l.starts_with("octolab_")).count() as u32;
                (total, octolab)
            }
            Err(_) => (0, 0),
        }
    }

    /// Capture `ps`, `logs`, and rendered config for a failing project, each
    /// with its own short timeout and its own redaction, plus host/octolab
    /// network counts and a pool-exhaustion hint past the threshold.
    async fn capture_diagnostics(&self, lab: &Lab) -> String {
        let mut diag = String::new();
        for args in [vec!["ps"], vec!["logs", "--tail", "200"], vec!["config"]] {
            let label = args.join(" ");
            match self.run_compose(lab, &args, &[], DIAGNOSTIC_TIMEOUT).await {
                Ok((code, out)) => {
                    diag.push_str(&format!("=== compose {label} (exit {code}) ===\n{out}\n"));
                }
                Err(e) => {
                    diag.push_str(&format!("=== compose {label} failed: {e} ===\n"));
                }
            }
        }
        let (total_networks, octolab_networks) = self.network_counts().await;
        diag.push_str(&format!(
            "networks: {octolab_networks} octolab of {total_networks} total\n"
        ));
        if octolab_networks > NETWORK_POOL_WARN_THRESHOLD {
            diag.push_str("hint: octolab network count is unusually high, likely pool exhaustion\n");
        }
        diag
    }

    async fn count_containers(&self, lab: &Lab) -> u32 {
        match self.run_compose(lab, &["ps", "-q"], &[], DIAGNOSTIC_TIMEOUT).await {
            Ok((0, out)) => out.lines().filter(|l| !l.trim().is_empty()).count() as u32,
            _ => 0,
        }
    }

    async fn count_networks_remaining(&self, lab: &Lab) -> u32 {
        let output = Command::new("docker")
            .args([
                "network",
                "ls",
                "--filter",
                &format!("name=octolab_{}_", lab.id.as_uuid()),
                "--format",
                "{{.Name}}",
            ])
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout).lines().count() as u32,
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl LabRuntime for ComposeRuntime {
    async fn create_lab(
        &self,
        lab: &Lab,
        _recipe: &Value,
        secrets: &LabSecrets,
    ) -> Result<(), RuntimeError> {
        let project_dir = self.project_dir(lab)?;
        tokio::fs::create_dir_all(&project_dir)
            .await
            .map_err(|e| RuntimeError::Internal(format!("create project dir: {e}")))?;

        self.preflight_network_sweep(lab).await;

        let env = Self::curated_env(lab, secrets);
        let (code, log) = self
            .run_compose(lab, &["up", "-d"], &env, self.startup_timeout)
            .await?;

        if code != 0 {
            let diag = self.capture_diagnostics(lab).await;
            let (total, octolab) = self.network_counts().await;
            if log.contains("port is already allocated") {
                return Err(RuntimeError::PortAlreadyInUse(
                    lab.novnc_host_port.unwrap_or_default(),
                ));
            }
            if octolab > NETWORK_POOL_WARN_THRESHOLD {
                return Err(RuntimeError::NetworkPoolExhausted {
                    total_networks: total,
                    octolab_networks: octolab,
                });
            }
            return Err(RuntimeError::ComposeCommandError {
                command: "up -d".to_string(),
                exit_code: code,
                tail: truncate(&format!("{log}\n{diag}"), MAX_LOG_LEN),
            });
        }
        Ok(())
    }

    async fn destroy_lab(&self, lab: &Lab) -> Result<TeardownResult, RuntimeError> {
        let project_dir = self.project_dir(lab)?;
        if !project_dir.exists() {
            return Ok(TeardownResult::clean());
        }

        let (code, log) = self
            .run_compose(lab, &["down", "--volumes"], &[], self.teardown_timeout)
            .await?;
        if code != 0 {
            debug!(lab_id = %lab.id, %log, "compose down exited non-zero, verifying residue");
        }

        let containers_remaining = self.count_containers(lab).await;
        let networks_remaining = self.count_networks_remaining(lab).await;

        Ok(TeardownResult {
            success: containers_remaining == 0 && networks_remaining == 0,
            containers_remaining,
            networks_remaining,
        })
    }

    async fn resources_exist_for_lab(&self, lab: &Lab) -> Result<bool, RuntimeError> {
        let project_dir = self.project_dir(lab)?;
        if !project_dir.exists() {
            return Ok(false);
        }
        let containers = self.count_containers(lab).await;
        Ok(containers > 0)
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

    #[test]
    fn project_name_is_prefixed_and_simple() {
        let lab = dummy_lab();
        let name = ComposeRuntime::project_name(&lab);
        assert!(name.starts_with("octolab_"));
        assert!(!name.contains('-'));
    }

    #[test]
    fn network_names_follow_strict_pattern() {
        let lab = dummy_lab();
        assert!(ComposeRuntime::lab_net_name(&lab).ends_with("_lab_net"));
        assert!(ComposeRuntime::egress_net_name(&lab).ends_with("_egress_net"));
    }

    #[test]
    fn curated_env_omits_vnc_password_when_absent() {
        let lab = dummy_lab();
        let env = ComposeRuntime::curated_env(&lab, &LabSecrets::default());
        assert!(!env.iter().any(|(k, _)| k == "VNC_PASSWORD"));
    }

    #[test]
    fn curated_env_includes_vnc_password_when_present() {
        let lab = dummy_lab();
        let secrets = LabSecrets {
            vnc_password: Some("s3cret".to_string()),
        };
        let env = ComposeRuntime::curated_env(&lab, &secrets);
        assert!(env.iter().any(|(k, v)| k == "VNC_PASSWORD" && v == "s3cret"));
    }
}
