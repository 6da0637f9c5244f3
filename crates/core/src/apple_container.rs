//! Apple `container` CLI backend
//!
//! Unlike the Docker-family CLIs, Apple's tool lists containers as one JSON
//! array with a nested configuration object, and its availability is
//! multi-state: the CLI can be missing, the system service stopped, or the
//! Linux kernel not yet configured. Each state maps to its own remediation.

use crate::env::{CommandOutput, Env};
use crate::errors::{Result, RuntimeError};
use crate::runtime::{
    map_state, ContainerBackend, ContainerStatus, ContainerSummary, CreateSpec, ExecSpec,
    LABEL_PROJECT_ID, LABEL_PROJECT_PATH,
};
use std::io;
use tracing::{debug, instrument};

const PROGRAM: &str = "container";

/// Availability states of the Apple container stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppleAvailability {
    Ready,
    /// Not running on macOS at all
    UnsupportedHost,
    /// The `container` binary is not on PATH
    CliMissing,
    /// The system service has not been started
    SystemNotRunning,
    /// No Linux kernel has been configured for the VM
    KernelNotConfigured,
}

impl AppleAvailability {
    fn reason(&self) -> &'static str {
        match self {
            AppleAvailability::Ready => "ready",
            AppleAvailability::UnsupportedHost => "Apple's container CLI only runs on macOS",
            AppleAvailability::CliMissing => {
                "the 'container' CLI was not found; install Apple container"
            }
            AppleAvailability::SystemNotRunning => {
                "the container system service is not running; run 'container system start'"
            }
            AppleAvailability::KernelNotConfigured => {
                "no Linux kernel is configured; run 'container system kernel set --recommended'"
            }
        }
    }
}

/// Backend over Apple's `container` CLI
#[derive(Debug, Clone, Default)]
pub struct AppleContainer;

impl AppleContainer {
    pub fn new() -> Self {
        AppleContainer
    }

    /// Probe the availability state without failing
    #[instrument(skip_all)]
    pub async fn availability(&self, env: &Env) -> AppleAvailability {
        if env.os() != "macos" {
            return AppleAvailability::UnsupportedHost;
        }
        let args = vec!["system".to_string(), "status".to_string()];
        match env.runner.run(PROGRAM, &args).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => AppleAvailability::CliMissing,
            Err(_) => AppleAvailability::CliMissing,
            Ok(output) => {
                let text = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
                if text.contains("kernel") && !output.success() {
                    AppleAvailability::KernelNotConfigured
                } else if !output.success() || text.contains("not running") {
                    AppleAvailability::SystemNotRunning
                } else {
                    AppleAvailability::Ready
                }
            }
        }
    }

    fn cli_error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::Cli {
            runtime: PROGRAM.to_string(),
            message: message.into(),
        }
    }

    async fn run(&self, env: &Env, args: Vec<String>) -> Result<CommandOutput> {
        env.runner
            .run(PROGRAM, &args)
            .await
            .map_err(|e| self.cli_error(format!("failed to invoke 'container': {}", e)).into())
    }

    async fn run_checked(&self, env: &Env, args: Vec<String>) -> Result<CommandOutput> {
        let output = self.run(env, args).await?;
        if !output.success() {
            return Err(self.cli_error(output.stderr.trim().to_string()).into());
        }
        Ok(output)
    }

    /// The full `container list` document
    async fn list_all(&self, env: &Env) -> Result<Vec<serde_json::Value>> {
        let output = self
            .run_checked(
                env,
                vec![
                    "list".to_string(),
                    "--all".to_string(),
                    "--format".to_string(),
                    "json".to_string(),
                ],
            )
            .await?;
        if output.stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&output.stdout)
            .map_err(|e| self.cli_error(format!("failed to parse list JSON: {}", e)).into())
    }
}

fn entry_id(entry: &serde_json::Value) -> String {
    entry
        .pointer("/configuration/id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn entry_label(entry: &serde_json::Value, key: &str) -> Option<String> {
    entry
        .pointer("/configuration/labels")
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn entry_status(entry: &serde_json::Value) -> ContainerStatus {
    let id = entry_id(entry);
    ContainerStatus {
        state: map_state(
            entry
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown"),
        ),
        name: id.clone(),
        id,
        image: entry
            .pointer("/configuration/image/reference")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        started_at: None,
    }
}

impl ContainerBackend for AppleContainer {
    fn name(&self) -> &'static str {
        PROGRAM
    }

    async fn available(&self, env: &Env) -> std::result::Result<(), RuntimeError> {
        match self.availability(env).await {
            AppleAvailability::Ready => Ok(()),
            state => Err(RuntimeError::BackendUnavailable {
                name: PROGRAM.to_string(),
                reason: state.reason().to_string(),
            }),
        }
    }

    async fn create(&self, env: &Env, spec: &CreateSpec) -> Result<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("--cwd".to_string());
        args.push(spec.workdir.clone());
        for (key, value) in &spec.envs {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(memory) = &spec.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        if let Some(cpus) = spec.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        // The CLI offers no capability flags; drops/adds are not forwarded.
        for bind in &spec.binds {
            args.push("--volume".to_string());
            args.push(format!("{}:{}", bind.source, bind.target));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let output = self.run_checked(env, args).await?;
        let id = output.stdout.trim().to_string();
        Ok(if id.is_empty() { spec.name.clone() } else { id })
    }

    async fn start(&self, env: &Env, container: &str) -> Result<()> {
        self.run_checked(env, vec!["start".to_string(), container.to_string()])
            .await?;
        Ok(())
    }

    async fn stop(&self, env: &Env, container: &str) -> Result<()> {
        let output = self
            .run(env, vec!["stop".to_string(), container.to_string()])
            .await?;
        if !output.success() {
            let stderr = output.stderr.to_lowercase();
            if !stderr.contains("not running") && !stderr.contains("not found") {
                return Err(self.cli_error(output.stderr.trim().to_string()).into());
            }
            debug!(container, "Stop tolerated: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn remove(&self, env: &Env, container: &str) -> Result<()> {
        let output = self
            .run(
                env,
                vec![
                    "delete".to_string(),
                    "--force".to_string(),
                    container.to_string(),
                ],
            )
            .await?;
        if !output.success() {
            let stderr = output.stderr.to_lowercase();
            if !stderr.contains("not found") && !stderr.contains("no such") {
                return Err(self.cli_error(output.stderr.trim().to_string()).into());
            }
            debug!(container, "Delete tolerated: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn exec(&self, env: &Env, spec: &ExecSpec) -> Result<i32> {
        let mut args = vec!["exec".to_string()];
        if let Some(workdir) = &spec.workdir {
            args.push("--cwd".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &spec.envs {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.container.clone());
        args.extend(spec.command.iter().cloned());

        env.runner
            .run_inherited(PROGRAM, &args)
            .await
            .map_err(|e| self.cli_error(format!("exec failed: {}", e)).into())
    }

    async fn run_in_container(
        &self,
        env: &Env,
        container: &str,
        command: &str,
    ) -> Result<CommandOutput> {
        self.run(
            env,
            vec![
                "exec".to_string(),
                container.to_string(),
                "sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ],
        )
        .await
    }

    async fn query(&self, env: &Env, project_id: &str, name: &str) -> Result<ContainerStatus> {
        let entries = self.list_all(env).await?;
        let by_label = entries
            .iter()
            .find(|e| entry_label(e, LABEL_PROJECT_ID).as_deref() == Some(project_id));
        let found = by_label.or_else(|| entries.iter().find(|e| entry_id(e) == name));
        Ok(found.map(entry_status).unwrap_or_else(ContainerStatus::not_found))
    }

    async fn list(&self, env: &Env) -> Result<Vec<ContainerSummary>> {
        let entries = self.list_all(env).await?;
        Ok(entries
            .iter()
            .filter(|e| entry_label(e, LABEL_PROJECT_ID).is_some())
            .map(|e| {
                let status = entry_status(e);
                ContainerSummary {
                    id: status.id,
                    name: status.name,
                    image: status.image,
                    state: e
                        .get("status")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    project_id: entry_label(e, LABEL_PROJECT_ID),
                    project_path: entry_label(e, LABEL_PROJECT_PATH),
                }
            })
            .collect())
    }

    async fn container_ip(&self, env: &Env, container: &str) -> Result<String> {
        let entries = self.list_all(env).await?;
        let entry = entries
            .iter()
            .find(|e| entry_id(e) == container)
            .ok_or_else(|| self.cli_error(format!("container '{}' not found", container)))?;
        let address = entry
            .pointer("/networks/0/address")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                self.cli_error(format!("container '{}' reports no network address", container))
            })?;
        // Addresses come back in CIDR form
        Ok(address.split('/').next().unwrap_or(address).to_string())
    }

    async fn rootless(&self, _env: &Env) -> Result<bool> {
        Ok(false)
    }

    async fn engine_operating_system(&self, _env: &Env) -> Result<String> {
        Ok("macOS (Apple container)".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::mock::{output_err, output_ok, MemFs, ScriptedRunner};
    use crate::runtime::ContainerState;
    use std::sync::Arc;

    fn env_with(runner: Arc<ScriptedRunner>, os: &'static str) -> Env {
        Env::new(Arc::new(MemFs::new()), runner, "/p").with_os(os)
    }

    const LIST_JSON: &str = r#"[
        {
            "status": "running",
            "configuration": {
                "id": "alca-0123456789ab",
                "image": { "reference": "ubuntu:24.04" },
                "labels": { "io.alcatraz.project-id": "pid-1", "io.alcatraz.project-path": "/p" }
            },
            "networks": [ { "address": "192.168.64.3/24" } ]
        }
    ]"#;

    #[tokio::test]
    async fn test_availability_on_linux_host() {
        let env = env_with(Arc::new(ScriptedRunner::new()), "linux");
        assert_eq!(
            AppleContainer::new().availability(&env).await,
            AppleAvailability::UnsupportedHost
        );
    }

    #[tokio::test]
    async fn test_availability_cli_missing() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.missing_binary("container system status");
        let env = env_with(runner, "macos");
        assert_eq!(
            AppleContainer::new().availability(&env).await,
            AppleAvailability::CliMissing
        );
    }

    #[tokio::test]
    async fn test_availability_system_not_running() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "container system status",
            output_ok("apiserver is not running\n"),
        );
        let env = env_with(runner, "macos");
        assert_eq!(
            AppleContainer::new().availability(&env).await,
            AppleAvailability::SystemNotRunning
        );
    }

    #[tokio::test]
    async fn test_availability_kernel_not_configured() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "container system status",
            output_err(1, "error: no default kernel configured"),
        );
        let env = env_with(runner, "macos");
        assert_eq!(
            AppleContainer::new().availability(&env).await,
            AppleAvailability::KernelNotConfigured
        );
    }

    #[tokio::test]
    async fn test_availability_ready() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("container system status", output_ok("apiserver is running\n"));
        let env = env_with(runner, "macos");
        assert_eq!(
            AppleContainer::new().availability(&env).await,
            AppleAvailability::Ready
        );
    }

    #[tokio::test]
    async fn test_query_by_label_and_status_parse() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("container list --all --format json", output_ok(LIST_JSON));
        let env = env_with(runner, "macos");

        let status = AppleContainer::new()
            .query(&env, "pid-1", "other-name")
            .await
            .unwrap();
        assert_eq!(status.state, ContainerState::Running);
        assert_eq!(status.id, "alca-0123456789ab");
        assert_eq!(status.image, "ubuntu:24.04");
    }

    #[tokio::test]
    async fn test_query_miss_is_not_found() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("container list --all --format json", output_ok("[]"));
        let env = env_with(runner, "macos");

        let status = AppleContainer::new().query(&env, "nope", "nope").await.unwrap();
        assert_eq!(status.state, ContainerState::NotFound);
    }

    #[tokio::test]
    async fn test_container_ip_strips_cidr_suffix() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("container list --all --format json", output_ok(LIST_JSON));
        let env = env_with(runner, "macos");

        let ip = AppleContainer::new()
            .container_ip(&env, "alca-0123456789ab")
            .await
            .unwrap();
        assert_eq!(ip, "192.168.64.3");
    }
}
