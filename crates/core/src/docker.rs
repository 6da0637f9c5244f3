//! Docker-family container backend
//!
//! Docker and Podman share the Docker-CLI-compatible command surface, so one
//! implementation serves both, parameterized by the binary name. Containers
//! are located by the project-ID label first and by name as a fallback (the
//! fallback covers the first `up` and containers created before labels
//! carried the project ID).

use crate::env::{CommandOutput, Env};
use crate::errors::{Result, RuntimeError};
use crate::runtime::{
    map_state, ContainerBackend, ContainerStatus, ContainerSummary, CreateSpec, ExecSpec,
    LABEL_PROJECT_ID, LABEL_PROJECT_PATH,
};
use chrono::{DateTime, Utc};
use std::io;
use tracing::{debug, instrument};

/// A Docker-CLI-compatible backend (`docker` or `podman`)
#[derive(Debug, Clone)]
pub struct DockerFamily {
    program: &'static str,
    install_hint: &'static str,
}

impl DockerFamily {
    pub fn docker() -> Self {
        DockerFamily {
            program: "docker",
            install_hint: "install Docker",
        }
    }

    pub fn podman() -> Self {
        DockerFamily {
            program: "podman",
            install_hint: "install Podman",
        }
    }

    fn cli_error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::Cli {
            runtime: self.program.to_string(),
            message: message.into(),
        }
    }

    async fn run(&self, env: &Env, args: Vec<String>) -> Result<CommandOutput> {
        env.runner
            .run(self.program, &args)
            .await
            .map_err(|e| self.cli_error(format!("failed to invoke '{}': {}", self.program, e)).into())
    }

    async fn run_checked(&self, env: &Env, args: Vec<String>) -> Result<CommandOutput> {
        let output = self.run(env, args).await?;
        if !output.success() {
            return Err(self.cli_error(output.stderr.trim().to_string()).into());
        }
        Ok(output)
    }

    /// `docker inspect` one target into a status; a lookup miss is NotFound
    async fn inspect(&self, env: &Env, target: &str) -> Result<ContainerStatus> {
        let output = self
            .run(env, vec!["inspect".to_string(), target.to_string()])
            .await?;
        if !output.success() {
            if output.stderr.to_lowercase().contains("no such") {
                return Ok(ContainerStatus::not_found());
            }
            return Err(self.cli_error(output.stderr.trim().to_string()).into());
        }

        let containers: Vec<serde_json::Value> = serde_json::from_str(&output.stdout)
            .map_err(|e| self.cli_error(format!("failed to parse inspect JSON: {}", e)))?;
        let Some(container) = containers.first() else {
            return Ok(ContainerStatus::not_found());
        };

        let state_str = container
            .pointer("/State/Status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let started_at = container
            .pointer("/State/StartedAt")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp);

        Ok(ContainerStatus {
            state: map_state(state_str),
            id: container
                .get("Id")
                .and_then(|v| v.as_str())
                .unwrap_or(target)
                .to_string(),
            name: container
                .get("Name")
                .and_then(|v| v.as_str())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: container
                .pointer("/Config/Image")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            started_at,
        })
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Parse the `Labels` string of a `ps` line (`k=v,k=v`)
fn label_value(labels: &str, key: &str) -> Option<String> {
    labels.split(',').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == key).then(|| v.to_string())
    })
}

impl ContainerBackend for DockerFamily {
    fn name(&self) -> &'static str {
        self.program
    }

    #[instrument(skip_all, fields(program = self.program))]
    async fn available(&self, env: &Env) -> std::result::Result<(), RuntimeError> {
        match env.runner.run(self.program, &["version".to_string()]).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(RuntimeError::BackendUnavailable {
                name: self.program.to_string(),
                reason: format!("engine is not reachable: {}", output.stderr.trim()),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(RuntimeError::BackendUnavailable {
                    name: self.program.to_string(),
                    reason: format!("'{}' CLI not found; {}", self.program, self.install_hint),
                })
            }
            Err(e) => Err(RuntimeError::BackendUnavailable {
                name: self.program.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn create(&self, env: &Env, spec: &CreateSpec) -> Result<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("-w".to_string());
        args.push(spec.workdir.clone());
        for (key, value) in &spec.envs {
            args.push("-e".to_string());
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
        for cap in &spec.cap_drop {
            args.push("--cap-drop".to_string());
            args.push(cap.clone());
        }
        for cap in &spec.cap_add {
            args.push("--cap-add".to_string());
            args.push(cap.clone());
        }
        for bind in &spec.binds {
            args.push("-v".to_string());
            args.push(if bind.readonly {
                format!("{}:{}:ro", bind.source, bind.target)
            } else {
                format!("{}:{}", bind.source, bind.target)
            });
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
            if !stderr.contains("is not running") && !stderr.contains("no such") {
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
                vec!["rm".to_string(), "-f".to_string(), container.to_string()],
            )
            .await?;
        if !output.success() {
            let stderr = output.stderr.to_lowercase();
            if !stderr.contains("no such") {
                return Err(self.cli_error(output.stderr.trim().to_string()).into());
            }
            debug!(container, "Remove tolerated: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn exec(&self, env: &Env, spec: &ExecSpec) -> Result<i32> {
        let mut args = vec!["exec".to_string()];
        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &spec.envs {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.container.clone());
        args.extend(spec.command.iter().cloned());

        env.runner
            .run_inherited(self.program, &args)
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

    #[instrument(skip_all, fields(program = self.program, name))]
    async fn query(&self, env: &Env, project_id: &str, name: &str) -> Result<ContainerStatus> {
        let output = self
            .run_checked(
                env,
                vec![
                    "ps".to_string(),
                    "--all".to_string(),
                    "--filter".to_string(),
                    format!("label={}={}", LABEL_PROJECT_ID, project_id),
                    "--format".to_string(),
                    "{{json .}}".to_string(),
                ],
            )
            .await?;

        if let Some(line) = output.stdout.lines().find(|l| !l.trim().is_empty()) {
            let row: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| self.cli_error(format!("failed to parse ps JSON: {}", e)))?;
            if let Some(id) = row.get("ID").and_then(|v| v.as_str()) {
                return self.inspect(env, id).await;
            }
        }

        // Fallback for the first `up` and legacy containers
        self.inspect(env, name).await
    }

    async fn list(&self, env: &Env) -> Result<Vec<ContainerSummary>> {
        let output = self
            .run_checked(
                env,
                vec![
                    "ps".to_string(),
                    "--all".to_string(),
                    "--filter".to_string(),
                    format!("label={}", LABEL_PROJECT_ID),
                    "--format".to_string(),
                    "{{json .}}".to_string(),
                ],
            )
            .await?;

        let mut summaries = Vec::new();
        for line in output.stdout.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let row: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| self.cli_error(format!("failed to parse ps JSON: {}", e)))?;
            let labels = row.get("Labels").and_then(|v| v.as_str()).unwrap_or("");
            summaries.push(ContainerSummary {
                id: row
                    .get("ID")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: row
                    .get("Names")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                image: row
                    .get("Image")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                state: row
                    .get("State")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                project_id: label_value(labels, LABEL_PROJECT_ID),
                project_path: label_value(labels, LABEL_PROJECT_PATH),
            });
        }
        Ok(summaries)
    }

    async fn container_ip(&self, env: &Env, container: &str) -> Result<String> {
        let output = self
            .run_checked(
                env,
                vec![
                    "inspect".to_string(),
                    "-f".to_string(),
                    "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}".to_string(),
                    container.to_string(),
                ],
            )
            .await?;
        let ip = output.stdout.trim().to_string();
        if ip.is_empty() {
            return Err(self
                .cli_error(format!("container '{}' reports no IP address", container))
                .into());
        }
        Ok(ip)
    }

    async fn rootless(&self, env: &Env) -> Result<bool> {
        if self.program != "podman" {
            return Ok(false);
        }
        let output = self
            .run_checked(
                env,
                vec![
                    "info".to_string(),
                    "--format".to_string(),
                    "{{.Host.Security.Rootless}}".to_string(),
                ],
            )
            .await?;
        Ok(output.stdout.trim() == "true")
    }

    async fn engine_operating_system(&self, env: &Env) -> Result<String> {
        let output = self
            .run_checked(
                env,
                vec![
                    "info".to_string(),
                    "--format".to_string(),
                    "{{.OperatingSystem}}".to_string(),
                ],
            )
            .await?;
        Ok(output.stdout.trim().to_string())
    }
}
