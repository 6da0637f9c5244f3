//! Container runtime abstraction
//!
//! A uniform surface over the Docker-family CLIs (Docker, Podman) and
//! Apple's `container` CLI. Backends implement the primitive
//! [`ContainerBackend`] operations; [`Runtime`] composes them into the
//! higher-level up/down/exec/status/reload lifecycle shared by every
//! backend. Dispatch is by enum, not trait objects, so backends can use
//! plain `async fn`s.

use crate::apple_container::AppleContainer;
use crate::config::{EnvValue, ProjectConfig, RuntimeChoice};
use crate::docker::DockerFamily;
use crate::env::{CommandOutput, Env};
use crate::errors::{Result, RuntimeError};
use crate::platform::MountPlan;
use crate::state::ProjectState;
use crate::sync::{self, SyncManager};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use tracing::{debug, info, instrument, warn};

/// Label carrying the project ID; the authoritative way to find a project's
/// container
pub const LABEL_PROJECT_ID: &str = "io.alcatraz.project-id";

/// Label carrying the absolute project path, for `list` output
pub const LABEL_PROJECT_PATH: &str = "io.alcatraz.project-path";

/// Keep-alive sentinel run as the container's primary process
pub const KEEP_ALIVE_COMMAND: &[&str] = &["sleep", "infinity"];

/// Concrete runtime selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Podman,
    AppleContainer,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
            RuntimeKind::AppleContainer => "container",
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = RuntimeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "docker" => Ok(RuntimeKind::Docker),
            "podman" => Ok(RuntimeKind::Podman),
            "container" => Ok(RuntimeKind::AppleContainer),
            other => Err(RuntimeError::BackendUnavailable {
                name: other.to_string(),
                reason: "unknown runtime; expected docker, podman, or container".to_string(),
            }),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Observed container state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Unknown,
    /// No container exists; a lookup miss is never an error
    NotFound,
}

/// Parsed container status
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub id: String,
    pub name: String,
    pub image: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl ContainerStatus {
    pub fn not_found() -> Self {
        ContainerStatus {
            state: ContainerState::NotFound,
            id: String::new(),
            name: String::new(),
            image: String::new(),
            started_at: None,
        }
    }
}

/// Map a backend-reported state string onto [`ContainerState`]
pub(crate) fn map_state(state: &str) -> ContainerState {
    match state {
        "running" => ContainerState::Running,
        "exited" | "stopped" => ContainerState::Stopped,
        _ => ContainerState::Unknown,
    }
}

/// One row of `list` output
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub project_id: Option<String>,
    pub project_path: Option<String>,
}

/// A bind mount passed to the container runtime
#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub readonly: bool,
}

/// Everything a backend needs to create a container
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub workdir: String,
    pub labels: Vec<(String, String)>,
    /// Static envs, resolved at creation time
    pub envs: Vec<(String, String)>,
    pub memory: Option<String>,
    pub cpus: Option<f64>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub binds: Vec<BindMount>,
    /// The keep-alive sentinel
    pub command: Vec<String>,
}

/// Everything a backend needs to exec into a running container
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub container: String,
    pub workdir: Option<String>,
    /// `override_on_enter` envs, re-resolved at exec time
    pub envs: Vec<(String, String)>,
    pub command: Vec<String>,
}

/// Primitive operations every container backend exposes
#[allow(async_fn_in_trait)]
pub trait ContainerBackend {
    fn name(&self) -> &'static str;

    /// Check the backend is usable; the error carries a remediation
    async fn available(&self, env: &Env) -> std::result::Result<(), RuntimeError>;

    /// Create a container, returning its ID
    async fn create(&self, env: &Env, spec: &CreateSpec) -> Result<String>;

    async fn start(&self, env: &Env, container: &str) -> Result<()>;

    /// Stop a container, tolerating "not running"
    async fn stop(&self, env: &Env, container: &str) -> Result<()>;

    /// Force-remove a container, tolerating "no such container"
    async fn remove(&self, env: &Env, container: &str) -> Result<()>;

    /// Interactive exec with inherited stdio; returns the exit code
    async fn exec(&self, env: &Env, spec: &ExecSpec) -> Result<i32>;

    /// Run `sh -c <command>` inside the container, capturing output
    async fn run_in_container(
        &self,
        env: &Env,
        container: &str,
        command: &str,
    ) -> Result<CommandOutput>;

    /// Two-step lookup: by project-ID label first, then by name. A lookup
    /// miss yields `NotFound`, never an error.
    async fn query(&self, env: &Env, project_id: &str, name: &str) -> Result<ContainerStatus>;

    /// All containers carrying the project-ID label
    async fn list(&self, env: &Env) -> Result<Vec<ContainerSummary>>;

    async fn container_ip(&self, env: &Env, container: &str) -> Result<String>;

    /// Whether the engine runs rootless (Podman); other backends report false
    async fn rootless(&self, env: &Env) -> Result<bool>;

    /// The engine's self-reported operating system, for platform detection
    async fn engine_operating_system(&self, env: &Env) -> Result<String>;
}

/// Concrete backend dispatch
#[derive(Debug)]
enum BackendImpl {
    DockerFamily(DockerFamily),
    Apple(AppleContainer),
}

impl ContainerBackend for BackendImpl {
    fn name(&self) -> &'static str {
        match self {
            Self::DockerFamily(b) => b.name(),
            Self::Apple(b) => b.name(),
        }
    }

    async fn available(&self, env: &Env) -> std::result::Result<(), RuntimeError> {
        match self {
            Self::DockerFamily(b) => b.available(env).await,
            Self::Apple(b) => b.available(env).await,
        }
    }

    async fn create(&self, env: &Env, spec: &CreateSpec) -> Result<String> {
        match self {
            Self::DockerFamily(b) => b.create(env, spec).await,
            Self::Apple(b) => b.create(env, spec).await,
        }
    }

    async fn start(&self, env: &Env, container: &str) -> Result<()> {
        match self {
            Self::DockerFamily(b) => b.start(env, container).await,
            Self::Apple(b) => b.start(env, container).await,
        }
    }

    async fn stop(&self, env: &Env, container: &str) -> Result<()> {
        match self {
            Self::DockerFamily(b) => b.stop(env, container).await,
            Self::Apple(b) => b.stop(env, container).await,
        }
    }

    async fn remove(&self, env: &Env, container: &str) -> Result<()> {
        match self {
            Self::DockerFamily(b) => b.remove(env, container).await,
            Self::Apple(b) => b.remove(env, container).await,
        }
    }

    async fn exec(&self, env: &Env, spec: &ExecSpec) -> Result<i32> {
        match self {
            Self::DockerFamily(b) => b.exec(env, spec).await,
            Self::Apple(b) => b.exec(env, spec).await,
        }
    }

    async fn run_in_container(
        &self,
        env: &Env,
        container: &str,
        command: &str,
    ) -> Result<CommandOutput> {
        match self {
            Self::DockerFamily(b) => b.run_in_container(env, container, command).await,
            Self::Apple(b) => b.run_in_container(env, container, command).await,
        }
    }

    async fn query(&self, env: &Env, project_id: &str, name: &str) -> Result<ContainerStatus> {
        match self {
            Self::DockerFamily(b) => b.query(env, project_id, name).await,
            Self::Apple(b) => b.query(env, project_id, name).await,
        }
    }

    async fn list(&self, env: &Env) -> Result<Vec<ContainerSummary>> {
        match self {
            Self::DockerFamily(b) => b.list(env).await,
            Self::Apple(b) => b.list(env).await,
        }
    }

    async fn container_ip(&self, env: &Env, container: &str) -> Result<String> {
        match self {
            Self::DockerFamily(b) => b.container_ip(env, container).await,
            Self::Apple(b) => b.container_ip(env, container).await,
        }
    }

    async fn rootless(&self, env: &Env) -> Result<bool> {
        match self {
            Self::DockerFamily(b) => b.rootless(env).await,
            Self::Apple(b) => b.rootless(env).await,
        }
    }

    async fn engine_operating_system(&self, env: &Env) -> Result<String> {
        match self {
            Self::DockerFamily(b) => b.engine_operating_system(env).await,
            Self::Apple(b) => b.engine_operating_system(env).await,
        }
    }
}

/// Outcome of a composed `up`
#[derive(Debug)]
pub struct UpOutcome {
    pub container_id: String,
    /// False when the container was already running (idempotent no-op)
    pub created: bool,
    /// Non-fatal problems (sync flush failures past the retry window)
    pub warnings: Vec<String>,
}

/// A selected container runtime with the composed lifecycle operations
#[derive(Debug)]
pub struct Runtime {
    kind: RuntimeKind,
    backend: BackendImpl,
}

impl Runtime {
    pub fn new(kind: RuntimeKind) -> Self {
        let backend = match kind {
            RuntimeKind::Docker => BackendImpl::DockerFamily(DockerFamily::docker()),
            RuntimeKind::Podman => BackendImpl::DockerFamily(DockerFamily::podman()),
            RuntimeKind::AppleContainer => BackendImpl::Apple(AppleContainer::new()),
        };
        Runtime { kind, backend }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Select a runtime for the configuration.
    ///
    /// `docker` requires Docker. `container` requires Apple's CLI. `auto`
    /// prefers Podman then Docker on Linux and Docker elsewhere.
    #[instrument(skip_all, fields(choice = %config.runtime))]
    pub async fn select(env: &Env, config: &ProjectConfig) -> Result<Runtime> {
        match config.runtime {
            RuntimeChoice::Docker => {
                let runtime = Runtime::new(RuntimeKind::Docker);
                runtime.backend.available(env).await?;
                Ok(runtime)
            }
            RuntimeChoice::Container => {
                let runtime = Runtime::new(RuntimeKind::AppleContainer);
                runtime.backend.available(env).await?;
                Ok(runtime)
            }
            RuntimeChoice::Auto => {
                if env.os() == "linux" {
                    let podman = Runtime::new(RuntimeKind::Podman);
                    if podman.backend.available(env).await.is_ok() {
                        debug!("Auto-selected podman");
                        return Ok(podman);
                    }
                    let docker = Runtime::new(RuntimeKind::Docker);
                    if docker.backend.available(env).await.is_ok() {
                        debug!("Auto-selected docker");
                        return Ok(docker);
                    }
                    Err(RuntimeError::BackendUnavailable {
                        name: "auto".to_string(),
                        reason: "neither Podman nor Docker is usable; install one of them"
                            .to_string(),
                    }
                    .into())
                } else {
                    let docker = Runtime::new(RuntimeKind::Docker);
                    docker.backend.available(env).await?;
                    Ok(docker)
                }
            }
        }
    }

    /// Bring the project container up. Idempotent given the persisted
    /// container name: a running container is left untouched, a stopped one
    /// is removed and recreated.
    #[instrument(skip_all, fields(container = %state.container_name))]
    pub async fn up(
        &self,
        env: &Env,
        config: &ProjectConfig,
        state: &ProjectState,
        plan: &MountPlan,
        sync: &SyncManager,
    ) -> Result<UpOutcome> {
        let status = self
            .backend
            .query(env, &state.project_id, &state.container_name)
            .await?;

        match status.state {
            ContainerState::Running => {
                info!("Container already running");
                return Ok(UpOutcome {
                    container_id: status.id,
                    created: false,
                    warnings: Vec::new(),
                });
            }
            ContainerState::Stopped | ContainerState::Unknown => {
                debug!(state = ?status.state, "Removing existing container before recreate");
                self.backend.remove(env, &status.id).await?;
            }
            ContainerState::NotFound => {}
        }

        let spec = self.create_spec(env, config, state, plan);
        let container_id = self.backend.create(env, &spec).await?;
        self.backend.start(env, &container_id).await?;
        info!(container_id = %container_id, "Container started");

        let mut warnings = Vec::new();
        for planned in plan.sync_entries() {
            let session = sync::session_name(&state.project_id, planned.index);
            let source = resolve_source(env, &planned.mount.source);
            sync.create_session(
                env,
                &session,
                &source,
                self.name(),
                &container_id,
                &planned.mount.target,
                &planned.mount.exclude,
            )
            .await?;
            if let Err(e) = sync.flush(env, &session).await {
                let message = format!("Initial flush of sync session '{}' failed: {}", session, e);
                warn!("{}", message);
                warnings.push(message);
            }
        }

        if let Some(up_command) = &config.commands.up {
            if !up_command.command.is_empty() {
                debug!(command = %up_command.command, "Running up command");
                let output = self
                    .backend
                    .run_in_container(env, &container_id, &up_command.command)
                    .await?;
                if !output.success() {
                    return Err(RuntimeError::Cli {
                        runtime: self.name().to_string(),
                        message: format!(
                            "up command exited with code {}: {}",
                            output.exit_code,
                            output.stderr.trim()
                        ),
                    }
                    .into());
                }
            }
        }

        Ok(UpOutcome {
            container_id,
            created: true,
            warnings,
        })
    }

    /// Tear the project container down and terminate its sync sessions
    #[instrument(skip_all, fields(container = %state.container_name))]
    pub async fn down(&self, env: &Env, state: &ProjectState, sync: &SyncManager) -> Result<()> {
        let status = self
            .backend
            .query(env, &state.project_id, &state.container_name)
            .await?;
        let target = if status.state == ContainerState::NotFound {
            state.container_name.clone()
        } else {
            status.id
        };

        self.backend.stop(env, &target).await?;
        self.backend.remove(env, &target).await?;
        sync.terminate_project_sessions(env, &state.project_id).await?;
        info!("Container torn down");
        Ok(())
    }

    /// Exec a command in the running container, re-exporting
    /// `override_on_enter` envs from the live host environment
    #[instrument(skip_all, fields(container = %state.container_name))]
    pub async fn exec(
        &self,
        env: &Env,
        config: &ProjectConfig,
        state: &ProjectState,
        command: &[String],
    ) -> Result<i32> {
        let status = self.status(env, state).await?;
        if status.state != ContainerState::Running {
            return Err(RuntimeError::ContainerNotRunning {
                name: state.container_name.clone(),
            }
            .into());
        }

        let mut envs = Vec::new();
        for (name, value) in &config.envs {
            if value.override_on_enter {
                if let Some(resolved) = resolve_env_value(env, value) {
                    envs.push((name.clone(), resolved));
                }
            }
        }

        let spec = ExecSpec {
            container: state.container_name.clone(),
            workdir: Some(config.workdir.clone()),
            envs,
            command: command.to_vec(),
        };
        self.backend.exec(env, &spec).await
    }

    /// Query the project container's status
    pub async fn status(&self, env: &Env, state: &ProjectState) -> Result<ContainerStatus> {
        self.backend
            .query(env, &state.project_id, &state.container_name)
            .await
    }

    /// Down followed by up. Experimental: running processes are killed.
    pub async fn reload(
        &self,
        env: &Env,
        config: &ProjectConfig,
        state: &ProjectState,
        plan: &MountPlan,
        sync: &SyncManager,
    ) -> Result<UpOutcome> {
        warn!("Reload is experimental; processes inside the container will be killed");
        self.down(env, state, sync).await?;
        self.up(env, config, state, plan, sync).await
    }

    /// All containers this runtime manages for the tool
    pub async fn list(&self, env: &Env) -> Result<Vec<ContainerSummary>> {
        self.backend.list(env).await
    }

    pub async fn container_ip(&self, env: &Env, container: &str) -> Result<String> {
        self.backend.container_ip(env, container).await
    }

    pub async fn rootless(&self, env: &Env) -> Result<bool> {
        self.backend.rootless(env).await
    }

    pub async fn engine_operating_system(&self, env: &Env) -> Result<String> {
        self.backend.engine_operating_system(env).await
    }

    pub async fn available(&self, env: &Env) -> std::result::Result<(), RuntimeError> {
        self.backend.available(env).await
    }

    fn create_spec(
        &self,
        env: &Env,
        config: &ProjectConfig,
        state: &ProjectState,
        plan: &MountPlan,
    ) -> CreateSpec {
        let labels = vec![
            (LABEL_PROJECT_ID.to_string(), state.project_id.clone()),
            (
                LABEL_PROJECT_PATH.to_string(),
                env.project_dir.display().to_string(),
            ),
        ];

        let mut envs = Vec::new();
        for (name, value) in &config.envs {
            if !value.override_on_enter {
                if let Some(resolved) = resolve_env_value(env, value) {
                    envs.push((name.clone(), resolved));
                }
            }
        }

        let binds = plan
            .bind_entries()
            .map(|planned| BindMount {
                source: resolve_source(env, &planned.mount.source),
                target: planned.mount.target.clone(),
                readonly: planned.mount.readonly,
            })
            .collect();

        CreateSpec {
            name: state.container_name.clone(),
            image: config.image.clone(),
            workdir: config.workdir.clone(),
            labels,
            envs,
            memory: if config.resources.memory.is_empty() {
                None
            } else {
                Some(config.resources.memory.clone())
            },
            cpus: if config.resources.cpus > 0.0 {
                Some(config.resources.cpus)
            } else {
                None
            },
            cap_add: config.caps.add.clone(),
            cap_drop: config.caps.drop.clone(),
            binds,
            command: KEEP_ALIVE_COMMAND.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Resolve an env value: literals pass through, `${NAME}` references read
/// the host environment; an unset reference yields nothing
pub(crate) fn resolve_env_value(env: &Env, value: &EnvValue) -> Option<String> {
    match value.reference() {
        Some(name) => env.host_var(name),
        None => Some(value.value.clone()),
    }
}

/// Resolve a mount source against the project directory
pub(crate) fn resolve_source(env: &Env, source: &str) -> String {
    if source == "." {
        env.project_dir.display().to_string()
    } else if std::path::Path::new(source).is_absolute() {
        source.to_string()
    } else {
        env.project_dir.join(source).display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_kind_round_trip() {
        for kind in [
            RuntimeKind::Docker,
            RuntimeKind::Podman,
            RuntimeKind::AppleContainer,
        ] {
            assert_eq!(kind.as_str().parse::<RuntimeKind>().unwrap(), kind);
        }
        assert!("lxc".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn test_map_state() {
        assert_eq!(map_state("running"), ContainerState::Running);
        assert_eq!(map_state("exited"), ContainerState::Stopped);
        assert_eq!(map_state("stopped"), ContainerState::Stopped);
        assert_eq!(map_state("restarting"), ContainerState::Unknown);
        assert_eq!(map_state("created"), ContainerState::Unknown);
    }

    #[test]
    fn test_resolve_source() {
        let env = Env::new(
            std::sync::Arc::new(crate::env::mock::MemFs::new()),
            std::sync::Arc::new(crate::env::mock::ScriptedRunner::new()),
            "/home/dev/proj",
        );
        assert_eq!(resolve_source(&env, "."), "/home/dev/proj");
        assert_eq!(resolve_source(&env, "data"), "/home/dev/proj/data");
        assert_eq!(resolve_source(&env, "/abs"), "/abs");
    }

    #[test]
    fn test_resolve_env_value() {
        let env = Env::new(
            std::sync::Arc::new(crate::env::mock::MemFs::new()),
            std::sync::Arc::new(crate::env::mock::ScriptedRunner::new()),
            "/p",
        )
        .with_host_var("EDITOR", "vim");

        let literal = EnvValue {
            value: "dev".to_string(),
            override_on_enter: false,
        };
        assert_eq!(resolve_env_value(&env, &literal).unwrap(), "dev");

        let reference = EnvValue {
            value: "${EDITOR}".to_string(),
            override_on_enter: true,
        };
        assert_eq!(resolve_env_value(&env, &reference).unwrap(), "vim");

        let unset = EnvValue {
            value: "${DEFINITELY_UNSET_VARIABLE_42}".to_string(),
            override_on_enter: true,
        };
        assert_eq!(resolve_env_value(&env, &unset), None);
    }
}
