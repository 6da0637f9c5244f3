//! Verb orchestration
//!
//! Composes the loader, runtime, platform decision, sync manager and
//! firewall manager into the top-level verbs. The `up` sequence and its
//! failure policy follow a strict order: everything through the rebuild
//! decision is fatal, while a firewall failure after the container is
//! already running degrades to a warning (an unreachable rollback would be
//! worse than the inconsistency).

use crate::config::ProjectConfig;
use crate::env::Env;
use crate::errors::{AlcatrazError, Result, RuntimeError};
use crate::firewall::{self, FirewallKind, FirewallManager};
use crate::helper::HelperManager;
use crate::loader;
use crate::platform;
use crate::runtime::{ContainerStatus, ContainerSummary, Runtime, RuntimeKind};
use crate::state::{AppliedConfig, ProjectState, StateStore};
use crate::sync::{self, ConflictInfo, ConflictMonitor, SyncManager};
use crate::transaction::Transaction;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Asks the user yes/no questions. The CLI front-end supplies a terminal
/// implementation; non-interactive contexts decline everything.
pub trait Prompter: Send + Sync {
    fn confirm(&self, message: &str) -> bool;
}

/// Declines every question
#[derive(Debug, Default)]
pub struct DeclineAll;

impl Prompter for DeclineAll {
    fn confirm(&self, _message: &str) -> bool {
        false
    }
}

/// Accepts every question
#[derive(Debug, Default)]
pub struct AcceptAll;

impl Prompter for AcceptAll {
    fn confirm(&self, _message: &str) -> bool {
        true
    }
}

/// Options for `up` (and `reload`)
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    /// Rebuild without prompting when the configuration drifted
    pub force_rebuild: bool,
    /// Fail instead of prompting
    pub non_interactive: bool,
}

/// What `up` produced; the front-end renders warnings and the conflict
/// banner from this
#[derive(Debug)]
pub struct UpSummary {
    pub container_name: String,
    pub runtime: &'static str,
    /// False when the container was already running
    pub created: bool,
    pub warnings: Vec<String>,
    /// Conflicts known at startup, for the banner
    pub conflicts: Vec<ConflictInfo>,
    /// The running refresh loop; stop it at the orchestration boundary
    pub monitor: ConflictMonitor,
}

/// Composes the core subsystems for each top-level verb
pub struct Orchestrator {
    env: Arc<Env>,
    prompter: Box<dyn Prompter>,
    sync: SyncManager,
}

impl Orchestrator {
    pub fn new(env: Arc<Env>, prompter: Box<dyn Prompter>) -> Self {
        Orchestrator {
            env,
            prompter,
            sync: SyncManager::new(),
        }
    }

    fn config_path(&self) -> PathBuf {
        loader::discover_config(&self.env.project_dir)
    }

    fn load_config(&self) -> Result<ProjectConfig> {
        loader::load_project_config(self.env.fs.as_ref(), &self.config_path())
    }

    /// Bring the project sandbox up
    #[instrument(skip_all)]
    pub async fn up(&self, options: &UpOptions) -> Result<UpSummary> {
        let env = self.env.as_ref();
        let mut warnings = Vec::new();

        // 1. Load and merge the configuration
        let config = self.load_config()?;

        // 2. Select a runtime and check mount constraints
        let runtime = Runtime::select(env, &config).await?;

        // 3. Detect the platform once; memoized on the env
        let detected_platform = platform::detect(env, &runtime).await?;
        let plan = platform::plan_mounts(detected_platform, &config);
        platform::validate_plan(env, &runtime, &config, &plan, &self.sync).await?;

        // 4. Load or create the project identity
        let store = StateStore::for_project(&env.project_dir);
        let mut state = store
            .load(env.fs.as_ref())?
            .unwrap_or_else(ProjectState::new);

        // 5. Make sure the firewall helper is usable before touching rules
        let wants_isolation = config.network.wants_isolation();
        let firewall_backend = match (firewall::detect(env).await, wants_isolation) {
            (Some(kind), true) => {
                if self.ensure_helper(kind, options, &mut warnings).await? {
                    Some(kind)
                } else {
                    None
                }
            }
            // Kept for fragment cleanup even when isolation is off
            (Some(kind), false) => Some(kind),
            (None, true) => {
                warnings.push(firewall::warn_isolation_unavailable());
                None
            }
            (None, false) => None,
        };

        // 6. Drift detection and the rebuild decision
        if state.drifted(&config, runtime.name()) {
            let approved = options.force_rebuild
                || (!options.non_interactive
                    && self.prompter.confirm(
                        "The configuration changed since the container was built; rebuild now?",
                    ));
            if !approved {
                return Err(AlcatrazError::DriftRebuildDeclined);
            }
            // Tear down through the runtime recorded at the previous up, so
            // a runtime switch does not orphan the old container
            let recorded = match state.runtime.parse::<RuntimeKind>() {
                Ok(kind) => Runtime::new(kind),
                Err(_) => Runtime::new(runtime.kind()),
            };
            debug!(recorded = recorded.name(), "Rebuilding drifted container");
            recorded.down(env, &state, &self.sync).await?;
        }
        state.runtime = runtime.name().to_string();
        state.last_config = Some(AppliedConfig::of(&config));
        let mut txn = Transaction::new();
        store.stage_save(&state, &mut txn);
        txn.commit(env).await?;

        // 7. Container up (idempotent)
        let outcome = runtime.up(env, &config, &state, &plan, &self.sync).await?;
        warnings.extend(outcome.warnings);

        // 8. Firewall rules; non-fatal because the container already runs
        if let Some(kind) = firewall_backend {
            if let Err(e) = self
                .apply_firewall(kind, &runtime, &config, &state, &outcome.container_id)
                .await
            {
                let message = format!(
                    "Firewall apply failed; network isolation is NOT in effect: {}",
                    e
                );
                warn!("{}", message);
                warnings.push(message);
            }
        }

        // 9. Start the conflict refresh loop and feed the banner
        let monitor = sync::start_refresh_loop(
            self.env.clone(),
            self.sync.clone(),
            state.project_id.clone(),
        );
        let conflicts = sync::ConflictCache::for_project(&env.project_dir).read(env.fs.as_ref());

        info!(container = %state.container_name, runtime = runtime.name(), "Sandbox is up");
        Ok(UpSummary {
            container_name: state.container_name,
            runtime: runtime.name(),
            created: outcome.created,
            warnings,
            conflicts,
            monitor,
        })
    }

    /// True when isolation can proceed (helper present or just installed);
    /// false when the user declined interactively
    async fn ensure_helper(
        &self,
        kind: FirewallKind,
        options: &UpOptions,
        warnings: &mut Vec<String>,
    ) -> Result<bool> {
        let env = self.env.as_ref();
        let helper = HelperManager::new(kind);
        let status = helper.status(env).await?;
        if status.installed && !status.needs_update {
            return Ok(true);
        }

        if options.non_interactive {
            return Err(AlcatrazError::HelperInstallDeclined);
        }
        let question = if status.needs_update {
            "The alcatraz firewall helper is outdated; update it now (requires sudo)?"
        } else {
            "The alcatraz firewall helper is not installed; install it now (requires sudo)?"
        };
        if self.prompter.confirm(question) {
            helper.install(env).await?;
            Ok(true)
        } else {
            let message =
                "Firewall helper not installed; network isolation is NOT in effect".to_string();
            warn!("{}", message);
            warnings.push(message);
            Ok(false)
        }
    }

    async fn apply_firewall(
        &self,
        kind: FirewallKind,
        runtime: &Runtime,
        config: &ProjectConfig,
        state: &ProjectState,
        container_id: &str,
    ) -> Result<()> {
        let env = self.env.as_ref();
        let mut manager = FirewallManager::new(kind);
        let mut txn = Transaction::new();

        // Fragments belonging to containers the runtime still knows about
        // stay; everything else is stale
        let mut active: Vec<String> = runtime
            .list(env)
            .await?
            .into_iter()
            .filter_map(|c| c.project_id)
            .collect();
        active.push(state.project_id.clone());
        manager.stage_clean_stale(env, &mut txn, &active);

        let container_ip = if config.network.wants_isolation() {
            runtime.container_ip(env, container_id).await?
        } else {
            String::new()
        };
        manager.stage_rules(
            env,
            &mut txn,
            &state.project_id,
            container_id,
            &container_ip,
            &config.network,
        );

        if txn.is_empty() {
            return Ok(());
        }
        let reload = manager.reload_action();
        txn.commit(env).await?;
        manager.mark_committed();
        reload.run(env).await?;
        manager.mark_loaded();
        Ok(())
    }

    /// Tear the sandbox down: container, sync sessions, firewall fragment,
    /// state file, conflict cache
    #[instrument(skip_all)]
    pub async fn down(&self) -> Result<()> {
        let env = self.env.as_ref();
        let store = StateStore::for_project(&env.project_dir);
        let Some(state) = store.load(env.fs.as_ref())? else {
            info!("No sandbox state; nothing to tear down");
            return Ok(());
        };

        let kind = state
            .runtime
            .parse::<RuntimeKind>()
            .unwrap_or(RuntimeKind::Docker);
        let runtime = Runtime::new(kind);
        runtime.down(env, &state, &self.sync).await?;

        let mut txn = Transaction::new();
        let mut reload = None;
        if let Some(fw_kind) = firewall::detect(env).await {
            let mut manager = FirewallManager::new(fw_kind);
            manager.stage_teardown(env, &mut txn, &state.project_id);
            reload = Some(manager.reload_action());
        }
        store.stage_remove(&mut txn);
        txn.delete(
            sync::ConflictCache::for_project(&env.project_dir).path(),
            false,
        );
        txn.commit(env).await?;

        if let Some(reload) = reload {
            if let Err(e) = reload.run(env).await {
                warn!("Firewall reload after teardown failed: {}", e);
            }
        }
        info!("Sandbox torn down");
        Ok(())
    }

    /// Exec into the running container. An empty command falls back to the
    /// configured enter command, then to a plain shell.
    #[instrument(skip_all)]
    pub async fn exec(&self, command: &[String]) -> Result<i32> {
        let env = self.env.as_ref();
        let config = self.load_config()?;
        let store = StateStore::for_project(&env.project_dir);
        let Some(state) = store.load(env.fs.as_ref())? else {
            return Err(RuntimeError::ContainerNotRunning {
                name: project_label(env),
            }
            .into());
        };

        let runtime = self.runtime_for(&state, &config).await?;
        let command: Vec<String> = if command.is_empty() {
            match &config.commands.enter {
                Some(enter) if !enter.command.is_empty() => vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    enter.command.clone(),
                ],
                _ => vec!["sh".to_string()],
            }
        } else {
            command.to_vec()
        };
        runtime.exec(env, &config, &state, &command).await
    }

    /// Query the container status; a missing project maps to NotFound
    #[instrument(skip_all)]
    pub async fn status(&self) -> Result<ContainerStatus> {
        let env = self.env.as_ref();
        let store = StateStore::for_project(&env.project_dir);
        let Some(state) = store.load(env.fs.as_ref())? else {
            return Ok(ContainerStatus::not_found());
        };
        let config = self.load_config()?;
        let runtime = self.runtime_for(&state, &config).await?;
        runtime.status(env, &state).await
    }

    /// Down then up with the current configuration. Experimental: running
    /// processes are killed.
    #[instrument(skip_all)]
    pub async fn reload(&self, options: &UpOptions) -> Result<UpSummary> {
        let env = self.env.as_ref();
        let store = StateStore::for_project(&env.project_dir);
        if let Some(state) = store.load(env.fs.as_ref())? {
            let kind = state
                .runtime
                .parse::<RuntimeKind>()
                .unwrap_or(RuntimeKind::Docker);
            Runtime::new(kind).down(env, &state, &self.sync).await?;
        }
        self.up(options).await
    }

    /// All sandbox containers across the backends usable on this host
    #[instrument(skip_all)]
    pub async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let env = self.env.as_ref();
        let candidates: Vec<RuntimeKind> = match env.os() {
            "linux" => vec![RuntimeKind::Podman, RuntimeKind::Docker],
            "macos" => vec![RuntimeKind::Docker, RuntimeKind::AppleContainer],
            _ => vec![RuntimeKind::Docker],
        };

        let mut rows = Vec::new();
        for kind in candidates {
            let runtime = Runtime::new(kind);
            if runtime.available(env).await.is_err() {
                continue;
            }
            match runtime.list(env).await {
                Ok(found) => rows.extend(found),
                Err(e) => warn!(runtime = kind.as_str(), "List failed: {}", e),
            }
        }
        Ok(rows)
    }

    /// The runtime recorded in state, falling back to selection
    async fn runtime_for(&self, state: &ProjectState, config: &ProjectConfig) -> Result<Runtime> {
        match state.runtime.parse::<RuntimeKind>() {
            Ok(kind) => Ok(Runtime::new(kind)),
            Err(_) => Runtime::select(self.env.as_ref(), config).await,
        }
    }
}

fn project_label(env: &Env) -> String {
    env.project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| env.project_dir.display().to_string())
}
