//! Managed file-sync sessions
//!
//! When a mount cannot be realized as a bind mount (see [`crate::platform`]),
//! a mutagen session mirrors the host path into the container, honoring the
//! mount's exclude patterns. One session exists per sync-managed mount, named
//! `sandbox-<projectID>-<mountIndex>`.
//!
//! A freshly created session spends a few seconds connecting, during which
//! flushes fail with "not currently able to synchronize"; that specific
//! failure is retried for up to thirty one-second-spaced attempts while any
//! other failure surfaces immediately. Conflict detection is observational
//! only: a background loop refreshes a per-project cache file every thirty
//! seconds and an external collaborator renders the banner.

use crate::env::{CommandOutput, Env, FileSystem};
use crate::errors::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Minimum mutagen version on macOS; older releases carry a session
/// handshake bug against Docker Desktop's VM
pub const MIN_MACOS_VERSION: &str = "0.17.1";

/// Per-project conflict cache file, beside the configuration
pub const CONFLICT_CACHE_FILE_NAME: &str = ".alcatraz-conflicts.json";

const FLUSH_ATTEMPTS: usize = 30;
const FLUSH_RETRY_DELAY: Duration = Duration::from_secs(1);
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const REFRESH_TICK_TIMEOUT: Duration = Duration::from_secs(10);

/// The connecting-session failure that is worth waiting out
const NOT_READY_MARKER: &str = "not currently able to synchronize";

/// Session name for one sync-managed mount
pub fn session_name(project_id: &str, mount_index: usize) -> String {
    format!("sandbox-{}-{}", project_id, mount_index)
}

/// Name prefix shared by all of a project's sessions
pub fn session_prefix(project_id: &str) -> String {
    format!("sandbox-{}-", project_id)
}

/// One detected conflict, as cached for the banner renderer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub path: String,
    /// Descriptor of the host side ("modified", "deleted", "unchanged")
    pub local_state: String,
    /// Descriptor of the container side
    pub container_state: String,
}

/// Wrapper over the external sync CLI
#[derive(Debug, Clone)]
pub struct SyncManager {
    program: String,
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncManager {
    pub fn new() -> Self {
        SyncManager {
            program: "mutagen".to_string(),
        }
    }

    async fn run(&self, env: &Env, args: Vec<String>) -> io::Result<CommandOutput> {
        env.runner.run(&self.program, &args).await
    }

    /// Check the sync binary is present and, on macOS, new enough
    #[instrument(skip_all)]
    pub async fn ensure_available(&self, env: &Env, enforce_minimum: bool) -> Result<()> {
        let output = match self.run(env, vec!["version".to_string()]).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SyncError::Unavailable {
                    reason: format!("the '{}' binary was not found; install mutagen", self.program),
                }
                .into())
            }
            Err(e) => {
                return Err(SyncError::Unavailable {
                    reason: e.to_string(),
                }
                .into())
            }
            Ok(output) => output,
        };
        if !output.success() {
            return Err(SyncError::Unavailable {
                reason: output.stderr.trim().to_string(),
            }
            .into());
        }

        if enforce_minimum {
            let found = output.stdout.trim();
            match semver::Version::parse(found) {
                Ok(version) => {
                    let minimum =
                        semver::Version::parse(MIN_MACOS_VERSION).expect("static version");
                    if version < minimum {
                        return Err(SyncError::VersionUnsupported {
                            found: found.to_string(),
                            minimum: MIN_MACOS_VERSION.to_string(),
                        }
                        .into());
                    }
                }
                Err(_) => {
                    debug!(found, "Could not parse sync version; skipping minimum check");
                }
            }
        }
        Ok(())
    }

    /// Create a session mirroring `source` into the container path
    #[instrument(skip_all, fields(session = name))]
    pub async fn create_session(
        &self,
        env: &Env,
        name: &str,
        source: &str,
        runtime_name: &str,
        container: &str,
        target: &str,
        ignores: &[String],
    ) -> Result<()> {
        let mut args = vec![
            "sync".to_string(),
            "create".to_string(),
            format!("--name={}", name),
        ];
        for pattern in ignores {
            args.push(format!("--ignore={}", pattern));
        }
        args.push(source.to_string());
        args.push(format!("{}://{}{}", runtime_name, container, target));

        let output = self.run(env, args).await.map_err(|e| SyncError::Session {
            session: name.to_string(),
            message: e.to_string(),
        })?;
        if !output.success() {
            return Err(SyncError::Session {
                session: name.to_string(),
                message: output.stderr.trim().to_string(),
            }
            .into());
        }
        debug!("Sync session created");
        Ok(())
    }

    /// Flush a session, waiting out the connect window.
    ///
    /// "Not currently able to synchronize" is retried with one-second
    /// spacing for up to thirty attempts; any other failure surfaces
    /// immediately.
    #[instrument(skip_all, fields(session = name))]
    pub async fn flush(&self, env: &Env, name: &str) -> Result<()> {
        for attempt in 1..=FLUSH_ATTEMPTS {
            let output = self
                .run(
                    env,
                    vec!["sync".to_string(), "flush".to_string(), name.to_string()],
                )
                .await
                .map_err(|e| SyncError::Session {
                    session: name.to_string(),
                    message: e.to_string(),
                })?;

            if output.success() {
                return Ok(());
            }

            let text = format!("{}\n{}", output.stdout, output.stderr);
            if text.contains(NOT_READY_MARKER) && attempt < FLUSH_ATTEMPTS {
                debug!(attempt, "Session still connecting; retrying flush");
                tokio::time::sleep(FLUSH_RETRY_DELAY).await;
                continue;
            }

            return Err(SyncError::Session {
                session: name.to_string(),
                message: output.stderr.trim().to_string(),
            }
            .into());
        }
        unreachable!("flush loop returns within {} attempts", FLUSH_ATTEMPTS)
    }

    /// All session names known to the sync CLI
    async fn list_session_names(&self, env: &Env) -> Result<Vec<String>> {
        let args = vec![
            "sync".to_string(),
            "list".to_string(),
            "--template".to_string(),
            "{{range .}}{{.Name}}\n{{end}}".to_string(),
        ];
        let output = match self.run(env, args).await {
            // No sync binary means no sessions to speak of
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SyncError::Session {
                    session: "list".to_string(),
                    message: e.to_string(),
                }
                .into())
            }
            Ok(output) => output,
        };
        if !output.success() {
            return Err(SyncError::Session {
                session: "list".to_string(),
                message: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Session names belonging to one project
    pub async fn list_project_sessions(&self, env: &Env, project_id: &str) -> Result<Vec<String>> {
        let prefix = session_prefix(project_id);
        Ok(self
            .list_session_names(env)
            .await?
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect())
    }

    /// Terminate every session of a project. Idempotent: sessions that are
    /// already gone are success.
    #[instrument(skip_all)]
    pub async fn terminate_project_sessions(&self, env: &Env, project_id: &str) -> Result<()> {
        for name in self.list_project_sessions(env, project_id).await? {
            let output = self
                .run(
                    env,
                    vec![
                        "sync".to_string(),
                        "terminate".to_string(),
                        name.to_string(),
                    ],
                )
                .await
                .map_err(|e| SyncError::Session {
                    session: name.clone(),
                    message: e.to_string(),
                })?;
            if !output.success() && !output.stderr.contains("no matching sessions") {
                return Err(SyncError::Session {
                    session: name,
                    message: output.stderr.trim().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Query one session's conflict descriptors
    pub async fn session_conflicts(&self, env: &Env, name: &str) -> Result<Vec<ConflictInfo>> {
        let args = vec![
            "sync".to_string(),
            "list".to_string(),
            name.to_string(),
            "--template".to_string(),
            "{{json .}}".to_string(),
        ];
        let output = self.run(env, args).await.map_err(|e| SyncError::Session {
            session: name.to_string(),
            message: e.to_string(),
        })?;
        if !output.success() {
            return Err(SyncError::Session {
                session: name.to_string(),
                message: output.stderr.trim().to_string(),
            }
            .into());
        }

        let document: serde_json::Value =
            serde_json::from_str(output.stdout.trim()).map_err(|e| SyncError::Session {
                session: name.to_string(),
                message: format!("failed to parse session JSON: {}", e),
            })?;
        let session = match &document {
            serde_json::Value::Array(items) => items.first().cloned().unwrap_or_default(),
            other => other.clone(),
        };

        let Some(conflicts) = session.get("conflicts").and_then(|v| v.as_array()) else {
            return Ok(Vec::new());
        };
        Ok(conflicts.iter().map(parse_conflict).collect())
    }
}

fn parse_conflict(conflict: &serde_json::Value) -> ConflictInfo {
    let path = conflict
        .get("root")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| {
            conflict
                .pointer("/alphaChanges/0/path")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or_default();

    ConflictInfo {
        path,
        local_state: describe_changes(conflict.get("alphaChanges")),
        container_state: describe_changes(conflict.get("betaChanges")),
    }
}

fn describe_changes(changes: Option<&serde_json::Value>) -> String {
    match changes.and_then(|v| v.as_array()) {
        None => "unchanged".to_string(),
        Some(changes) if changes.is_empty() => "unchanged".to_string(),
        Some(changes) => {
            if changes.iter().any(|c| c.get("new").map_or(true, |n| n.is_null())) {
                "deleted".to_string()
            } else {
                "modified".to_string()
            }
        }
    }
}

/// Read/write access to the per-project conflict cache file
#[derive(Debug, Clone)]
pub struct ConflictCache {
    path: PathBuf,
}

impl ConflictCache {
    pub fn for_project(project_dir: &Path) -> Self {
        ConflictCache {
            path: project_dir.join(CONFLICT_CACHE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The most recently cached conflicts; missing or garbled caches read
    /// as empty
    pub fn read(&self, fs: &dyn FileSystem) -> Vec<ConflictInfo> {
        fs.read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    pub fn write(&self, fs: &dyn FileSystem, conflicts: &[ConflictInfo]) -> io::Result<()> {
        let contents = serde_json::to_vec_pretty(conflicts).unwrap_or_default();
        fs.write(&self.path, &contents)
    }
}

/// Handle to the per-project periodic refresh loop
#[derive(Debug)]
pub struct ConflictMonitor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
    cache: ConflictCache,
    env: Arc<Env>,
}

impl ConflictMonitor {
    /// Cooperative stop; returns the most recent cached conflict list
    pub async fn stop(self) -> Vec<ConflictInfo> {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
        self.cache.read(self.env.fs.as_ref())
    }
}

/// Start the periodic refresh loop for a project.
///
/// Wakes every thirty seconds with a ten-second per-tick timeout; each tick
/// lists the project's sessions, queries their conflicts and rewrites the
/// cache file. One loop per project, started at `up`.
pub fn start_refresh_loop(env: Arc<Env>, sync: SyncManager, project_id: String) -> ConflictMonitor {
    let cache = ConflictCache::for_project(&env.project_dir);
    let (stop, mut stop_rx) = watch::channel(false);
    let loop_env = env.clone();
    let loop_cache = cache.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let refresh = refresh_once(&loop_env, &sync, &project_id, &loop_cache);
                    if tokio::time::timeout(REFRESH_TICK_TIMEOUT, refresh).await.is_err() {
                        warn!(%project_id, "Conflict refresh tick timed out");
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(%project_id, "Conflict refresh loop stopped");
    });

    ConflictMonitor {
        stop,
        handle,
        cache,
        env,
    }
}

async fn refresh_once(env: &Env, sync: &SyncManager, project_id: &str, cache: &ConflictCache) {
    let mut conflicts = Vec::new();
    let sessions = match sync.list_project_sessions(env, project_id).await {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!("Conflict refresh could not list sessions: {}", e);
            return;
        }
    };
    for session in sessions {
        match sync.session_conflicts(env, &session).await {
            Ok(found) => conflicts.extend(found),
            Err(e) => warn!(%session, "Conflict query failed: {}", e),
        }
    }
    if let Err(e) = cache.write(env.fs.as_ref(), &conflicts) {
        warn!("Failed to write conflict cache: {}", e);
    }
}
