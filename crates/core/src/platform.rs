//! Platform detection and per-mount strategy decision
//!
//! Bind mounts are native-speed on Linux and close to native on OrbStack,
//! but notoriously slow on Docker Desktop; managed sync restores acceptable
//! throughput there. Excludes are a separate forcing function because a bind
//! mount cannot selectively shadow paths. The decision table lives in
//! [`should_use_sync`].
//!
//! On non-Linux hosts the platform is determined by the container engine's
//! reported OperatingSystem. Detection results are memoized on the [`Env`]
//! instance so repeated calls do not shell out again; tests build fresh envs
//! and never observe each other's cache.

use crate::config::{Mount, ProjectConfig};
use crate::env::Env;
use crate::errors::{Result, SyncError};
use crate::runtime::{Runtime, RuntimeKind};
use crate::sync::SyncManager;
use std::fmt;
use tracing::{debug, instrument};

/// Host platforms with distinct mount performance profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Native Linux; bind mounts are kernel-native
    Linux,
    /// macOS with OrbStack (75-95% of native bind performance)
    MacOsOrbStack,
    /// macOS with Docker Desktop (bind mounts are slow)
    MacOsDockerDesktop,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Linux => "linux",
            Platform::MacOsOrbStack => "macos/orbstack",
            Platform::MacOsDockerDesktop => "macos/docker-desktop",
        };
        write!(f, "{}", s)
    }
}

/// Detect the platform, memoized per env instance
#[instrument(skip_all)]
pub async fn detect(env: &Env, runtime: &Runtime) -> Result<Platform> {
    if let Some(platform) = env.cached_platform() {
        return Ok(platform);
    }

    let platform = if env.os() == "linux" {
        Platform::Linux
    } else {
        let engine_os = runtime.engine_operating_system(env).await?;
        debug!(%engine_os, "Engine reported operating system");
        if engine_os.to_lowercase().contains("orbstack") {
            Platform::MacOsOrbStack
        } else {
            Platform::MacOsDockerDesktop
        }
    };

    debug!(%platform, "Detected platform");
    env.cache_platform(platform);
    Ok(platform)
}

/// Whether a mount should use a managed sync session instead of a bind mount
pub fn should_use_sync(platform: Platform, has_excludes: bool) -> bool {
    match platform {
        Platform::Linux => has_excludes,
        Platform::MacOsDockerDesktop => true,
        Platform::MacOsOrbStack => has_excludes,
    }
}

/// How one mount is realized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStrategy {
    /// Kernel-level bind mount passed to the container runtime
    Bind,
    /// Managed file-sync session mirroring the host path
    Sync,
}

/// One mount with its decided strategy
#[derive(Debug, Clone)]
pub struct PlannedMount {
    /// Index within `ProjectConfig::mounts`; also the sync session suffix
    pub index: usize,
    pub mount: Mount,
    pub strategy: MountStrategy,
}

/// The per-mount strategy decisions for one `up`
#[derive(Debug, Clone, Default)]
pub struct MountPlan {
    pub entries: Vec<PlannedMount>,
}

impl MountPlan {
    /// Mounts realized as bind mounts, in configuration order
    pub fn bind_entries(&self) -> impl Iterator<Item = &PlannedMount> {
        self.entries
            .iter()
            .filter(|e| e.strategy == MountStrategy::Bind)
    }

    /// Mounts realized as sync sessions, in configuration order
    pub fn sync_entries(&self) -> impl Iterator<Item = &PlannedMount> {
        self.entries
            .iter()
            .filter(|e| e.strategy == MountStrategy::Sync)
    }

    /// Whether any mount needs the external sync binary
    pub fn needs_sync(&self) -> bool {
        self.sync_entries().next().is_some()
    }
}

/// Decide the strategy for every mount of a configuration
pub fn plan_mounts(platform: Platform, config: &ProjectConfig) -> MountPlan {
    let entries = config
        .mounts
        .iter()
        .enumerate()
        .map(|(index, mount)| {
            let strategy = if should_use_sync(platform, !mount.exclude.is_empty()) {
                MountStrategy::Sync
            } else {
                MountStrategy::Bind
            };
            PlannedMount {
                index,
                mount: mount.clone(),
                strategy,
            }
        })
        .collect();
    MountPlan { entries }
}

/// Validate that the plan is realizable on this host.
///
/// Rootless Podman cannot honor excludes at all; a plan with sync-managed
/// mounts additionally requires the sync binary (with the macOS version
/// gate).
#[instrument(skip_all)]
pub async fn validate_plan(
    env: &Env,
    runtime: &Runtime,
    config: &ProjectConfig,
    plan: &MountPlan,
    sync: &SyncManager,
) -> Result<()> {
    if config.has_excludes()
        && runtime.kind() == RuntimeKind::Podman
        && runtime.rootless(env).await?
    {
        return Err(SyncError::RootlessPodmanExcludes.into());
    }
    if plan.needs_sync() {
        sync.ensure_available(env, env.os() == "macos").await?;
    }
    Ok(())
}
