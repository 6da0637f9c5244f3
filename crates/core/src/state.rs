//! Per-project persisted state
//!
//! A JSON dot-file beside the configuration carries the project's stable
//! identity (project ID, container name) plus the runtime and configuration
//! subset last applied to a container, used for drift detection. The
//! container name is derived from the project ID rather than the directory
//! path, so it survives project renames.

use crate::config::{
    Capabilities, CommandValue, Mount, NetworkPolicy, ProjectConfig, Resources, RuntimeChoice,
};
use crate::env::FileSystem;
use crate::errors::{Result, StateError};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// State dot-file name, adjacent to the configuration file
pub const STATE_FILE_NAME: &str = ".alcatraz-state.json";

/// Prefix of every managed container name
const CONTAINER_NAME_PREFIX: &str = "alca";

/// The configuration subset that participates in drift detection.
///
/// `commands.enter` and `envs` are deliberately excluded: changing how a
/// shell is entered or which variables are re-exported does not require a
/// rebuild. A runtime change is part of the subset so switching engines
/// forces a rebuild through the previously recorded one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedConfig {
    pub image: String,
    pub workdir: String,
    pub runtime: RuntimeChoice,
    pub mounts: Vec<Mount>,
    /// Stored as a plain string by older versions; both shapes unmarshal
    #[serde(default, deserialize_with = "command_compat::deserialize")]
    pub up: Option<CommandValue>,
    pub resources: Resources,
    pub caps: Capabilities,
    pub network: NetworkPolicy,
}

impl AppliedConfig {
    /// Capture the drift subset of a configuration.
    ///
    /// Exhaustive destructuring: adding a field to [`ProjectConfig`] fails to
    /// compile here until it is explicitly routed into or out of drift.
    pub fn of(config: &ProjectConfig) -> Self {
        let ProjectConfig {
            image,
            workdir,
            runtime,
            mounts,
            commands,
            envs: _envs,
            resources,
            caps,
            network,
        } = config;
        AppliedConfig {
            image: image.clone(),
            workdir: workdir.clone(),
            runtime: *runtime,
            mounts: mounts.clone(),
            up: commands.up.clone(),
            resources: resources.clone(),
            caps: caps.clone(),
            network: network.clone(),
        }
    }
}

mod command_compat {
    use super::CommandValue;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Compat {
        Plain(String),
        Structured(CommandValue),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<CommandValue>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Compat>::deserialize(deserializer)?;
        Ok(value.map(|v| match v {
            Compat::Plain(command) => CommandValue {
                command,
                append: false,
            },
            Compat::Structured(cmd) => cmd,
        }))
    }
}

/// Persisted per-project identity and last-applied configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    /// Stable UUID minted on first `up`
    pub project_id: String,
    /// Stable container name derived from the project ID
    pub container_name: String,
    /// Name of the runtime last used to bring the container up
    #[serde(default)]
    pub runtime: String,
    /// Drift-detection subset of the last applied configuration
    #[serde(default)]
    pub last_config: Option<AppliedConfig>,
}

impl ProjectState {
    /// Mint a fresh identity for a project's first `up`
    pub fn new() -> Self {
        let project_id = uuid::Uuid::new_v4().to_string();
        let container_name = container_name_for(&project_id);
        ProjectState {
            project_id,
            container_name,
            runtime: String::new(),
            last_config: None,
        }
    }

    /// Whether the configuration or runtime drifted since the last `up`
    pub fn drifted(&self, config: &ProjectConfig, runtime_name: &str) -> bool {
        match &self.last_config {
            None => false,
            Some(last) => *last != AppliedConfig::of(config) || self.runtime != runtime_name,
        }
    }
}

impl Default for ProjectState {
    fn default() -> Self {
        Self::new()
    }
}

/// The container name for a project ID: `alca-` plus the first 12 hex chars
/// of the ID's SHA-256
pub fn container_name_for(project_id: &str) -> String {
    let digest = Sha256::digest(project_id.as_bytes());
    format!("{}-{}", CONTAINER_NAME_PREFIX, &hex::encode(digest)[..12])
}

/// Load/stage interface for a project's state dot-file
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// The store for a project directory
    pub fn for_project(project_dir: &Path) -> Self {
        StateStore {
            path: project_dir.join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted state; `None` before the first `up`
    #[instrument(skip(self, fs), fields(path = %self.path.display()))]
    pub fn load(&self, fs: &dyn FileSystem) -> Result<Option<ProjectState>> {
        let text = match fs.read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No state file yet");
                return Ok(None);
            }
            Err(e) => {
                return Err(StateError::Io {
                    path: self.path.display().to_string(),
                    source: e,
                }
                .into())
            }
        };
        let state = serde_json::from_str(&text).map_err(|e| StateError::Parse {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(state))
    }

    /// Stage a save onto a transaction; committed at the orchestration
    /// boundary alongside firewall and helper changes
    pub fn stage_save(&self, state: &ProjectState, txn: &mut Transaction) {
        let contents = serde_json::to_vec_pretty(state).unwrap_or_default();
        txn.update(&self.path, contents, Some(0o644), false);
    }

    /// Stage removal of the state file (explicit teardown)
    pub fn stage_remove(&self, txn: &mut Transaction) {
        txn.delete(&self.path, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanRule;
    use crate::env::mock::MemFs;

    fn base_config() -> ProjectConfig {
        let fragment = crate::config::parse_file(
            "image = \"ubuntu\"\nworkdir = \"/w\"\n",
            Path::new("/p/alcatraz.toml"),
        )
        .unwrap()
        .fragment;
        crate::config::normalize(fragment, "p").unwrap()
    }

    #[test]
    fn test_container_name_is_stable_and_prefixed() {
        let name = container_name_for("6b7f0f3a-0000-4000-8000-000000000000");
        assert!(name.starts_with("alca-"));
        assert_eq!(name.len(), "alca-".len() + 12);
        assert_eq!(name, container_name_for("6b7f0f3a-0000-4000-8000-000000000000"));
    }

    #[test]
    fn test_new_state_derives_container_name() {
        let state = ProjectState::new();
        assert_eq!(state.container_name, container_name_for(&state.project_id));
        assert!(state.last_config.is_none());
    }

    #[test]
    fn test_drift_ignores_enter_and_envs() {
        let config = base_config();
        let mut state = ProjectState::new();
        state.runtime = "docker".to_string();
        state.last_config = Some(AppliedConfig::of(&config));

        let mut changed = config.clone();
        changed.commands.enter = Some(CommandValue {
            command: "zsh".to_string(),
            append: false,
        });
        changed.envs.insert(
            "EXTRA".to_string(),
            crate::config::EnvValue {
                value: "1".to_string(),
                override_on_enter: true,
            },
        );
        assert!(!state.drifted(&changed, "docker"));
    }

    #[test]
    fn test_drift_on_image_change() {
        let config = base_config();
        let mut state = ProjectState::new();
        state.runtime = "docker".to_string();
        state.last_config = Some(AppliedConfig::of(&config));

        let mut changed = config.clone();
        changed.image = "debian".to_string();
        assert!(state.drifted(&changed, "docker"));
    }

    #[test]
    fn test_drift_on_runtime_change_alone() {
        let config = base_config();
        let mut state = ProjectState::new();
        state.runtime = "docker".to_string();
        state.last_config = Some(AppliedConfig::of(&config));

        assert!(!state.drifted(&config, "docker"));
        assert!(state.drifted(&config, "podman"));
    }

    #[test]
    fn test_drift_on_network_policy_change() {
        let config = base_config();
        let mut state = ProjectState::new();
        state.runtime = "docker".to_string();
        state.last_config = Some(AppliedConfig::of(&config));

        let mut changed = config.clone();
        changed.network.lan_access.push(LanRule::Wildcard);
        assert!(state.drifted(&changed, "docker"));
    }

    #[test]
    fn test_no_drift_without_last_config() {
        let config = base_config();
        let state = ProjectState::new();
        assert!(!state.drifted(&config, "docker"));
    }

    #[test]
    fn test_state_round_trip_through_store() {
        let fs = MemFs::new();
        let store = StateStore::for_project(Path::new("/p"));
        assert!(store.load(&fs).unwrap().is_none());

        let mut state = ProjectState::new();
        state.runtime = "podman".to_string();
        state.last_config = Some(AppliedConfig::of(&base_config()));

        let mut txn = Transaction::new();
        store.stage_save(&state, &mut txn);
        // Apply the staged write directly: the store never writes by itself
        let op = &txn.ops()[0];
        fs.write(&op.path, &op.contents).unwrap();

        let loaded = store.load(&fs).unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_plain_string_up_command_unmarshals() {
        let fs = MemFs::new().with_file(
            "/p/.alcatraz-state.json",
            r#"{
                "project_id": "abc",
                "container_name": "alca-000000000000",
                "runtime": "docker",
                "last_config": {
                    "image": "u",
                    "workdir": "/w",
                    "runtime": "docker",
                    "mounts": [],
                    "up": "make setup",
                    "resources": { "memory": "", "cpus": 0.0 },
                    "caps": { "add": [], "drop": [] },
                    "network": { "lan_access": [] }
                }
            }"#,
        );
        let store = StateStore::for_project(Path::new("/p"));
        let state = store.load(&fs).unwrap().unwrap();
        let up = state.last_config.unwrap().up.unwrap();
        assert_eq!(up.command, "make setup");
        assert!(!up.append);
    }

    #[test]
    fn test_applied_config_excludes_are_part_of_drift() {
        let fragment = crate::config::parse_file(
            "image = \"u\"\nworkdir = \"/w\"\nworkdir_exclude = [\"target/\"]\n",
            Path::new("/p/alcatraz.toml"),
        )
        .unwrap()
        .fragment;
        let with_excludes = crate::config::normalize(fragment, "p").unwrap();

        let mut state = ProjectState::new();
        state.runtime = "docker".to_string();
        state.last_config = Some(AppliedConfig::of(&base_config()));
        assert!(state.drifted(&with_excludes, "docker"));
    }
}
