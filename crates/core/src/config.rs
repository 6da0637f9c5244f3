//! Project configuration model, merge semantics and normalization
//!
//! The TOML surface accepts several polymorphic shapes (string or table
//! mounts, envs, commands, caps and LAN rules). Those are parsed into tagged
//! variants and normalized into canonical structs before merging, so the
//! merge logic itself is shape-uniform. Unknown top-level keys are logged at
//! DEBUG and ignored rather than failing the load.
//!
//! Merging follows a three-layer precedence model: `extends` provides a base
//! under the current file and `includes` overlays on top of it, so for a
//! scalar field `includes` beats self beats `extends`. See [`crate::loader`]
//! for the fold order across files.

use crate::errors::{ConfigError, Result};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Root of the default in-container workdir (`<root>/<project-dir-name>`)
pub const DEFAULT_WORKDIR_ROOT: &str = "/workspaces";

/// Capabilities granted to a non-root container when `caps` is an array or
/// absent. Array mode adds the listed capabilities on top of these.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "AUDIT_WRITE",
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "FSETID",
    "KILL",
    "MKNOD",
    "NET_BIND_SERVICE",
    "NET_RAW",
    "SETFCAP",
    "SETGID",
    "SETPCAP",
    "SETUID",
    "SYS_CHROOT",
];

/// Environment variables re-exported from the host by default. Terminal and
/// locale variables; user-declared values win.
const DEFAULT_ENV_PASSTHROUGH: &[&str] = &["TERM", "COLORTERM", "LANG", "LC_ALL"];

/// The only accepted `${NAME}` form: the whole value is a single reference
static ENV_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\{[A-Za-z_][A-Za-z0-9_-]*\}$").expect("static regex"));

/// Runtime selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeChoice {
    /// Pick a backend per host (Podman then Docker on Linux, Docker elsewhere)
    #[default]
    Auto,
    /// Require Docker
    Docker,
    /// Require Apple's `container` CLI
    Container,
}

impl FromStr for RuntimeChoice {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(RuntimeChoice::Auto),
            "docker" => Ok(RuntimeChoice::Docker),
            "container" => Ok(RuntimeChoice::Container),
            other => Err(ConfigError::Validation {
                message: format!(
                    "Unsupported runtime '{}'; expected auto, docker, or container",
                    other
                ),
            }),
        }
    }
}

impl fmt::Display for RuntimeChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeChoice::Auto => "auto",
            RuntimeChoice::Docker => "docker",
            RuntimeChoice::Container => "container",
        };
        write!(f, "{}", s)
    }
}

/// A host path mapped into the container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path; `.` and relative paths resolve against the project directory
    pub source: String,
    /// Absolute path inside the container
    pub target: String,
    #[serde(default)]
    pub readonly: bool,
    /// Glob patterns shadowed from the container; only honored on
    /// sync-managed mounts
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Mount {
    /// Parse the `src:dst[:ro]` string form
    pub fn parse_short(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let (source, target, readonly) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            _ => {
                return Err(ConfigError::Validation {
                    message: format!("Invalid mount '{}'; expected src:dst[:ro]", s),
                }
                .into())
            }
        };
        if source.is_empty() || target.is_empty() {
            return Err(ConfigError::Validation {
                message: format!("Invalid mount '{}'; source and target must be non-empty", s),
            }
            .into());
        }
        Ok(Mount {
            source: source.to_string(),
            target: target.to_string(),
            readonly,
            exclude: Vec::new(),
        })
    }

    /// Whether the mount fits the string form (no excludes)
    pub fn is_simple(&self) -> bool {
        self.exclude.is_empty()
    }

    /// The `src:dst[:ro]` form for simple mounts
    pub fn to_short_form(&self) -> Option<String> {
        if !self.is_simple() {
            return None;
        }
        Some(if self.readonly {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        })
    }
}

/// An environment variable value: either a literal or a single `${NAME}`
/// reference resolved from the host at use time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvValue {
    pub value: String,
    /// Re-export on every `exec` rather than only at container creation
    #[serde(default)]
    pub override_on_enter: bool,
}

impl EnvValue {
    /// The referenced host variable name, when the value is a reference
    pub fn reference(&self) -> Option<&str> {
        if ENV_REFERENCE.is_match(&self.value) {
            Some(&self.value[2..self.value.len() - 1])
        } else {
            None
        }
    }
}

/// A lifecycle command with overlay-append semantics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandValue {
    pub command: String,
    #[serde(default)]
    pub append: bool,
}

impl CommandValue {
    /// Merge an overlay command onto a base. An appending overlay joins onto
    /// a non-empty base with a space; otherwise the overlay replaces the
    /// base. The base's own append flag is ignored.
    pub fn merged(base: &CommandValue, overlay: &CommandValue) -> CommandValue {
        if overlay.append && !base.command.is_empty() {
            CommandValue {
                command: format!("{} {}", base.command, overlay.command),
                append: overlay.append,
            }
        } else {
            overlay.clone()
        }
    }
}

/// Lifecycle commands
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Commands {
    /// Run inside the container once it is up
    pub up: Option<CommandValue>,
    /// Run (or used as shell) on `exec` entry
    pub enter: Option<CommandValue>,
}

/// Container resource limits; empty/zero fields are "unset"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub cpus: f64,
}

/// Resolved capability sets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub drop: Vec<String>,
}

impl Capabilities {
    /// The secure default: drop everything, add back the standard set
    pub fn secure_default() -> Self {
        Capabilities {
            add: DEFAULT_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
            drop: vec!["ALL".to_string()],
        }
    }

    /// Array-mode desugaring: secure defaults plus the listed capabilities
    fn from_list(listed: Vec<String>) -> Self {
        let mut caps = Self::secure_default();
        for cap in listed {
            if !caps.add.contains(&cap) {
                caps.add.push(cap);
            }
        }
        caps
    }
}

/// Allowed outbound protocol for a LAN rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    #[default]
    All,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "all" => Ok(Protocol::All),
            other => Err(ConfigError::Validation {
                message: format!("Unsupported protocol '{}'; expected tcp, udp, or all", other),
            }),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::All => "all",
        };
        write!(f, "{}", s)
    }
}

/// One LAN-access rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LanRule {
    /// `*`: no network isolation for this project
    Wildcard,
    /// Allow outbound traffic to a destination
    Allow {
        /// CIDR block or bare host address
        dest: String,
        port: Option<u16>,
        protocol: Protocol,
    },
}

/// Outbound network policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub lan_access: Vec<LanRule>,
}

impl NetworkPolicy {
    /// Whether the rule set contains the wildcard, disabling isolation
    pub fn allows_everything(&self) -> bool {
        self.lan_access.iter().any(|r| matches!(r, LanRule::Wildcard))
    }

    /// Whether firewall rules should be generated at all
    pub fn wants_isolation(&self) -> bool {
        !self.allows_everything()
    }
}

/// The merged, normalized per-project configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectConfig {
    pub image: String,
    /// Working directory inside the container; also the workdir mount target
    pub workdir: String,
    pub runtime: RuntimeChoice,
    /// The workdir mount is always element 0
    pub mounts: Vec<Mount>,
    pub commands: Commands,
    pub envs: IndexMap<String, EnvValue>,
    pub resources: Resources,
    pub caps: Capabilities,
    pub network: NetworkPolicy,
}

impl ProjectConfig {
    /// The synthesized workdir mount
    pub fn workdir_mount(&self) -> &Mount {
        &self.mounts[0]
    }

    /// Whether any mount declares exclude patterns
    pub fn has_excludes(&self) -> bool {
        self.mounts.iter().any(|m| !m.exclude.is_empty())
    }

    /// Serialize back to the TOML surface. Simple mounts use the string
    /// form, mounts with excludes the object form; parsing the result and
    /// normalizing yields a config equal to `self`.
    pub fn to_toml_string(&self) -> String {
        use toml::Value;

        let mut root = toml::Table::new();
        root.insert("image".into(), Value::String(self.image.clone()));
        root.insert("workdir".into(), Value::String(self.workdir.clone()));
        root.insert("runtime".into(), Value::String(self.runtime.to_string()));

        let workdir_mount = self.workdir_mount();
        if !workdir_mount.exclude.is_empty() {
            root.insert(
                "workdir_exclude".into(),
                Value::Array(
                    workdir_mount
                        .exclude
                        .iter()
                        .map(|p| Value::String(p.clone()))
                        .collect(),
                ),
            );
        }

        let user_mounts: Vec<Value> = self.mounts[1..]
            .iter()
            .map(|m| match m.to_short_form() {
                Some(short) => Value::String(short),
                None => {
                    let mut table = toml::Table::new();
                    table.insert("source".into(), Value::String(m.source.clone()));
                    table.insert("target".into(), Value::String(m.target.clone()));
                    if m.readonly {
                        table.insert("readonly".into(), Value::Boolean(true));
                    }
                    table.insert(
                        "exclude".into(),
                        Value::Array(
                            m.exclude.iter().map(|p| Value::String(p.clone())).collect(),
                        ),
                    );
                    Value::Table(table)
                }
            })
            .collect();
        if !user_mounts.is_empty() {
            root.insert("mounts".into(), Value::Array(user_mounts));
        }

        let mut commands = toml::Table::new();
        for (key, cmd) in [("up", &self.commands.up), ("enter", &self.commands.enter)] {
            if let Some(cmd) = cmd {
                let value = if cmd.append {
                    let mut table = toml::Table::new();
                    table.insert("command".into(), Value::String(cmd.command.clone()));
                    table.insert("append".into(), Value::Boolean(true));
                    Value::Table(table)
                } else {
                    Value::String(cmd.command.clone())
                };
                commands.insert(key.into(), value);
            }
        }
        if !commands.is_empty() {
            root.insert("commands".into(), Value::Table(commands));
        }

        if !self.envs.is_empty() {
            let mut envs = toml::Table::new();
            for (name, env) in &self.envs {
                let value = if env.override_on_enter {
                    let mut table = toml::Table::new();
                    table.insert("value".into(), Value::String(env.value.clone()));
                    table.insert("override_on_enter".into(), Value::Boolean(true));
                    Value::Table(table)
                } else {
                    Value::String(env.value.clone())
                };
                envs.insert(name.clone(), value);
            }
            root.insert("envs".into(), Value::Table(envs));
        }

        if self.resources != Resources::default() {
            let mut resources = toml::Table::new();
            if !self.resources.memory.is_empty() {
                resources.insert("memory".into(), Value::String(self.resources.memory.clone()));
            }
            if self.resources.cpus != 0.0 {
                resources.insert("cpus".into(), Value::Float(self.resources.cpus));
            }
            root.insert("resources".into(), Value::Table(resources));
        }

        let mut caps = toml::Table::new();
        caps.insert(
            "add".into(),
            Value::Array(self.caps.add.iter().map(|c| Value::String(c.clone())).collect()),
        );
        caps.insert(
            "drop".into(),
            Value::Array(self.caps.drop.iter().map(|c| Value::String(c.clone())).collect()),
        );
        root.insert("caps".into(), Value::Table(caps));

        if !self.network.lan_access.is_empty() {
            let rules: Vec<Value> = self
                .network
                .lan_access
                .iter()
                .map(|rule| match rule {
                    LanRule::Wildcard => Value::String("*".to_string()),
                    LanRule::Allow { dest, port, protocol } => {
                        let mut table = toml::Table::new();
                        table.insert("cidr".into(), Value::String(dest.clone()));
                        if let Some(port) = port {
                            table.insert("port".into(), Value::Integer(i64::from(*port)));
                        }
                        table.insert("protocol".into(), Value::String(protocol.to_string()));
                        Value::Table(table)
                    }
                })
                .collect();
            let mut network = toml::Table::new();
            network.insert("lan-access".into(), Value::Array(rules));
            root.insert("network".into(), Value::Table(network));
        }

        toml::to_string_pretty(&root).unwrap_or_default()
    }
}

/// One file's contribution before merging: every field optional or
/// accumulative, so the merge is uniform across layers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFragment {
    pub image: Option<String>,
    pub workdir: Option<String>,
    pub runtime: Option<RuntimeChoice>,
    pub mounts: Vec<Mount>,
    pub workdir_exclude: Vec<String>,
    pub up: Option<CommandValue>,
    pub enter: Option<CommandValue>,
    pub envs: IndexMap<String, EnvValue>,
    pub resources: Resources,
    pub caps: Option<Capabilities>,
    pub lan_access: Vec<LanRule>,
}

/// A parsed file: its own fragment plus unexpanded include/extends entries
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub fragment: ConfigFragment,
    pub includes: Vec<String>,
    pub extends: Vec<String>,
}

/// Merge an overlay fragment onto a base.
///
/// Scalars: overlay wins when set. Mounts, LAN rules and workdir excludes:
/// overlay appended. Envs: per-key overlay wins. Commands: [`CommandValue`]
/// merge. Resources and caps: per-field overlay wins when non-empty.
pub fn merge(base: ConfigFragment, overlay: ConfigFragment) -> ConfigFragment {
    let mut envs = base.envs;
    for (key, value) in overlay.envs {
        envs.insert(key, value);
    }

    let mut mounts = base.mounts;
    mounts.extend(overlay.mounts);

    let mut workdir_exclude = base.workdir_exclude;
    workdir_exclude.extend(overlay.workdir_exclude);

    let mut lan_access = base.lan_access;
    lan_access.extend(overlay.lan_access);

    ConfigFragment {
        image: overlay.image.or(base.image),
        workdir: overlay.workdir.or(base.workdir),
        runtime: overlay.runtime.or(base.runtime),
        mounts,
        workdir_exclude,
        up: merge_command(base.up, overlay.up),
        enter: merge_command(base.enter, overlay.enter),
        envs,
        resources: Resources {
            memory: if overlay.resources.memory.is_empty() {
                base.resources.memory
            } else {
                overlay.resources.memory
            },
            cpus: if overlay.resources.cpus == 0.0 {
                base.resources.cpus
            } else {
                overlay.resources.cpus
            },
        },
        caps: match (base.caps, overlay.caps) {
            (base, None) => base,
            (None, overlay) => overlay,
            (Some(base), Some(overlay)) => Some(Capabilities {
                add: if overlay.add.is_empty() { base.add } else { overlay.add },
                drop: if overlay.drop.is_empty() { base.drop } else { overlay.drop },
            }),
        },
        lan_access,
    }
}

fn merge_command(base: Option<CommandValue>, overlay: Option<CommandValue>) -> Option<CommandValue> {
    match (base, overlay) {
        (base, None) => base,
        (None, Some(overlay)) => Some(overlay),
        (Some(base), Some(overlay)) => Some(CommandValue::merged(&base, &overlay)),
    }
}

/// Normalize a fully merged fragment into an immutable [`ProjectConfig`].
///
/// Synthesizes the workdir mount at index 0, applies the workdir and env
/// defaults and the secure capability default, and collapses a wildcard LAN
/// rule set to the singleton.
pub fn normalize(fragment: ConfigFragment, project_name: &str) -> Result<ProjectConfig> {
    let image = match fragment.image {
        Some(image) if !image.is_empty() => image,
        _ => {
            return Err(ConfigError::Validation {
                message: "Configuration must set 'image'".to_string(),
            }
            .into())
        }
    };

    let workdir = match fragment.workdir {
        Some(workdir) if !workdir.is_empty() => workdir,
        _ => format!("{}/{}", DEFAULT_WORKDIR_ROOT, project_name),
    };

    let mut mounts = vec![Mount {
        source: ".".to_string(),
        target: workdir.clone(),
        readonly: false,
        exclude: fragment.workdir_exclude,
    }];
    for mount in fragment.mounts {
        if mount.source.is_empty() || mount.target.is_empty() {
            return Err(ConfigError::Validation {
                message: "Mount source and target must be non-empty".to_string(),
            }
            .into());
        }
        if mount.target == workdir {
            return Err(ConfigError::Validation {
                message: format!(
                    "Mount '{}' conflicts with workdir target '{}'",
                    mount.source, workdir
                ),
            }
            .into());
        }
        mounts.push(mount);
    }

    let mut envs = fragment.envs;
    for name in DEFAULT_ENV_PASSTHROUGH {
        envs.entry(name.to_string()).or_insert_with(|| EnvValue {
            value: format!("${{{}}}", name),
            override_on_enter: true,
        });
    }

    let lan_access = if fragment.lan_access.iter().any(|r| matches!(r, LanRule::Wildcard)) {
        vec![LanRule::Wildcard]
    } else {
        fragment.lan_access
    };

    Ok(ProjectConfig {
        image,
        workdir,
        runtime: fragment.runtime.unwrap_or_default(),
        mounts,
        commands: Commands {
            up: fragment.up,
            enter: fragment.enter,
        },
        envs,
        resources: fragment.resources,
        caps: fragment.caps.unwrap_or_else(Capabilities::secure_default),
        network: NetworkPolicy { lan_access },
    })
}

// ---------------------------------------------------------------------------
// TOML surface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    image: Option<String>,
    workdir: Option<String>,
    runtime: Option<String>,
    #[serde(default)]
    mounts: Vec<RawMount>,
    #[serde(default)]
    workdir_exclude: Vec<String>,
    resources: Option<RawResources>,
    caps: Option<RawCaps>,
    #[serde(default)]
    envs: IndexMap<String, RawEnv>,
    network: Option<RawNetwork>,
    commands: Option<RawCommands>,
    #[serde(default)]
    includes: Vec<String>,
    #[serde(default)]
    extends: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMount {
    Short(String),
    Full {
        source: String,
        target: String,
        #[serde(default)]
        readonly: bool,
        #[serde(default)]
        exclude: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEnv {
    Literal(String),
    Full {
        value: String,
        #[serde(default)]
        override_on_enter: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Shell(String),
    Full {
        command: String,
        #[serde(default)]
        append: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCaps {
    List(Vec<String>),
    Table {
        #[serde(default)]
        add: Vec<String>,
        #[serde(default)]
        drop: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLanRule {
    Shorthand(String),
    Full {
        cidr: String,
        port: Option<u16>,
        protocol: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawResources {
    memory: Option<String>,
    cpus: Option<RawNumber>,
}

/// TOML writes `cpus = 2` as an integer and `cpus = 1.5` as a float; accept
/// both.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Int(i64),
    Float(f64),
}

impl RawNumber {
    fn as_f64(self) -> f64 {
        match self {
            RawNumber::Int(n) => n as f64,
            RawNumber::Float(n) => n,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawNetwork {
    #[serde(rename = "lan-access")]
    lan_access: Option<Vec<RawLanRule>>,
}

#[derive(Debug, Deserialize)]
struct RawCommands {
    up: Option<RawCommand>,
    enter: Option<RawCommand>,
}

const KNOWN_KEYS: &[&str] = &[
    "image",
    "workdir",
    "runtime",
    "mounts",
    "workdir_exclude",
    "resources",
    "caps",
    "envs",
    "network",
    "commands",
    "includes",
    "extends",
];

/// Parse one TOML document into its fragment plus raw include/extends lists
pub fn parse_file(text: &str, path: &Path) -> Result<ParsedFile> {
    let path_display = path.display().to_string();
    let value: toml::Value = toml::from_str(text).map_err(|e| ConfigError::Parse {
        path: path_display.clone(),
        message: e.to_string(),
    })?;

    if let Some(table) = value.as_table() {
        for key in table.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                debug!("Unknown configuration key '{}' in {} - ignored", key, path_display);
            }
        }
    }

    let raw: RawConfig = value.try_into().map_err(|e| ConfigError::Parse {
        path: path_display,
        message: e.to_string(),
    })?;
    raw.into_parsed(path)
}

impl RawConfig {
    fn into_parsed(self, path: &Path) -> Result<ParsedFile> {
        let runtime = match self.runtime.as_deref() {
            None | Some("") => None,
            Some(s) => Some(s.parse::<RuntimeChoice>()?),
        };

        let mut mounts = Vec::with_capacity(self.mounts.len());
        for raw in self.mounts {
            mounts.push(match raw {
                RawMount::Short(s) => Mount::parse_short(&s)?,
                RawMount::Full {
                    source,
                    target,
                    readonly,
                    exclude,
                } => Mount {
                    source,
                    target,
                    readonly,
                    exclude,
                },
            });
        }

        let mut envs = IndexMap::with_capacity(self.envs.len());
        for (name, raw) in self.envs {
            let env = match raw {
                RawEnv::Literal(value) => EnvValue {
                    value,
                    override_on_enter: false,
                },
                RawEnv::Full {
                    value,
                    override_on_enter,
                } => EnvValue {
                    value,
                    override_on_enter,
                },
            };
            validate_env_value(&name, &env, path)?;
            envs.insert(name, env);
        }

        let caps = match self.caps {
            None => None,
            Some(RawCaps::List(listed)) => Some(Capabilities::from_list(listed)),
            Some(RawCaps::Table { add, drop }) => Some(Capabilities { add, drop }),
        };

        let lan_access = match self.network.and_then(|n| n.lan_access) {
            None => Vec::new(),
            Some(rules) => {
                let mut parsed = Vec::with_capacity(rules.len());
                for rule in rules {
                    parsed.push(match rule {
                        RawLanRule::Shorthand(s) if s == "*" => LanRule::Wildcard,
                        RawLanRule::Shorthand(dest) => LanRule::Allow {
                            dest,
                            port: None,
                            protocol: Protocol::All,
                        },
                        RawLanRule::Full {
                            cidr,
                            port,
                            protocol,
                        } => LanRule::Allow {
                            dest: cidr,
                            port,
                            protocol: match protocol.as_deref() {
                                None | Some("") => Protocol::All,
                                Some(p) => p.parse()?,
                            },
                        },
                    });
                }
                parsed
            }
        };

        let (up, enter) = match self.commands {
            None => (None, None),
            Some(commands) => (
                commands.up.map(RawCommand::into_value),
                commands.enter.map(RawCommand::into_value),
            ),
        };

        Ok(ParsedFile {
            fragment: ConfigFragment {
                image: self.image.filter(|s| !s.is_empty()),
                workdir: self.workdir.filter(|s| !s.is_empty()),
                runtime,
                mounts,
                workdir_exclude: self.workdir_exclude,
                up,
                enter,
                envs,
                resources: Resources {
                    memory: self
                        .resources
                        .as_ref()
                        .and_then(|r| r.memory.clone())
                        .unwrap_or_default(),
                    cpus: self
                        .resources
                        .as_ref()
                        .and_then(|r| r.cpus)
                        .map(RawNumber::as_f64)
                        .unwrap_or(0.0),
                },
                caps,
                lan_access,
            },
            includes: self.includes,
            extends: self.extends,
        })
    }
}

impl RawCommand {
    fn into_value(self) -> CommandValue {
        match self {
            RawCommand::Shell(command) => CommandValue {
                command,
                append: false,
            },
            RawCommand::Full { command, append } => CommandValue { command, append },
        }
    }
}

/// Env values are either literals or one whole `${NAME}` reference; any
/// other use of `${` (nested, interleaved, multiple) is rejected.
fn validate_env_value(name: &str, env: &EnvValue, path: &Path) -> Result<()> {
    if env.value.contains("${") && env.reference().is_none() {
        return Err(ConfigError::Validation {
            message: format!(
                "Env '{}' in {} has an unsupported '${{' form; only a lone ${{NAME}} reference is allowed",
                name,
                path.display()
            ),
        }
        .into());
    }
    Ok(())
}
