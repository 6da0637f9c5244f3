//! Injected environment capsule
//!
//! Every component receives its filesystem and process handles through
//! [`Env`] instead of reaching for the host directly. This keeps the core
//! free of hidden globals and makes the container/firewall/sync CLI surfaces
//! testable against the doubles in [`mock`].

use crate::platform::Platform;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Captured output of a finished external command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Process exit code (-1 when terminated by signal)
    pub exit_code: i32,
    /// Captured stdout, lossily decoded
    pub stdout: String,
    /// Captured stderr, lossily decoded
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with code 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands (container CLIs, sync CLI, firewall CLI, sudo).
///
/// Cancellation: host implementations must tie the child's lifetime to the
/// returned future so that dropping the future kills the process.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion, capturing stdout and stderr
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;

    /// Run a command with stdio inherited from the parent process, returning
    /// its exit code. Used for interactive `exec` sessions.
    async fn run_inherited(&self, program: &str, args: &[String]) -> io::Result<i32>;
}

/// Filesystem handle used for all unprivileged file access
pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Remove a file; removing a missing file is an error (callers decide
    /// whether that is tolerable)
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    /// Immediate children of a directory, sorted for determinism
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Host filesystem backed by `std::fs`
#[derive(Debug, Default)]
pub struct HostFs;

impl FileSystem for HostFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    #[cfg(unix)]
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    fn set_mode(&self, _path: &Path, _mode: u32) -> io::Result<()> {
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        Ok(entries)
    }
}

/// Host process runner backed by `tokio::process`
#[derive(Debug, Default)]
pub struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        debug!(program, ?args, "Running external command");
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_inherited(&self, program: &str, args: &[String]) -> io::Result<i32> {
        debug!(program, ?args, "Running external command with inherited stdio");
        let status = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Shared execution environment for one project.
///
/// Carries the injected filesystem and command runner, the project directory,
/// the host OS tag, and the per-env memoized platform slot. Tests construct
/// fresh envs so they never observe each other's cached platform.
pub struct Env {
    /// Unprivileged filesystem handle
    pub fs: Arc<dyn FileSystem>,
    /// External command runner
    pub runner: Arc<dyn CommandRunner>,
    /// Absolute path of the project directory (beside the config file)
    pub project_dir: PathBuf,
    os: &'static str,
    host_env: HashMap<String, String>,
    platform: RwLock<Option<Platform>>,
}

impl Env {
    /// Create an env with explicit handles
    pub fn new(
        fs: Arc<dyn FileSystem>,
        runner: Arc<dyn CommandRunner>,
        project_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fs,
            runner,
            project_dir: project_dir.into(),
            os: std::env::consts::OS,
            host_env: HashMap::new(),
            platform: RwLock::new(None),
        }
    }

    /// Create an env bound to the real host filesystem and process table
    pub fn host(project_dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(HostFs), Arc::new(HostRunner), project_dir)
    }

    /// Override the host OS tag (tests)
    pub fn with_os(mut self, os: &'static str) -> Self {
        self.os = os;
        self
    }

    /// Pin a host environment variable, shadowing the process environment
    pub fn with_host_var(mut self, name: &str, value: &str) -> Self {
        self.host_env.insert(name.to_string(), value.to_string());
        self
    }

    /// The host OS tag (`linux`, `macos`, ...)
    pub fn os(&self) -> &str {
        self.os
    }

    /// Look up a host environment variable, honoring pinned overrides
    pub fn host_var(&self, name: &str) -> Option<String> {
        self.host_env
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    /// Read the memoized platform (shared-lock fast path)
    pub(crate) fn cached_platform(&self) -> Option<Platform> {
        *self.platform.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Memoize the detected platform (exclusive-lock slow path)
    pub(crate) fn cache_platform(&self, platform: Platform) {
        *self.platform.write().unwrap_or_else(|e| e.into_inner()) = Some(platform);
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("project_dir", &self.project_dir)
            .field("os", &self.os)
            .field("platform", &self.cached_platform())
            .finish()
    }
}

/// Test doubles for the env capsule.
///
/// Public (not `cfg(test)`) so both unit tests and the integration suites can
/// drive the core without a container daemon.
pub mod mock {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    /// In-memory filesystem
    #[derive(Default)]
    pub struct MemFs {
        files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
        modes: Mutex<BTreeMap<PathBuf, u32>>,
        dirs: Mutex<BTreeSet<PathBuf>>,
    }

    impl MemFs {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a file (builder style)
        pub fn with_file(self, path: impl Into<PathBuf>, contents: &str) -> Self {
            let path = path.into();
            self.insert(&path, contents.as_bytes());
            self
        }

        fn insert(&self, path: &Path, contents: &[u8]) {
            let mut dirs = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
            let mut parent = path.parent();
            while let Some(dir) = parent {
                dirs.insert(dir.to_path_buf());
                parent = dir.parent();
            }
            drop(dirs);
            self.files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(path.to_path_buf(), contents.to_vec());
        }

        /// Current contents of a file, if present
        pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
            self.files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(path.as_ref())
                .cloned()
        }

        /// Current contents of a file as UTF-8, if present
        pub fn contents_utf8(&self, path: impl AsRef<Path>) -> Option<String> {
            self.contents(path)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
        }

        /// Recorded mode of a file, if one was set
        pub fn mode(&self, path: impl AsRef<Path>) -> Option<u32> {
            self.modes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(path.as_ref())
                .copied()
        }

        /// All file paths currently present
        pub fn paths(&self) -> Vec<PathBuf> {
            self.files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .cloned()
                .collect()
        }
    }

    impl FileSystem for MemFs {
        fn read_to_string(&self, path: &Path) -> io::Result<String> {
            let bytes = self.read(path)?;
            String::from_utf8(bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        }

        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.contents(path)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
        }

        fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
            self.insert(path, contents);
            Ok(())
        }

        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            let mut dirs = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
            let mut current = Some(path);
            while let Some(dir) = current {
                dirs.insert(dir.to_path_buf());
                current = dir.parent();
            }
            Ok(())
        }

        fn remove_file(&self, path: &Path) -> io::Result<()> {
            self.files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
        }

        fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
            if !self.exists(path) {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    path.display().to_string(),
                ));
            }
            self.modes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(path.to_path_buf(), mode);
            Ok(())
        }

        fn exists(&self, path: &Path) -> bool {
            self.files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(path)
                || self.is_dir(path)
        }

        fn is_dir(&self, path: &Path) -> bool {
            self.dirs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(path)
        }

        fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
            let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
            let dirs = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
            let mut children = BTreeSet::new();
            for candidate in files.keys().chain(dirs.iter()) {
                if let Ok(rest) = candidate.strip_prefix(path) {
                    if let Some(first) = rest.components().next() {
                        children.insert(path.join(first));
                    }
                }
            }
            Ok(children.into_iter().collect())
        }
    }

    /// Successful [`CommandOutput`] with the given stdout
    pub fn output_ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    /// Failing [`CommandOutput`] with the given exit code and stderr
    pub fn output_err(exit_code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    enum Response {
        Output(CommandOutput),
        BinaryMissing,
    }

    struct Rule {
        prefix: String,
        response: Response,
        once: bool,
    }

    /// A rule-driven command runner that records every invocation.
    ///
    /// Rules match on a prefix of the full command line
    /// (`"program arg1 arg2 ..."`); the first matching rule wins, and rules
    /// registered with [`ScriptedRunner::on_once`] are consumed. Unmatched
    /// commands succeed with empty output.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Respond to every command line starting with `prefix`
        pub fn on(&self, prefix: &str, output: CommandOutput) {
            self.rules
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Rule {
                    prefix: prefix.to_string(),
                    response: Response::Output(output),
                    once: false,
                });
        }

        /// Respond once to the next command line starting with `prefix`
        pub fn on_once(&self, prefix: &str, output: CommandOutput) {
            self.rules
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Rule {
                    prefix: prefix.to_string(),
                    response: Response::Output(output),
                    once: true,
                });
        }

        /// Simulate a missing binary for command lines starting with `prefix`
        pub fn missing_binary(&self, prefix: &str) {
            self.rules
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Rule {
                    prefix: prefix.to_string(),
                    response: Response::BinaryMissing,
                    once: false,
                });
        }

        /// Every recorded command line, in invocation order
        pub fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }

        /// Recorded command lines for one program
        pub fn calls_for(&self, program: &str) -> Vec<String> {
            let prefix = format!("{} ", program);
            self.calls()
                .into_iter()
                .filter(|c| c.starts_with(&prefix) || c.as_str() == program)
                .collect()
        }

        fn respond(&self, line: &str) -> io::Result<CommandOutput> {
            let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
            let index = rules.iter().position(|r| line.starts_with(&r.prefix));
            match index {
                Some(i) => {
                    let result = match &rules[i].response {
                        Response::Output(out) => Ok(out.clone()),
                        Response::BinaryMissing => Err(io::Error::new(
                            io::ErrorKind::NotFound,
                            "No such file or directory",
                        )),
                    };
                    if rules[i].once {
                        rules.remove(i);
                    }
                    result
                }
                None => Ok(output_ok("")),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
            let line = if args.is_empty() {
                program.to_string()
            } else {
                format!("{} {}", program, args.join(" "))
            };
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(line.clone());
            self.respond(&line)
        }

        async fn run_inherited(&self, program: &str, args: &[String]) -> io::Result<i32> {
            self.run(program, args).await.map(|out| out.exit_code)
        }
    }
}
