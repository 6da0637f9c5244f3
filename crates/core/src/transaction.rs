//! Transactional filesystem staging
//!
//! Components stage [`FileOp`]s instead of writing directly. A commit
//! partitions the queue into contiguous runs of equal privilege, preserving
//! queue order: unprivileged runs apply through the injected filesystem,
//! privileged runs are rendered into a single idempotent shell script and
//! executed under one `sudo` invocation, so the user sees one password prompt
//! per commit rather than one per file.
//!
//! Commits are all-or-nothing per run. The first failing op aborts the
//! commit with a [`CommitError`] naming the run index, op kind and path;
//! earlier runs are not rolled back and there is no implicit retry.

use crate::env::Env;
use crate::errors::{CommitError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;
use std::io;
use std::path::PathBuf;
use tracing::{debug, instrument};

/// Marker echoed by the sudo batch after each successful op so a failure can
/// be attributed to the first op that did not complete.
const OP_MARKER: &str = "__alcatraz_op_done__";

/// What a staged [`FileOp`] does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpKind {
    /// Write a new file
    Create,
    /// Overwrite an existing file
    Update,
    /// Change a file's mode
    Chmod,
    /// Remove a file (missing files are tolerated, `rm -f` semantics)
    Delete,
}

impl fmt::Display for FileOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileOpKind::Create => "create",
            FileOpKind::Update => "update",
            FileOpKind::Chmod => "chmod",
            FileOpKind::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// A pending filesystem change
#[derive(Debug, Clone)]
pub struct FileOp {
    pub kind: FileOpKind,
    pub path: PathBuf,
    /// Payload for create/update; empty otherwise
    pub contents: Vec<u8>,
    /// Mode to apply after a write, or the chmod target mode
    pub mode: Option<u32>,
    /// Whether this op must run under sudo
    pub needs_sudo: bool,
}

/// An ordered queue of staged filesystem changes
#[derive(Debug, Default)]
pub struct Transaction {
    ops: Vec<FileOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// The staged ops, in queue order
    pub fn ops(&self) -> &[FileOp] {
        &self.ops
    }

    /// Stage an arbitrary op
    pub fn stage(&mut self, op: FileOp) {
        self.ops.push(op);
    }

    /// Stage a file creation
    pub fn create(
        &mut self,
        path: impl Into<PathBuf>,
        contents: Vec<u8>,
        mode: Option<u32>,
        needs_sudo: bool,
    ) {
        self.stage(FileOp {
            kind: FileOpKind::Create,
            path: path.into(),
            contents,
            mode,
            needs_sudo,
        });
    }

    /// Stage a file overwrite
    pub fn update(
        &mut self,
        path: impl Into<PathBuf>,
        contents: Vec<u8>,
        mode: Option<u32>,
        needs_sudo: bool,
    ) {
        self.stage(FileOp {
            kind: FileOpKind::Update,
            path: path.into(),
            contents,
            mode,
            needs_sudo,
        });
    }

    /// Stage a mode change
    pub fn chmod(&mut self, path: impl Into<PathBuf>, mode: u32, needs_sudo: bool) {
        self.stage(FileOp {
            kind: FileOpKind::Chmod,
            path: path.into(),
            contents: Vec::new(),
            mode: Some(mode),
            needs_sudo,
        });
    }

    /// Stage a file removal
    pub fn delete(&mut self, path: impl Into<PathBuf>, needs_sudo: bool) {
        self.stage(FileOp {
            kind: FileOpKind::Delete,
            path: path.into(),
            contents: Vec::new(),
            mode: None,
            needs_sudo,
        });
    }

    /// Commit every staged op.
    ///
    /// Runs execute in queue order. A failing run aborts the commit; runs
    /// that already completed stay applied.
    #[instrument(skip_all, fields(ops = self.ops.len()))]
    pub async fn commit(self, env: &Env) -> Result<()> {
        for (run_index, run) in partition(&self.ops).into_iter().enumerate() {
            if run.is_empty() {
                continue;
            }
            if run[0].needs_sudo {
                commit_sudo_run(env, run_index, run).await?;
            } else {
                commit_direct_run(env, run_index, run)?;
            }
        }
        Ok(())
    }
}

/// Split the queue into contiguous runs of equal `needs_sudo`, preserving order
fn partition(ops: &[FileOp]) -> Vec<&[FileOp]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=ops.len() {
        if i == ops.len() || ops[i].needs_sudo != ops[start].needs_sudo {
            runs.push(&ops[start..i]);
            start = i;
        }
    }
    runs
}

fn commit_direct_run(env: &Env, run: usize, ops: &[FileOp]) -> Result<()> {
    debug!(run, ops = ops.len(), "Committing unprivileged run");
    for op in ops {
        apply_direct(env, op).map_err(|e| CommitError {
            run,
            op: op.kind,
            path: op.path.display().to_string(),
            cause: e.to_string(),
        })?;
    }
    Ok(())
}

fn apply_direct(env: &Env, op: &FileOp) -> io::Result<()> {
    match op.kind {
        FileOpKind::Create | FileOpKind::Update => {
            if let Some(parent) = op.path.parent() {
                env.fs.create_dir_all(parent)?;
            }
            env.fs.write(&op.path, &op.contents)?;
            if let Some(mode) = op.mode {
                env.fs.set_mode(&op.path, mode)?;
            }
            Ok(())
        }
        FileOpKind::Chmod => match op.mode {
            Some(mode) => env.fs.set_mode(&op.path, mode),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chmod op staged without a mode",
            )),
        },
        FileOpKind::Delete => match env.fs.remove_file(&op.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
    }
}

async fn commit_sudo_run(env: &Env, run: usize, ops: &[FileOp]) -> Result<()> {
    let script = sudo_script(ops);
    debug!(run, ops = ops.len(), "Committing privileged run via sudo batch");
    let args = vec!["sh".to_string(), "-c".to_string(), script];
    let output = env.runner.run("sudo", &args).await.map_err(|e| CommitError {
        run,
        op: ops[0].kind,
        path: ops[0].path.display().to_string(),
        cause: format!("failed to invoke sudo: {}", e),
    })?;
    if !output.success() {
        let completed = output.stdout.matches(OP_MARKER).count();
        let failed = ops.get(completed).unwrap_or(&ops[ops.len() - 1]);
        return Err(CommitError {
            run,
            op: failed.kind,
            path: failed.path.display().to_string(),
            cause: output.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(())
}

/// Render one privileged run as an idempotent shell script.
///
/// Writes go through base64 so file contents never meet shell quoting.
fn sudo_script(ops: &[FileOp]) -> String {
    let mut script = String::from("set -eu\n");
    for op in ops {
        let path = shell_words::quote(&op.path.display().to_string()).into_owned();
        match op.kind {
            FileOpKind::Create | FileOpKind::Update => {
                if let Some(parent) = op.path.parent() {
                    let dir = shell_words::quote(&parent.display().to_string()).into_owned();
                    script.push_str(&format!("mkdir -p {}\n", dir));
                }
                let payload = BASE64.encode(&op.contents);
                script.push_str(&format!(
                    "printf '%s' {} | base64 -d > {}\n",
                    shell_words::quote(&payload),
                    path
                ));
                if let Some(mode) = op.mode {
                    script.push_str(&format!("chmod {:o} {}\n", mode, path));
                }
            }
            FileOpKind::Chmod => {
                if let Some(mode) = op.mode {
                    script.push_str(&format!("chmod {:o} {}\n", mode, path));
                }
            }
            FileOpKind::Delete => {
                script.push_str(&format!("rm -f {}\n", path));
            }
        }
        script.push_str(&format!("echo {}\n", OP_MARKER));
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::mock::{output_err, MemFs, ScriptedRunner};
    use crate::errors::AlcatrazError;
    use std::sync::Arc;

    fn test_env(fs: Arc<MemFs>, runner: Arc<ScriptedRunner>) -> Env {
        Env::new(fs, runner, "/project")
    }

    #[test]
    fn test_partition_groups_contiguous_privilege() {
        let mut txn = Transaction::new();
        txn.create("/a", b"1".to_vec(), None, false);
        txn.create("/b", b"2".to_vec(), None, false);
        txn.create("/etc/x", b"3".to_vec(), None, true);
        txn.delete("/etc/y", true);
        txn.create("/c", b"4".to_vec(), None, false);

        let runs = partition(txn.ops());
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].len(), 2);
        assert!(!runs[0][0].needs_sudo);
        assert_eq!(runs[1].len(), 2);
        assert!(runs[1][0].needs_sudo);
        assert_eq!(runs[2].len(), 1);
        assert!(!runs[2][0].needs_sudo);
    }

    #[tokio::test]
    async fn test_commit_direct_writes_files() {
        let fs = Arc::new(MemFs::new());
        let runner = Arc::new(ScriptedRunner::new());
        let env = test_env(fs.clone(), runner.clone());

        let mut txn = Transaction::new();
        txn.create("/project/.alcatraz-state.json", b"{}".to_vec(), Some(0o644), false);
        txn.commit(&env).await.unwrap();

        assert_eq!(fs.contents_utf8("/project/.alcatraz-state.json").unwrap(), "{}");
        assert_eq!(fs.mode("/project/.alcatraz-state.json"), Some(0o644));
        // No sudo invocation for an unprivileged run
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_commit_sudo_run_is_one_invocation() {
        let fs = Arc::new(MemFs::new());
        let runner = Arc::new(ScriptedRunner::new());
        let env = test_env(fs.clone(), runner.clone());

        let mut txn = Transaction::new();
        txn.create("/etc/alcatraz/nft.d/a.nft", b"rules".to_vec(), Some(0o644), true);
        txn.delete("/etc/alcatraz/nft.d/stale.nft", true);
        txn.commit(&env).await.unwrap();

        let sudo_calls = runner.calls_for("sudo");
        assert_eq!(sudo_calls.len(), 1, "expected one sudo batch per run");
        let call = &sudo_calls[0];
        assert!(call.contains("sh -c"));
        assert!(call.contains("set -eu"));
        assert!(call.contains("mkdir -p"));
        assert!(call.contains("base64 -d"));
        assert!(call.contains("rm -f"));
        // Payload is base64, not raw contents
        assert!(!call.contains("rules"));
        assert!(call.contains(&BASE64.encode(b"rules")));
    }

    #[tokio::test]
    async fn test_commit_reports_failing_run_and_op() {
        let fs = Arc::new(MemFs::new());
        let runner = Arc::new(ScriptedRunner::new());
        // Second op in the sudo run fails: one marker emitted
        runner.on(
            "sudo sh -c",
            crate::env::CommandOutput {
                exit_code: 1,
                stdout: format!("{}\n", OP_MARKER),
                stderr: "chmod: permission denied".to_string(),
            },
        );
        let env = test_env(fs, runner);

        let mut txn = Transaction::new();
        txn.create("/project/ok", b"x".to_vec(), None, false);
        txn.create("/etc/one", b"1".to_vec(), None, true);
        txn.chmod("/etc/two", 0o600, true);

        let err = txn.commit(&env).await.unwrap_err();
        match err {
            AlcatrazError::Commit(e) => {
                assert_eq!(e.run, 1);
                assert_eq!(e.op, FileOpKind::Chmod);
                assert_eq!(e.path, "/etc/two");
                assert!(e.cause.contains("permission denied"));
            }
            other => panic!("expected CommitError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_direct_run_failure_keeps_earlier_runs() {
        let fs = Arc::new(MemFs::new());
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("sudo sh -c", output_err(1, "sudo: no tty present"));
        let env = test_env(fs.clone(), runner);

        let mut txn = Transaction::new();
        txn.create("/project/first", b"kept".to_vec(), None, false);
        txn.create("/etc/second", b"lost".to_vec(), None, true);

        assert!(txn.commit(&env).await.is_err());
        // The unprivileged run committed before the sudo run failed
        assert_eq!(fs.contents_utf8("/project/first").unwrap(), "kept");
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_tolerated() {
        let fs = Arc::new(MemFs::new());
        let runner = Arc::new(ScriptedRunner::new());
        let env = test_env(fs, runner);

        let mut txn = Transaction::new();
        txn.delete("/project/not-there", false);
        txn.commit(&env).await.unwrap();
    }

    #[test]
    fn test_sudo_script_quotes_paths() {
        let ops = vec![FileOp {
            kind: FileOpKind::Delete,
            path: PathBuf::from("/etc/alcatraz/with space.nft"),
            contents: Vec::new(),
            mode: None,
            needs_sudo: true,
        }];
        let script = sudo_script(&ops);
        assert!(script.contains("rm -f '/etc/alcatraz/with space.nft'"));
    }
}
