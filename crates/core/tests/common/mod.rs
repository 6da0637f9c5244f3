//! Shared helpers for core integration tests

use alcatraz_core::env::mock::{MemFs, ScriptedRunner};
use alcatraz_core::env::Env;
use std::sync::Arc;

/// An env over an in-memory filesystem and a scripted runner.
///
/// Unscripted commands succeed with empty output, so tests only register
/// the responses they care about.
pub fn scripted_env(
    os: &'static str,
    project_dir: &str,
) -> (Arc<Env>, Arc<ScriptedRunner>, Arc<MemFs>) {
    let fs = Arc::new(MemFs::new());
    let runner = Arc::new(ScriptedRunner::new());
    let env = Arc::new(Env::new(fs.clone(), runner.clone(), project_dir).with_os(os));
    (env, runner, fs)
}

/// A minimal valid configuration with the given extra lines appended
pub fn config_toml(extra: &str) -> String {
    format!("image = \"ubuntu:24.04\"\n{}", extra)
}
