//! Mount-strategy decisions end-to-end: managed sync on Docker Desktop,
//! rootless-Podman exclude rejection, version gating

mod common;

use alcatraz_core::env::mock::{output_err, output_ok};
use alcatraz_core::env::FileSystem;
use alcatraz_core::errors::{AlcatrazError, SyncError};
use alcatraz_core::orchestrator::{AcceptAll, Orchestrator, UpOptions};
use alcatraz_core::state::StateStore;
use common::{config_toml, scripted_env};
use std::path::Path;

#[tokio::test]
async fn test_docker_desktop_always_creates_sync_session() {
    let (env, runner, fs) = scripted_env("macos", "/p");
    fs.write(
        Path::new("/p/alcatraz.toml"),
        config_toml("workdir = \"/w\"\n[network]\nlan-access = [\"*\"]\n").as_bytes(),
    )
    .unwrap();

    runner.on(
        "docker info --format {{.OperatingSystem}}",
        output_ok("Docker Desktop\n"),
    );
    runner.on("mutagen version", output_ok("0.18.2\n"));
    runner.on("docker inspect", output_err(1, "No such object"));
    runner.on("docker create", output_ok("cidABC\n"));

    let orchestrator = Orchestrator::new(env.clone(), Box::new(AcceptAll));
    let summary = orchestrator.up(&UpOptions::default()).await.unwrap();
    summary.monitor.stop().await;

    let state = StateStore::for_project(Path::new("/p"))
        .load(fs.as_ref())
        .unwrap()
        .unwrap();

    // The workdir mount has no excludes, yet Docker Desktop forces sync
    let create_calls = runner.calls_for("mutagen");
    assert!(
        create_calls.contains(&format!(
            "mutagen sync create --name=sandbox-{}-0 /p docker://cidABC/w",
            state.project_id
        )),
        "calls: {:?}",
        create_calls
    );
    // The session is flushed once before the up command would run
    assert!(create_calls
        .iter()
        .any(|c| c.starts_with(&format!("mutagen sync flush sandbox-{}-0", state.project_id))));

    // No bind mount was passed for the sync-managed workdir
    let create = runner
        .calls()
        .into_iter()
        .find(|c| c.starts_with("docker create"))
        .unwrap();
    assert!(!create.contains("-v /p:/w"));
}

#[tokio::test]
async fn test_orbstack_binds_without_excludes() {
    let (env, runner, fs) = scripted_env("macos", "/p");
    fs.write(
        Path::new("/p/alcatraz.toml"),
        config_toml("workdir = \"/w\"\n[network]\nlan-access = [\"*\"]\n").as_bytes(),
    )
    .unwrap();

    runner.on(
        "docker info --format {{.OperatingSystem}}",
        output_ok("OrbStack\n"),
    );
    runner.on("docker inspect", output_err(1, "No such object"));
    runner.on("docker create", output_ok("cidABC\n"));

    let orchestrator = Orchestrator::new(env.clone(), Box::new(AcceptAll));
    let summary = orchestrator.up(&UpOptions::default()).await.unwrap();
    summary.monitor.stop().await;

    // Bind mount, no sync session
    let create = runner
        .calls()
        .into_iter()
        .find(|c| c.starts_with("docker create"))
        .unwrap();
    assert!(create.contains("-v /p:/w"));
    assert!(!runner
        .calls()
        .iter()
        .any(|c| c.starts_with("mutagen sync create")));
}

#[tokio::test]
async fn test_rootless_podman_with_excludes_aborts_with_alternatives() {
    let (env, runner, fs) = scripted_env("linux", "/p");
    fs.write(
        Path::new("/p/alcatraz.toml"),
        config_toml("workdir_exclude = [\"target/\"]\n").as_bytes(),
    )
    .unwrap();
    runner.on(
        "podman info --format {{.Host.Security.Rootless}}",
        output_ok("true\n"),
    );

    let orchestrator = Orchestrator::new(env.clone(), Box::new(AcceptAll));
    let err = orchestrator.up(&UpOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        AlcatrazError::Sync(SyncError::RootlessPodmanExcludes)
    ));
    let message = err.to_string();
    assert!(message.contains("(1)"));
    assert!(message.contains("(2) switch to rootful Podman"));
    assert!(message.contains("(3) use Docker"));

    // Nothing was created
    assert!(!runner.calls().iter().any(|c| c.contains("create")));
}

#[tokio::test]
async fn test_rootful_podman_with_excludes_uses_sync() {
    let (env, runner, fs) = scripted_env("linux", "/p");
    fs.write(
        Path::new("/p/alcatraz.toml"),
        config_toml("workdir = \"/w\"\nworkdir_exclude = [\"target/\"]\n[network]\nlan-access = [\"*\"]\n")
            .as_bytes(),
    )
    .unwrap();
    runner.on(
        "podman info --format {{.Host.Security.Rootless}}",
        output_ok("false\n"),
    );
    runner.on("mutagen version", output_ok("0.18.2\n"));
    runner.on("podman inspect", output_err(1, "no such container"));
    runner.on("podman create", output_ok("cid1\n"));

    let orchestrator = Orchestrator::new(env.clone(), Box::new(AcceptAll));
    let summary = orchestrator.up(&UpOptions::default()).await.unwrap();
    summary.monitor.stop().await;

    let state = StateStore::for_project(Path::new("/p"))
        .load(fs.as_ref())
        .unwrap()
        .unwrap();
    // Excludes ride along as ignore patterns
    assert!(runner.calls().iter().any(|c| c
        == &format!(
            "mutagen sync create --name=sandbox-{}-0 --ignore=target/ /p podman://cid1/w",
            state.project_id
        )));
}

#[tokio::test]
async fn test_old_mutagen_rejected_on_macos() {
    let (env, runner, fs) = scripted_env("macos", "/p");
    fs.write(
        Path::new("/p/alcatraz.toml"),
        config_toml("[network]\nlan-access = [\"*\"]\n").as_bytes(),
    )
    .unwrap();
    runner.on(
        "docker info --format {{.OperatingSystem}}",
        output_ok("Docker Desktop\n"),
    );
    runner.on("mutagen version", output_ok("0.16.4\n"));

    let orchestrator = Orchestrator::new(env.clone(), Box::new(AcceptAll));
    let err = orchestrator.up(&UpOptions::default()).await.unwrap_err();
    assert!(err.to_string().contains("upgrade to >= 0.17.1"));
}

#[tokio::test]
async fn test_missing_mutagen_only_matters_when_sync_is_needed() {
    let (env, runner, fs) = scripted_env("linux", "/p");
    fs.write(
        Path::new("/p/alcatraz.toml"),
        config_toml("workdir = \"/w\"\n[network]\nlan-access = [\"*\"]\n").as_bytes(),
    )
    .unwrap();
    runner.missing_binary("mutagen version");
    runner.on("podman inspect", output_err(1, "no such container"));
    runner.on("podman create", output_ok("cid1\n"));

    // Linux without excludes: pure bind mounts, mutagen never consulted
    let orchestrator = Orchestrator::new(env.clone(), Box::new(AcceptAll));
    let summary = orchestrator.up(&UpOptions::default()).await.unwrap();
    summary.monitor.stop().await;
    assert!(!runner.calls().iter().any(|c| c.starts_with("mutagen version")));
}
