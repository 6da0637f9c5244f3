//! Privileged firewall helper
//!
//! A small platform-native service owns the boot-time reload privilege: a
//! systemd oneshot unit on Linux, a launchd daemon on macOS. Install is
//! declarative: [`HelperStatus`] is always computed from the files on disk
//! plus the service manager's state, never from cached state, so a manually
//! broken install is re-detected on the next `up`.

use crate::env::Env;
use crate::errors::{FirewallError, Result};
use crate::firewall::{FirewallKind, NFT_ENTRY_FILE, PF_ANCHOR, PF_ANCHOR_FILE};
use crate::transaction::Transaction;
use std::path::PathBuf;
use tracing::{debug, info, instrument};

/// Linux unit file
const SYSTEMD_UNIT_PATH: &str = "/etc/systemd/system/alcatraz-firewall.service";
const SYSTEMD_UNIT_NAME: &str = "alcatraz-firewall.service";

/// macOS daemon plist
const LAUNCHD_PLIST_PATH: &str = "/Library/LaunchDaemons/io.alcatraz.firewall.plist";
const LAUNCHD_LABEL: &str = "io.alcatraz.firewall";

fn systemd_unit() -> String {
    format!(
        "[Unit]\n\
         Description=alcatraz per-container firewall rules\n\
         After=network-pre.target\n\
         Wants=network-pre.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         RemainAfterExit=yes\n\
         ExecStart=/usr/sbin/nft -f {}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        NFT_ENTRY_FILE
    )
}

fn nft_entry_ruleset() -> String {
    "#!/usr/sbin/nft -f\n\
     \n\
     table inet alcatraz {\n\
     \tchain forward {\n\
     \t\ttype filter hook forward priority -10; policy accept;\n\
     \t}\n\
     }\n\
     flush chain inet alcatraz forward\n\
     include \"/etc/alcatraz/nft.d/*.nft\"\n"
        .to_string()
}

fn launchd_plist() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
        <string>/sbin/pfctl</string>
        <string>-a</string>
        <string>{anchor}</string>
        <string>-f</string>
        <string>{rules}</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
</dict>
</plist>
"#,
        label = LAUNCHD_LABEL,
        anchor = PF_ANCHOR,
        rules = PF_ANCHOR_FILE
    )
}

/// Observed helper install state, computed from disk and the service manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperStatus {
    pub installed: bool,
    pub needs_update: bool,
}

/// Installs and removes the platform helper
#[derive(Debug, Clone)]
pub struct HelperManager {
    kind: FirewallKind,
}

impl HelperManager {
    pub fn new(kind: FirewallKind) -> Self {
        HelperManager { kind }
    }

    /// The helper's files with their expected contents
    fn files(&self) -> Vec<(PathBuf, String)> {
        match self.kind {
            FirewallKind::Nftables => vec![
                (PathBuf::from(SYSTEMD_UNIT_PATH), systemd_unit()),
                (PathBuf::from(NFT_ENTRY_FILE), nft_entry_ruleset()),
            ],
            FirewallKind::Pf => vec![(PathBuf::from(LAUNCHD_PLIST_PATH), launchd_plist())],
        }
    }

    /// Compute the current install state; never cached
    #[instrument(skip_all)]
    pub async fn status(&self, env: &Env) -> Result<HelperStatus> {
        let mut all_present = true;
        let mut content_matches = true;
        for (path, expected) in self.files() {
            match env.fs.read_to_string(&path) {
                Ok(actual) => {
                    if actual != expected {
                        content_matches = false;
                    }
                }
                Err(_) => {
                    all_present = false;
                    content_matches = false;
                }
            }
        }

        let service_active = self.service_active(env).await;
        let status = HelperStatus {
            installed: all_present && service_active,
            needs_update: all_present && !content_matches,
        };
        debug!(?status, "Helper status");
        Ok(status)
    }

    async fn service_active(&self, env: &Env) -> bool {
        let (program, args) = match self.kind {
            FirewallKind::Nftables => (
                "systemctl",
                vec!["is-enabled".to_string(), SYSTEMD_UNIT_NAME.to_string()],
            ),
            FirewallKind::Pf => (
                "launchctl",
                vec!["print".to_string(), format!("system/{}", LAUNCHD_LABEL)],
            ),
        };
        matches!(env.runner.run(program, &args).await, Ok(output) if output.success())
    }

    /// Stage the helper's files; commit happens at the caller's boundary
    pub fn stage_install(&self, txn: &mut Transaction) {
        for (path, content) in self.files() {
            txn.update(path, content.into_bytes(), Some(0o644), true);
        }
    }

    /// Activate via the platform service manager. Runs under sudo; separate
    /// from the file commit because service managers are not files.
    #[instrument(skip_all)]
    pub async fn activate(&self, env: &Env) -> Result<()> {
        let invocations: Vec<Vec<String>> = match self.kind {
            FirewallKind::Nftables => vec![
                vec!["systemctl".to_string(), "daemon-reload".to_string()],
                vec![
                    "systemctl".to_string(),
                    "enable".to_string(),
                    "--now".to_string(),
                    SYSTEMD_UNIT_NAME.to_string(),
                ],
            ],
            FirewallKind::Pf => vec![vec![
                "launchctl".to_string(),
                "load".to_string(),
                "-w".to_string(),
                LAUNCHD_PLIST_PATH.to_string(),
            ]],
        };
        for args in invocations {
            let output = env
                .runner
                .run("sudo", &args)
                .await
                .map_err(|e| FirewallError::Helper {
                    message: e.to_string(),
                })?;
            if !output.success() && !output.stderr.contains("already loaded") {
                return Err(FirewallError::Helper {
                    message: output.stderr.trim().to_string(),
                }
                .into());
            }
        }
        info!("Firewall helper activated");
        Ok(())
    }

    /// Stage files, commit, and activate
    #[instrument(skip_all)]
    pub async fn install(&self, env: &Env) -> Result<()> {
        let mut txn = Transaction::new();
        self.stage_install(&mut txn);
        txn.commit(env).await?;
        self.activate(env).await
    }

    /// Deactivate the service and remove the helper's files
    #[instrument(skip_all)]
    pub async fn uninstall(&self, env: &Env) -> Result<()> {
        let invocations: Vec<Vec<String>> = match self.kind {
            FirewallKind::Nftables => vec![vec![
                "systemctl".to_string(),
                "disable".to_string(),
                "--now".to_string(),
                SYSTEMD_UNIT_NAME.to_string(),
            ]],
            FirewallKind::Pf => vec![vec![
                "launchctl".to_string(),
                "unload".to_string(),
                LAUNCHD_PLIST_PATH.to_string(),
            ]],
        };
        for args in invocations {
            let output = env
                .runner
                .run("sudo", &args)
                .await
                .map_err(|e| FirewallError::Helper {
                    message: e.to_string(),
                })?;
            if !output.success() {
                debug!("Deactivation tolerated: {}", output.stderr.trim());
            }
        }

        let mut txn = Transaction::new();
        for (path, _) in self.files() {
            txn.delete(path, true);
        }
        txn.commit(env).await?;
        info!("Firewall helper uninstalled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::mock::{output_err, output_ok, MemFs, ScriptedRunner};
    use crate::env::FileSystem;
    use std::sync::Arc;

    fn env_on(os: &'static str, runner: Arc<ScriptedRunner>, fs: Arc<MemFs>) -> Env {
        Env::new(fs, runner, "/p").with_os(os)
    }

    #[tokio::test]
    async fn test_status_not_installed_on_empty_host() {
        let env = env_on(
            "linux",
            Arc::new(ScriptedRunner::new()),
            Arc::new(MemFs::new()),
        );
        let manager = HelperManager::new(FirewallKind::Nftables);
        // is-enabled succeeds in the default mock, but files are missing
        let status = manager.status(&env).await.unwrap();
        assert!(!status.installed);
        assert!(!status.needs_update);
    }

    #[tokio::test]
    async fn test_status_installed_when_files_and_service_match() {
        let fs = Arc::new(MemFs::new());
        fs.write(
            std::path::Path::new(SYSTEMD_UNIT_PATH),
            systemd_unit().as_bytes(),
        )
        .unwrap();
        fs.write(
            std::path::Path::new(NFT_ENTRY_FILE),
            nft_entry_ruleset().as_bytes(),
        )
        .unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl is-enabled", output_ok("enabled\n"));
        let env = env_on("linux", runner, fs);

        let status = HelperManager::new(FirewallKind::Nftables)
            .status(&env)
            .await
            .unwrap();
        assert!(status.installed);
        assert!(!status.needs_update);
    }

    #[tokio::test]
    async fn test_status_needs_update_on_content_drift() {
        let fs = Arc::new(MemFs::new());
        fs.write(
            std::path::Path::new(SYSTEMD_UNIT_PATH),
            b"[Unit]\nDescription=old version\n",
        )
        .unwrap();
        fs.write(
            std::path::Path::new(NFT_ENTRY_FILE),
            nft_entry_ruleset().as_bytes(),
        )
        .unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl is-enabled", output_ok("enabled\n"));
        let env = env_on("linux", runner, fs);

        let status = HelperManager::new(FirewallKind::Nftables)
            .status(&env)
            .await
            .unwrap();
        assert!(status.installed);
        assert!(status.needs_update);
    }

    #[tokio::test]
    async fn test_status_not_installed_when_service_inactive() {
        let fs = Arc::new(MemFs::new());
        fs.write(
            std::path::Path::new(SYSTEMD_UNIT_PATH),
            systemd_unit().as_bytes(),
        )
        .unwrap();
        fs.write(
            std::path::Path::new(NFT_ENTRY_FILE),
            nft_entry_ruleset().as_bytes(),
        )
        .unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("systemctl is-enabled", output_err(1, "disabled"));
        let env = env_on("linux", runner, fs);

        let status = HelperManager::new(FirewallKind::Nftables)
            .status(&env)
            .await
            .unwrap();
        assert!(!status.installed);
    }

    #[tokio::test]
    async fn test_install_writes_files_then_activates() {
        let fs = Arc::new(MemFs::new());
        let runner = Arc::new(ScriptedRunner::new());
        let env = env_on("linux", runner.clone(), fs);

        HelperManager::new(FirewallKind::Nftables)
            .install(&env)
            .await
            .unwrap();

        let calls = runner.calls();
        // One sudo file batch, then daemon-reload, then enable --now
        assert!(calls[0].starts_with("sudo sh -c"));
        assert_eq!(calls[1], "sudo systemctl daemon-reload");
        assert_eq!(
            calls[2],
            "sudo systemctl enable --now alcatraz-firewall.service"
        );
    }

    #[tokio::test]
    async fn test_macos_activate_tolerates_already_loaded() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "sudo launchctl load",
            output_err(1, "io.alcatraz.firewall: service already loaded"),
        );
        let env = env_on("macos", runner, Arc::new(MemFs::new()));
        HelperManager::new(FirewallKind::Pf)
            .activate(&env)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_uninstall_deactivates_and_removes() {
        let fs = Arc::new(MemFs::new());
        fs.write(std::path::Path::new(LAUNCHD_PLIST_PATH), b"plist").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let env = env_on("macos", runner.clone(), fs);

        HelperManager::new(FirewallKind::Pf)
            .uninstall(&env)
            .await
            .unwrap();

        let calls = runner.calls();
        assert!(calls[0].starts_with("sudo launchctl unload"));
        assert!(calls[1].contains("rm -f"));
    }
}
