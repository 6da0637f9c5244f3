//! Per-container firewall rules
//!
//! Each active project owns one rule fragment in a backend-specific
//! directory, plus a shared fragment that sorts after every project file
//! (`zz-shared.*`) so project rules take precedence under the backend's
//! file-ordering rules. Fragments are staged on the transactional FS and
//! committed sudo-batched; the reload itself is returned as a
//! [`ReloadAction`] so the orchestrator controls exactly when it runs
//! relative to the commit.
//!
//! Rule generation is default-deny: every allow from the LAN-access list is
//! emitted first, followed by a drop of all remaining outbound traffic from
//! the container IP. A rule list containing `*` short-circuits generation
//! entirely and cleans up any stale fragment.

use crate::config::{LanRule, NetworkPolicy, Protocol};
use crate::env::Env;
use crate::errors::{FirewallError, Result};
use crate::transaction::Transaction;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Linux fragment directory
const NFT_RULES_DIR: &str = "/etc/alcatraz/nft.d";
/// Linux entry ruleset, installed by the helper; `nft -f` target
pub(crate) const NFT_ENTRY_FILE: &str = "/etc/alcatraz/alcatraz.nft";
/// macOS fragment directory
const PF_RULES_DIR: &str = "/etc/alcatraz/pf.d";
/// macOS composed anchor file; `pfctl -f` target
pub(crate) const PF_ANCHOR_FILE: &str = "/etc/alcatraz/pf.rules";
/// pf anchor name owned by the tool
pub(crate) const PF_ANCHOR: &str = "alcatraz";
/// Shared fragment base name; `zz-` keeps it after project IDs in ASCII
const SHARED_BASE: &str = "zz-shared";

/// Available firewall backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallKind {
    /// nftables on Linux
    Nftables,
    /// pf on macOS
    Pf,
}

impl FirewallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallKind::Nftables => "nftables",
            FirewallKind::Pf => "pf",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            FirewallKind::Nftables => "nft",
            FirewallKind::Pf => "conf",
        }
    }

    fn rules_dir(&self) -> &'static Path {
        Path::new(match self {
            FirewallKind::Nftables => NFT_RULES_DIR,
            FirewallKind::Pf => PF_RULES_DIR,
        })
    }
}

/// Pick the firewall backend for this host; `None` means containers run
/// unrestricted (the orchestrator warns when isolation was requested)
#[instrument(skip_all)]
pub async fn detect(env: &Env) -> Option<FirewallKind> {
    match env.os() {
        "linux" => {
            let args = vec!["list".to_string(), "tables".to_string()];
            match env.runner.run("nft", &args).await {
                Ok(output) if output.success() => Some(FirewallKind::Nftables),
                Ok(output) => {
                    debug!("nft present but unusable: {}", output.stderr.trim());
                    None
                }
                Err(e) => {
                    debug!("nft not usable: {}", e);
                    None
                }
            }
        }
        "macos" => Some(FirewallKind::Pf),
        other => {
            debug!(os = other, "No firewall backend for this host");
            None
        }
    }
}

/// Lifecycle of a project's firewall configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallPhase {
    Unconfigured,
    FilesStaged,
    FilesCommitted,
    RulesLoaded,
    /// LAN access is `*`; no rules exist by design
    Skipped,
}

/// Stages rule fragments and hands the reload back as a post-commit action
#[derive(Debug)]
pub struct FirewallManager {
    kind: FirewallKind,
    phase: FirewallPhase,
    /// Fragment file names as they will exist after the staged transaction
    /// commits; seeded from disk on first use
    fragments: Option<BTreeSet<String>>,
}

impl FirewallManager {
    pub fn new(kind: FirewallKind) -> Self {
        FirewallManager {
            kind,
            phase: FirewallPhase::Unconfigured,
            fragments: None,
        }
    }

    pub fn kind(&self) -> FirewallKind {
        self.kind
    }

    pub fn phase(&self) -> FirewallPhase {
        self.phase
    }

    /// The fragment file for a project
    pub fn project_file(&self, project_id: &str) -> PathBuf {
        self.kind
            .rules_dir()
            .join(format!("{}.{}", project_id, self.kind.extension()))
    }

    /// The shared fragment, sorting after every project file
    pub fn shared_file(&self) -> PathBuf {
        self.kind
            .rules_dir()
            .join(format!("{}.{}", SHARED_BASE, self.kind.extension()))
    }

    fn fragments_mut(&mut self, env: &Env) -> &mut BTreeSet<String> {
        let kind = self.kind;
        self.fragments.get_or_insert_with(|| {
            env.fs
                .read_dir(kind.rules_dir())
                .unwrap_or_default()
                .into_iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect()
        })
    }

    /// Stage removal of fragments that no longer match a known container
    #[instrument(skip_all)]
    pub fn stage_clean_stale(
        &mut self,
        env: &Env,
        txn: &mut Transaction,
        active_project_ids: &[String],
    ) {
        let dir = self.kind.rules_dir().to_path_buf();
        let shared = format!("{}.{}", SHARED_BASE, self.kind.extension());
        let extension = self.kind.extension();
        let fragments = self.fragments_mut(env);
        let stale: Vec<String> = fragments
            .iter()
            .filter(|name| {
                if **name == shared {
                    return false;
                }
                let stem = name.strip_suffix(&format!(".{}", extension)).unwrap_or(name);
                !active_project_ids.iter().any(|id| id == stem)
            })
            .cloned()
            .collect();
        for name in stale {
            debug!(fragment = %name, "Removing stale firewall fragment");
            txn.delete(dir.join(&name), true);
            fragments.remove(&name);
        }
    }

    /// Stage this project's rule fragment (or its removal for a wildcard
    /// policy), the shared sentinel, and on pf the recomposed anchor file.
    #[instrument(skip_all, fields(project_id))]
    pub fn stage_rules(
        &mut self,
        env: &Env,
        txn: &mut Transaction,
        project_id: &str,
        container_id: &str,
        container_ip: &str,
        network: &NetworkPolicy,
    ) {
        let project_file = self.project_file(project_id);
        let project_name = format!("{}.{}", project_id, self.kind.extension());

        if network.allows_everything() {
            debug!("LAN access is '*'; skipping rule generation");
            if env.fs.exists(&project_file) {
                txn.delete(&project_file, true);
            }
            self.fragments_mut(env).remove(&project_name);
            if self.kind == FirewallKind::Pf {
                self.stage_anchor(txn);
            }
            self.phase = FirewallPhase::Skipped;
            return;
        }

        let content = self.render_rules(container_id, container_ip, &network.lan_access);
        txn.update(&project_file, content.into_bytes(), Some(0o644), true);
        self.fragments_mut(env).insert(project_name);

        let shared = self.shared_file();
        if !env.fs.exists(&shared) {
            txn.create(
                &shared,
                b"# shared alcatraz rules\n".to_vec(),
                Some(0o644),
                true,
            );
        }
        let shared_name = format!("{}.{}", SHARED_BASE, self.kind.extension());
        self.fragments_mut(env).insert(shared_name);

        if self.kind == FirewallKind::Pf {
            self.stage_anchor(txn);
        }
        self.phase = FirewallPhase::FilesStaged;
    }

    /// Stage removal of the project's fragment on teardown
    pub fn stage_teardown(&mut self, env: &Env, txn: &mut Transaction, project_id: &str) {
        let project_file = self.project_file(project_id);
        if env.fs.exists(&project_file) {
            txn.delete(&project_file, true);
        }
        let project_name = format!("{}.{}", project_id, self.kind.extension());
        self.fragments_mut(env).remove(&project_name);
        if self.kind == FirewallKind::Pf {
            self.stage_anchor(txn);
        }
        self.phase = FirewallPhase::Unconfigured;
    }

    /// pf has no include-glob, so the anchor file lists every fragment in
    /// filename order (project files first, `zz-shared` last)
    fn stage_anchor(&mut self, txn: &mut Transaction) {
        let dir = self.kind.rules_dir().to_path_buf();
        let includes: String = self
            .fragments
            .as_ref()
            .map(|fragments| {
                fragments
                    .iter()
                    .map(|name| format!("include \"{}\"\n", dir.join(name).display()))
                    .collect()
            })
            .unwrap_or_default();
        let content = format!("# composed by alcatraz; do not edit\n{}", includes);
        txn.update(PF_ANCHOR_FILE, content.into_bytes(), Some(0o644), true);
    }

    /// Render one project's rule fragment: allows first, then the
    /// default-deny for everything else leaving the container IP
    pub fn render_rules(&self, container_id: &str, container_ip: &str, rules: &[LanRule]) -> String {
        match self.kind {
            FirewallKind::Nftables => render_nft(container_id, container_ip, rules),
            FirewallKind::Pf => render_pf(container_id, container_ip, rules),
        }
    }

    /// Record that the staged files were committed
    pub fn mark_committed(&mut self) {
        if self.phase == FirewallPhase::FilesStaged {
            self.phase = FirewallPhase::FilesCommitted;
        }
    }

    /// Record that the reload ran successfully
    pub fn mark_loaded(&mut self) {
        if self.phase == FirewallPhase::FilesCommitted {
            self.phase = FirewallPhase::RulesLoaded;
        }
    }

    /// The backend reload, returned so the caller decides when it runs
    /// relative to other commits
    pub fn reload_action(&self) -> ReloadAction {
        ReloadAction { kind: self.kind }
    }
}

fn render_nft(container_id: &str, container_ip: &str, rules: &[LanRule]) -> String {
    let mut body = String::new();
    for rule in rules {
        let LanRule::Allow {
            dest,
            port,
            protocol,
        } = rule
        else {
            continue;
        };
        match (port, protocol) {
            (Some(port), Protocol::Tcp) => body.push_str(&format!(
                "        ip saddr {} ip daddr {} tcp dport {} accept\n",
                container_ip, dest, port
            )),
            (Some(port), Protocol::Udp) => body.push_str(&format!(
                "        ip saddr {} ip daddr {} udp dport {} accept\n",
                container_ip, dest, port
            )),
            (Some(port), Protocol::All) => {
                body.push_str(&format!(
                    "        ip saddr {} ip daddr {} tcp dport {} accept\n",
                    container_ip, dest, port
                ));
                body.push_str(&format!(
                    "        ip saddr {} ip daddr {} udp dport {} accept\n",
                    container_ip, dest, port
                ));
            }
            (None, Protocol::Tcp) => body.push_str(&format!(
                "        ip saddr {} ip daddr {} ip protocol tcp accept\n",
                container_ip, dest
            )),
            (None, Protocol::Udp) => body.push_str(&format!(
                "        ip saddr {} ip daddr {} ip protocol udp accept\n",
                container_ip, dest
            )),
            (None, Protocol::All) => body.push_str(&format!(
                "        ip saddr {} ip daddr {} accept\n",
                container_ip, dest
            )),
        }
    }
    format!(
        "# alcatraz: container {}\n\
         table inet alcatraz {{\n    chain forward {{\n{}        ip saddr {} drop\n    }}\n}}\n",
        container_id, body, container_ip
    )
}

fn render_pf(container_id: &str, container_ip: &str, rules: &[LanRule]) -> String {
    let mut body = String::new();
    for rule in rules {
        let LanRule::Allow {
            dest,
            port,
            protocol,
        } = rule
        else {
            continue;
        };
        match (port, protocol) {
            (Some(port), Protocol::Tcp) => body.push_str(&format!(
                "pass out quick proto tcp from {} to {} port {}\n",
                container_ip, dest, port
            )),
            (Some(port), Protocol::Udp) => body.push_str(&format!(
                "pass out quick proto udp from {} to {} port {}\n",
                container_ip, dest, port
            )),
            (Some(port), Protocol::All) => {
                body.push_str(&format!(
                    "pass out quick proto tcp from {} to {} port {}\n",
                    container_ip, dest, port
                ));
                body.push_str(&format!(
                    "pass out quick proto udp from {} to {} port {}\n",
                    container_ip, dest, port
                ));
            }
            (None, Protocol::Tcp) => body.push_str(&format!(
                "pass out quick proto tcp from {} to {}\n",
                container_ip, dest
            )),
            (None, Protocol::Udp) => body.push_str(&format!(
                "pass out quick proto udp from {} to {}\n",
                container_ip, dest
            )),
            (None, Protocol::All) => body.push_str(&format!(
                "pass out quick from {} to {}\n",
                container_ip, dest
            )),
        }
    }
    format!(
        "# alcatraz: container {}\n{}block out quick from {} to any\n",
        container_id, body, container_ip
    )
}

/// A deferred backend reload. Running it after the file commit is the
/// caller's responsibility, which keeps ordering across apply sites
/// deterministic.
#[derive(Debug, Clone)]
pub struct ReloadAction {
    kind: FirewallKind,
}

impl ReloadAction {
    #[instrument(skip_all, fields(backend = self.kind.as_str()))]
    pub async fn run(&self, env: &Env) -> Result<()> {
        let args: Vec<String> = match self.kind {
            FirewallKind::Nftables => vec![
                "nft".to_string(),
                "-f".to_string(),
                NFT_ENTRY_FILE.to_string(),
            ],
            FirewallKind::Pf => vec![
                "pfctl".to_string(),
                "-a".to_string(),
                PF_ANCHOR.to_string(),
                "-f".to_string(),
                PF_ANCHOR_FILE.to_string(),
            ],
        };
        let output = env
            .runner
            .run("sudo", &args)
            .await
            .map_err(|e| FirewallError::Reload {
                message: e.to_string(),
            })?;
        if !output.success() {
            return Err(FirewallError::Reload {
                message: output.stderr.trim().to_string(),
            }
            .into());
        }
        debug!("Firewall rules reloaded");
        Ok(())
    }
}

/// Warn that containers run unrestricted; used when no backend is available
/// but the configuration asked for isolation
pub fn warn_isolation_unavailable() -> String {
    let message = "No supported firewall backend is available; network isolation is NOT in effect"
        .to_string();
    warn!("{}", message);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::mock::{output_err, output_ok, MemFs, ScriptedRunner};
    use std::sync::Arc;

    fn env_on(os: &'static str, runner: Arc<ScriptedRunner>, fs: Arc<MemFs>) -> Env {
        Env::new(fs, runner, "/p").with_os(os)
    }

    fn allow(dest: &str, port: Option<u16>, protocol: Protocol) -> LanRule {
        LanRule::Allow {
            dest: dest.to_string(),
            port,
            protocol,
        }
    }

    #[tokio::test]
    async fn test_detect_nftables_when_nft_works() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("nft list tables", output_ok("table inet filter\n"));
        let env = env_on("linux", runner, Arc::new(MemFs::new()));
        assert_eq!(detect(&env).await, Some(FirewallKind::Nftables));
    }

    #[tokio::test]
    async fn test_detect_none_when_nft_unusable() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("nft list tables", output_err(1, "Operation not permitted"));
        let env = env_on("linux", runner, Arc::new(MemFs::new()));
        assert_eq!(detect(&env).await, None);

        let runner = Arc::new(ScriptedRunner::new());
        runner.missing_binary("nft");
        let env = env_on("linux", runner, Arc::new(MemFs::new()));
        assert_eq!(detect(&env).await, None);
    }

    #[tokio::test]
    async fn test_detect_pf_on_macos() {
        let env = env_on("macos", Arc::new(ScriptedRunner::new()), Arc::new(MemFs::new()));
        assert_eq!(detect(&env).await, Some(FirewallKind::Pf));
    }

    #[test]
    fn test_nft_rules_default_deny_after_allows() {
        let manager = FirewallManager::new(FirewallKind::Nftables);
        let rules = vec![
            allow("192.168.1.0/24", Some(443), Protocol::Tcp),
            allow("10.0.0.53", Some(53), Protocol::All),
            allow("172.16.0.0/12", None, Protocol::All),
        ];
        let text = manager.render_rules("cid", "172.17.0.2", &rules);

        assert!(text.contains("ip saddr 172.17.0.2 ip daddr 192.168.1.0/24 tcp dport 443 accept"));
        assert!(text.contains("ip saddr 172.17.0.2 ip daddr 10.0.0.53 tcp dport 53 accept"));
        assert!(text.contains("ip saddr 172.17.0.2 ip daddr 10.0.0.53 udp dport 53 accept"));
        assert!(text.contains("ip saddr 172.17.0.2 ip daddr 172.16.0.0/12 accept"));
        // Deny comes last
        let deny_pos = text.find("ip saddr 172.17.0.2 drop").unwrap();
        let last_accept = text.rfind("accept").unwrap();
        assert!(deny_pos > last_accept);
    }

    #[test]
    fn test_pf_rules_block_last() {
        let manager = FirewallManager::new(FirewallKind::Pf);
        let rules = vec![allow("192.168.1.10", Some(5432), Protocol::Tcp)];
        let text = manager.render_rules("cid", "192.168.64.3", &rules);
        assert!(text.contains("pass out quick proto tcp from 192.168.64.3 to 192.168.1.10 port 5432"));
        assert!(text.trim_end().ends_with("block out quick from 192.168.64.3 to any"));
    }

    #[test]
    fn test_project_files_sort_before_shared_sentinel() {
        let manager = FirewallManager::new(FirewallKind::Nftables);
        let project = manager.project_file("0f3b2c1d-aaaa-bbbb-cccc-000000000001");
        let shared = manager.shared_file();
        let project_name = project.file_name().unwrap().to_string_lossy().into_owned();
        let shared_name = shared.file_name().unwrap().to_string_lossy().into_owned();
        assert!(project_name < shared_name);
    }

    #[tokio::test]
    async fn test_wildcard_skips_and_cleans_stale_file() {
        let fs = Arc::new(
            MemFs::new().with_file("/etc/alcatraz/nft.d/pid-1.nft", "old rules"),
        );
        let env = env_on("linux", Arc::new(ScriptedRunner::new()), fs);

        let mut manager = FirewallManager::new(FirewallKind::Nftables);
        let mut txn = Transaction::new();
        let network = NetworkPolicy {
            lan_access: vec![LanRule::Wildcard],
        };
        manager.stage_rules(&env, &mut txn, "pid-1", "cid", "172.17.0.2", &network);

        assert_eq!(manager.phase(), FirewallPhase::Skipped);
        assert_eq!(txn.len(), 1);
        assert_eq!(txn.ops()[0].kind, crate::transaction::FileOpKind::Delete);
        assert_eq!(
            txn.ops()[0].path,
            PathBuf::from("/etc/alcatraz/nft.d/pid-1.nft")
        );
    }

    #[tokio::test]
    async fn test_stage_rules_writes_fragment_and_sentinel() {
        let env = env_on("linux", Arc::new(ScriptedRunner::new()), Arc::new(MemFs::new()));
        let mut manager = FirewallManager::new(FirewallKind::Nftables);
        let mut txn = Transaction::new();
        let network = NetworkPolicy {
            lan_access: vec![allow("192.168.1.0/24", None, Protocol::All)],
        };
        manager.stage_rules(&env, &mut txn, "pid-1", "cid", "172.17.0.2", &network);

        assert_eq!(manager.phase(), FirewallPhase::FilesStaged);
        let paths: Vec<_> = txn.ops().iter().map(|op| op.path.clone()).collect();
        assert!(paths.contains(&PathBuf::from("/etc/alcatraz/nft.d/pid-1.nft")));
        assert!(paths.contains(&PathBuf::from("/etc/alcatraz/nft.d/zz-shared.nft")));
        assert!(txn.ops().iter().all(|op| op.needs_sudo));

        manager.mark_committed();
        assert_eq!(manager.phase(), FirewallPhase::FilesCommitted);
        manager.mark_loaded();
        assert_eq!(manager.phase(), FirewallPhase::RulesLoaded);
    }

    #[tokio::test]
    async fn test_stage_clean_stale_keeps_active_and_shared() {
        let fs = Arc::new(
            MemFs::new()
                .with_file("/etc/alcatraz/nft.d/active.nft", "x")
                .with_file("/etc/alcatraz/nft.d/stale.nft", "x")
                .with_file("/etc/alcatraz/nft.d/zz-shared.nft", "x"),
        );
        let env = env_on("linux", Arc::new(ScriptedRunner::new()), fs);

        let mut manager = FirewallManager::new(FirewallKind::Nftables);
        let mut txn = Transaction::new();
        manager.stage_clean_stale(&env, &mut txn, &["active".to_string()]);

        let deleted: Vec<_> = txn.ops().iter().map(|op| op.path.clone()).collect();
        assert_eq!(deleted, vec![PathBuf::from("/etc/alcatraz/nft.d/stale.nft")]);
    }

    #[tokio::test]
    async fn test_pf_anchor_lists_fragments_in_order() {
        let fs = Arc::new(MemFs::new().with_file("/etc/alcatraz/pf.d/other.conf", "x"));
        let env = env_on("macos", Arc::new(ScriptedRunner::new()), fs);

        let mut manager = FirewallManager::new(FirewallKind::Pf);
        let mut txn = Transaction::new();
        let network = NetworkPolicy {
            lan_access: vec![allow("192.168.1.0/24", None, Protocol::All)],
        };
        manager.stage_rules(&env, &mut txn, "pid-1", "cid", "192.168.64.3", &network);

        let anchor = txn
            .ops()
            .iter()
            .find(|op| op.path == PathBuf::from(PF_ANCHOR_FILE))
            .expect("anchor staged");
        let content = String::from_utf8(anchor.contents.clone()).unwrap();
        let other = content.find("other.conf").unwrap();
        let project = content.find("pid-1.conf").unwrap();
        let shared = content.find("zz-shared.conf").unwrap();
        assert!(other < project && project < shared);
    }

    #[tokio::test]
    async fn test_reload_action_invocations() {
        let runner = Arc::new(ScriptedRunner::new());
        let env = env_on("linux", runner.clone(), Arc::new(MemFs::new()));
        FirewallManager::new(FirewallKind::Nftables)
            .reload_action()
            .run(&env)
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec!["sudo nft -f /etc/alcatraz/alcatraz.nft"]
        );

        let runner = Arc::new(ScriptedRunner::new());
        let env = env_on("macos", runner.clone(), Arc::new(MemFs::new()));
        FirewallManager::new(FirewallKind::Pf)
            .reload_action()
            .run(&env)
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec!["sudo pfctl -a alcatraz -f /etc/alcatraz/pf.rules"]
        );
    }

    #[tokio::test]
    async fn test_reload_failure_is_reported() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("sudo nft -f", output_err(1, "syntax error"));
        let env = env_on("linux", runner, Arc::new(MemFs::new()));
        let err = FirewallManager::new(FirewallKind::Nftables)
            .reload_action()
            .run(&env)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("syntax error"));
    }
}
