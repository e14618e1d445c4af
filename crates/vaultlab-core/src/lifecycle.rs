//! The lab lifecycle controller.
//!
//! [`Lab`] sequences the other components for each command. `start` runs
//! strictly in order: preconditions, provisioning, TLS, Consul, Vault
//! launch, init/unseal, demo features, then persisting the config. Every
//! step either completes or aborts the command.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backup::{
    BackupEntry, BackupStore, Confirm, CreateRequest, ToolVersions, API_EXPORT_DIR,
};
use crate::client::{self, ConsulClient, SealStatus, VaultClient};
use crate::config::{LabConfig, LabContext};
use crate::error::{BackupError, LabError, ProcessError};
use crate::features::{self, FeatureReport};
use crate::hcl;
use crate::init;
use crate::paths::MAX_VAULT_NODES;
use crate::provision::{self, HashicorpReleases, Platform, Product, Provisioner};
use crate::state::{self, AppRoleCredential, UnsealMaterial};
use crate::supervisor::{self, ServerSpec};
use crate::tls;

/// Coarse lab state reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabState {
    Stopped,
    RunningSealed,
    RunningUnsealed,
}

impl LabState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::RunningSealed => "running (sealed)",
            Self::RunningUnsealed => "running (unsealed)",
        }
    }
}

/// One server in a status report.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub address: String,
    /// Present for live Vault nodes that answered `sys/seal-status`.
    pub seal: Option<SealStatus>,
}

/// Read-only snapshot of the lab.
#[derive(Debug, Clone)]
pub struct LabStatus {
    pub state: LabState,
    /// Persisted configuration, `None` before the first `start`.
    pub config: Option<LabConfig>,
    pub vault_nodes: Vec<NodeStatus>,
    pub consul: Option<NodeStatus>,
}

/// Connection details printed after `start` and exported by `shell`.
#[derive(Debug, Clone, Default)]
pub struct AccessInfo {
    pub vault_addrs: Vec<String>,
    pub root_token: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub consul_addr: Option<String>,
    pub consul_token: Option<String>,
    pub approle: Option<AppRoleCredential>,
    pub base_dir: PathBuf,
}

impl AccessInfo {
    /// Environment variables a Vault/Consul CLI needs to reach the lab.
    #[must_use]
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        if let Some(addr) = self.vault_addrs.first() {
            env.push(("VAULT_ADDR", addr.clone()));
        }
        if let Some(token) = &self.root_token {
            env.push(("VAULT_TOKEN", token.clone()));
        }
        if let Some(ca) = &self.ca_cert {
            env.push(("VAULT_CACERT", ca.display().to_string()));
        }
        if let Some(addr) = &self.consul_addr {
            env.push(("CONSUL_HTTP_ADDR", addr.clone()));
        }
        if let Some(token) = &self.consul_token {
            env.push(("CONSUL_HTTP_TOKEN", token.clone()));
        }
        env
    }
}

/// Result of a successful `start`/`restart`/`reset`.
#[derive(Debug, Clone)]
pub struct Started {
    pub access: AccessInfo,
    pub features: FeatureReport,
    /// `true` when this start ran `sys/init`.
    pub initialized: bool,
}

/// Result of `restore`.
#[derive(Debug, Clone)]
pub struct Restored {
    pub entry: BackupEntry,
    pub config: LabConfig,
    /// Set when the lab was running before and has been started again.
    pub restarted: Option<Started>,
}

/// Drives the lab through its lifecycle.
pub struct Lab {
    ctx: LabContext,
    http: reqwest::Client,
}

impl Lab {
    /// # Errors
    ///
    /// Returns [`LabError::Api`] if the HTTP client cannot be built.
    pub fn new(ctx: LabContext) -> Result<Self, LabError> {
        let http = build_http(&ctx)?;
        Ok(Self { ctx, http })
    }

    #[must_use]
    pub fn context(&self) -> &LabContext {
        &self.ctx
    }

    #[must_use]
    pub fn backups(&self) -> BackupStore {
        BackupStore::new(self.ctx.paths.clone())
    }

    fn refresh_http(&mut self) -> Result<(), LabError> {
        self.http = build_http(&self.ctx)?;
        Ok(())
    }

    // ── server specs ─────────────────────────────────────────────────

    fn vault_spec(&self, node: usize, configured: bool) -> ServerSpec {
        let p = &self.ctx.paths;
        let config = p.vault_config(node);
        let name = if node == 1 {
            "vault".to_owned()
        } else {
            format!("vault-node{node}")
        };
        ServerSpec::new(
            name,
            &p.binary(Product::Vault.as_str()),
            vec!["server".to_owned(), format!("-config={}", config.display())],
            &config,
            if configured { self.ctx.ports.vault_api(node) } else { 0 },
            p.vault_log(node),
            p.vault_pid(node),
        )
    }

    fn consul_spec(&self, configured: bool) -> ServerSpec {
        let p = &self.ctx.paths;
        let config = p.consul_config();
        ServerSpec::new(
            "consul",
            &p.binary(Product::Consul.as_str()),
            vec!["agent".to_owned(), format!("-config-file={}", config.display())],
            &config,
            if configured { self.ctx.ports.consul_http } else { 0 },
            p.consul_log(),
            p.consul_pid(),
        )
    }

    fn node_count(&self) -> usize {
        self.ctx.lab.cluster_mode.node_count()
    }

    fn vault_clients(&self) -> Vec<VaultClient> {
        (1..=self.node_count())
            .map(|n| VaultClient::new(self.http.clone(), self.vault_addr(n)))
            .collect()
    }

    fn vault_addr(&self, node: usize) -> String {
        hcl::vault_addr(&self.ctx.lab, &self.ctx.ports, node)
    }

    /// Whether any Vault node's PID file names a live Vault process of
    /// this lab.
    #[must_use]
    pub fn is_running(&self) -> bool {
        (1..=MAX_VAULT_NODES).any(|n| supervisor::tracked_pid(&self.vault_spec(n, false)).is_some())
    }

    // ── start ────────────────────────────────────────────────────────

    /// Bring the lab from stopped to running-unsealed with features
    /// configured.
    ///
    /// # Errors
    ///
    /// Any precondition, provisioning, process, init, or API failure.
    pub async fn start(&mut self) -> Result<Started, LabError> {
        self.check_not_running()?;
        self.check_ports()?;
        self.provision(true).await?;
        self.launch_and_configure().await
    }

    /// Stop, then start again on the existing data. Binaries are only
    /// provisioned if missing.
    ///
    /// # Errors
    ///
    /// As for [`Lab::start`].
    pub async fn restart(&mut self) -> Result<Started, LabError> {
        self.stop().await;
        self.check_ports()?;
        self.provision(false).await?;
        self.launch_and_configure().await
    }

    /// Wipe all lab data, then start fresh.
    ///
    /// # Errors
    ///
    /// As for [`Lab::start`], plus I/O failures while wiping.
    pub async fn reset(&mut self) -> Result<Started, LabError> {
        self.cleanup().await?;
        self.start().await
    }

    fn check_not_running(&self) -> Result<(), LabError> {
        let mut specs: Vec<ServerSpec> = (1..=MAX_VAULT_NODES)
            .map(|n| self.vault_spec(n, false))
            .collect();
        specs.push(self.consul_spec(false));
        for spec in specs {
            if let Some(pid) = supervisor::tracked_pid(&spec) {
                return Err(ProcessError::AlreadyRunning {
                    name: spec.name,
                    pid,
                }
                .into());
            }
        }
        Ok(())
    }

    fn check_ports(&self) -> Result<(), LabError> {
        let ports = &self.ctx.ports;
        let mut wanted: Vec<(String, u16)> = Vec::new();
        for n in 1..=self.node_count() {
            let name = self.vault_spec(n, true).name;
            wanted.push((name.clone(), ports.vault_api(n)));
            wanted.push((name, ports.vault_cluster(n)));
        }
        if self.ctx.lab.uses_consul() {
            for port in ports.consul_listeners() {
                wanted.push(("consul".to_owned(), port));
            }
        }
        for (name, port) in wanted {
            if supervisor::port_in_use(port) {
                return Err(ProcessError::PortInUse { name, port }.into());
            }
        }
        Ok(())
    }

    async fn provision(&self, always: bool) -> Result<(), LabError> {
        let mut products = vec![(Product::Vault, &self.ctx.vault_version)];
        if self.ctx.lab.uses_consul() {
            products.push((Product::Consul, &self.ctx.consul_version));
        }
        let paths = &self.ctx.paths;
        if !always
            && products
                .iter()
                .all(|(p, _)| paths.binary(p.as_str()).is_file())
        {
            debug!("binaries present, skipping provisioning");
            return Ok(());
        }

        if let Err(e) = provision::check_tools() {
            let have_all = products
                .iter()
                .all(|(p, _)| paths.binary(p.as_str()).is_file());
            if !(self.ctx.allow_binary_fallback && have_all) {
                return Err(e.into());
            }
            warn!(error = %e, "continuing with existing binaries");
            return Ok(());
        }

        let provisioner = Provisioner::new(
            HashicorpReleases::new(self.http.clone()),
            paths.clone(),
            Platform::current()?,
            self.ctx.allow_binary_fallback,
        );
        for (product, spec) in products {
            let got = provisioner.ensure(product, spec).await?;
            debug!(%product, source = ?got.source, path = %got.path.display(), "binary ready");
        }
        Ok(())
    }

    async fn launch_and_configure(&mut self) -> Result<Started, LabError> {
        let paths = self.ctx.paths.clone();
        for dir in [paths.vault_data(), paths.vault_storage()] {
            std::fs::create_dir_all(&dir).map_err(LabError::io(&dir))?;
        }

        if self.ctx.lab.tls_enabled {
            tls::ensure_material(&paths)?;
            self.refresh_http()?;
        }

        let consul_token = if self.ctx.lab.uses_consul() {
            Some(self.start_consul().await?)
        } else {
            None
        };

        let timeout = self.ctx.timeouts.vault_ready(&self.ctx.lab);
        let interval = self.ctx.timeouts.poll_interval;
        for node in 1..=self.node_count() {
            let config = paths.vault_config(node);
            let body = hcl::vault_config(
                &self.ctx.lab,
                &paths,
                &self.ctx.ports,
                node,
                consul_token.as_deref(),
            );
            std::fs::write(&config, body).map_err(LabError::io(&config))?;

            let spec = self.vault_spec(node, true);
            let handle = supervisor::launch(&spec)?;
            let url = format!("{}/v1/sys/seal-status", self.vault_addr(node));
            supervisor::wait_ready(&self.http, &handle.name, &url, &handle.log_path, timeout, interval)
                .await?;
        }

        let nodes = self.vault_clients();
        let initialized = init::bring_up(&nodes, &paths, timeout, interval).await?;
        let root = nodes[0]
            .clone()
            .with_token(initialized.material.root_token.clone());
        let features = features::configure(&root, &paths).await?;

        self.ctx.lab.save(&paths.lab_config())?;
        info!(
            backend = %self.ctx.lab.backend_type,
            cluster = %self.ctx.lab.cluster_mode,
            tls = self.ctx.lab.tls_enabled,
            "lab is up"
        );

        Ok(Started {
            access: self.access_info(),
            features,
            initialized: initialized.fresh,
        })
    }

    /// Launch Consul, wait for a leader, and return the management token.
    async fn start_consul(&self) -> Result<String, LabError> {
        let paths = &self.ctx.paths;
        for dir in [paths.consul_data(), paths.consul_state_dir()] {
            std::fs::create_dir_all(&dir).map_err(LabError::io(&dir))?;
        }
        let token_path = paths.consul_token();
        let token = match state::read_secret(&token_path).map_err(LabError::io(&token_path))? {
            Some(t) => t,
            None => {
                let t = uuid::Uuid::new_v4().to_string();
                state::write_secret(&token_path, &t).map_err(LabError::io(&token_path))?;
                t
            }
        };
        let config = paths.consul_config();
        std::fs::write(&config, hcl::consul_config(paths, &self.ctx.ports, &token))
            .map_err(LabError::io(&config))?;

        let spec = self.consul_spec(true);
        let handle = supervisor::launch(&spec)?;
        let consul = ConsulClient::new(self.http.clone(), hcl::consul_addr(&self.ctx.ports));
        let timeout = self.ctx.timeouts.extended;
        let interval = self.ctx.timeouts.poll_interval;
        let leader_url = format!("{}/v1/status/leader", consul.addr());
        supervisor::wait_ready(&self.http, &handle.name, &leader_url, &handle.log_path, timeout, interval)
            .await?;

        let elected = supervisor::poll_until(timeout, interval, || async {
            matches!(consul.leader().await, Ok(Some(_)))
        })
        .await;
        if !elected {
            return Err(ProcessError::ReadinessTimeout {
                name: handle.name,
                url: leader_url,
                timeout_secs: timeout.as_secs(),
                log_tail: supervisor::log_tail(&handle.log_path, 20),
                log_path: handle.log_path,
            }
            .into());
        }
        info!("consul leader elected");
        Ok(token)
    }

    // ── stop / cleanup ───────────────────────────────────────────────

    /// Stop every managed server: Vault nodes first, then Consul. Never
    /// fails; returns the number of processes terminated.
    pub async fn stop(&self) -> usize {
        let grace = self.ctx.timeouts.stop_grace;
        let configured = self.node_count();
        let mut stopped = 0;
        for node in (1..=MAX_VAULT_NODES).rev() {
            let spec = self.vault_spec(node, node <= configured);
            stopped += supervisor::stop(&spec, grace).await.stopped.len();
        }
        let consul = self.consul_spec(self.ctx.lab.uses_consul());
        stopped += supervisor::stop(&consul, grace).await.stopped.len();
        if stopped == 0 {
            info!("nothing was running");
        } else {
            info!(count = stopped, "lab stopped");
        }
        stopped
    }

    /// Stop, then delete and recreate the data directories empty and
    /// forget the persisted configuration. Binaries and backups are kept.
    ///
    /// # Errors
    ///
    /// I/O failures while deleting or recreating directories.
    pub async fn cleanup(&self) -> Result<(), LabError> {
        self.stop().await;
        let paths = &self.ctx.paths;
        for dir in paths.data_dirs() {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!(dir = %dir.display(), "removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(LabError::io(&dir)(e)),
            }
            std::fs::create_dir_all(&dir).map_err(LabError::io(&dir))?;
        }
        let config = paths.lab_config();
        if config.exists() {
            std::fs::remove_file(&config).map_err(LabError::io(&config))?;
        }
        info!(base = %paths.base().display(), "lab data wiped");
        Ok(())
    }

    // ── status / access ──────────────────────────────────────────────

    /// Liveness from PID files, seal state from live nodes. Read-only.
    pub async fn status(&self) -> LabStatus {
        let paths = &self.ctx.paths;
        let config = LabConfig::load(&paths.lab_config()).unwrap_or_else(|e| {
            warn!(error = %e, "ignoring unreadable lab config");
            None
        });
        let lab = config.unwrap_or(self.ctx.lab);

        let mut vault_nodes = Vec::new();
        for node in 1..=lab.cluster_mode.node_count() {
            let address = hcl::vault_addr(&lab, &self.ctx.ports, node);
            let pid = supervisor::tracked_pid(&self.vault_spec(node, true));
            let seal = if pid.is_some() {
                VaultClient::new(self.http.clone(), address.clone())
                    .seal_status()
                    .await
                    .map_err(|e| debug!(node, error = %e, "seal status unavailable"))
                    .ok()
            } else {
                None
            };
            vault_nodes.push(NodeStatus {
                name: self.vault_spec(node, true).name,
                pid,
                port: self.ctx.ports.vault_api(node),
                address,
                seal,
            });
        }

        let consul = lab.uses_consul().then(|| NodeStatus {
            name: "consul".to_owned(),
            pid: supervisor::tracked_pid(&self.consul_spec(true)),
            port: self.ctx.ports.consul_http,
            address: hcl::consul_addr(&self.ctx.ports),
            seal: None,
        });

        let live: Vec<&NodeStatus> = vault_nodes.iter().filter(|n| n.pid.is_some()).collect();
        let state = if live.is_empty() {
            LabState::Stopped
        } else if live
            .iter()
            .all(|n| n.seal.as_ref().is_some_and(|s| s.initialized && !s.sealed))
        {
            LabState::RunningUnsealed
        } else {
            LabState::RunningSealed
        };

        LabStatus {
            state,
            config,
            vault_nodes,
            consul,
        }
    }

    /// Connection details from the files on disk.
    #[must_use]
    pub fn access_info(&self) -> AccessInfo {
        let paths = &self.ctx.paths;
        let lab = &self.ctx.lab;
        let material = UnsealMaterial::load(paths).ok().flatten();
        AccessInfo {
            vault_addrs: (1..=self.node_count()).map(|n| self.vault_addr(n)).collect(),
            root_token: material.map(|m| m.root_token),
            ca_cert: (lab.tls_enabled && paths.ca_cert().is_file()).then(|| paths.ca_cert()),
            consul_addr: lab.uses_consul().then(|| hcl::consul_addr(&self.ctx.ports)),
            consul_token: if lab.uses_consul() {
                state::read_secret(&paths.consul_token()).ok().flatten()
            } else {
                None
            },
            approle: AppRoleCredential::load(paths).ok().flatten(),
            base_dir: paths.base().to_path_buf(),
        }
    }

    /// Run `$SHELL` (or `/bin/sh`) with the lab's environment and
    /// `<base>/bin` first on `PATH`.
    ///
    /// # Errors
    ///
    /// [`LabError::Io`] if the shell cannot be spawned.
    pub async fn shell(&self) -> Result<ExitStatus, LabError> {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_owned());
        let access = self.access_info();
        if access.root_token.is_none() {
            warn!("no root token found; VAULT_TOKEN will not be set");
        }

        let bin = self.ctx.paths.bin_dir();
        let mut search = vec![bin];
        if let Some(existing) = std::env::var_os("PATH") {
            search.extend(std::env::split_paths(&existing));
        }
        let path = std::env::join_paths(search).map_err(|e| {
            LabError::io(self.ctx.paths.bin_dir())(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                e,
            ))
        })?;

        info!(%shell, "entering lab shell (exit to return)");
        let mut cmd = tokio::process::Command::new(&shell);
        cmd.envs(access.env()).env("PATH", path);
        cmd.status().await.map_err(LabError::io(PathBuf::from(&shell)))
    }

    // ── backups ──────────────────────────────────────────────────────

    /// Snapshot the lab, exporting API state as well when it is running.
    ///
    /// # Errors
    ///
    /// Any [`BackupError`] from the store.
    pub async fn backup(
        &self,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<BackupEntry, LabError> {
        if let Some(n) = &name {
            crate::backup::validate_name(n)?;
        }
        let running = self.is_running();
        let api_export = if running {
            self.export_api_state().await
        } else {
            Vec::new()
        };
        let paths = &self.ctx.paths;
        let tool_versions = ToolVersions {
            vault: provision::installed_version(&paths.binary(Product::Vault.as_str()))
                .await
                .map(|v| v.to_string()),
            consul: provision::installed_version(&paths.binary(Product::Consul.as_str()))
                .await
                .map(|v| v.to_string()),
        };
        let req = CreateRequest {
            name,
            description,
            lab: self.ctx.lab,
            running,
            tool_versions,
            api_export,
        };
        Ok(self.backups().create(&req)?)
    }

    async fn export_api_state(&self) -> Vec<(String, Value)> {
        let Some(material) = UnsealMaterial::load(&self.ctx.paths).ok().flatten() else {
            warn!("no root token; skipping {API_EXPORT_DIR}");
            return Vec::new();
        };
        let addr = self.vault_addr(1);
        let vault = VaultClient::new(self.http.clone(), addr).with_token(material.root_token);
        let approle = format!("/v1/auth/approle/role/{}", features::APPROLE_ROLE);
        let sources = [
            ("policies.json", "/v1/sys/policy"),
            ("auth_methods.json", "/v1/sys/auth"),
            ("secrets_engines.json", "/v1/sys/mounts"),
            ("approle_role.json", approle.as_str()),
        ];
        let mut out = Vec::new();
        for (file, path) in sources {
            match vault.get(path).await {
                Ok(value) => out.push((file.to_owned(), value)),
                Err(e) => warn!(file, error = %e, "API export skipped"),
            }
        }
        out
    }

    /// Verify, confirm, stop, swap in the backup's files, and restart if
    /// the lab was running.
    ///
    /// # Errors
    ///
    /// [`BackupError::Integrity`] before any change, [`BackupError::Cancelled`]
    /// if the confirmation fails, or any start failure afterwards.
    pub async fn restore(&mut self, name: &str, confirm: &dyn Confirm) -> Result<Restored, LabError> {
        let store = self.backups();
        let entry = store.verify(name)?;
        if !confirm.confirm_by_typing(&entry.summary(), name)? {
            return Err(BackupError::Cancelled.into());
        }

        let was_running = self.is_running();
        self.stop().await;
        let restored = store.restore_files(name)?;
        let config = restored.unwrap_or(self.ctx.lab);
        self.ctx.lab = config;
        self.refresh_http()?;

        let restarted = if was_running {
            info!("restarting lab with the restored configuration");
            self.check_ports()?;
            self.provision(false).await?;
            Some(self.launch_and_configure().await?)
        } else {
            None
        };
        Ok(Restored {
            entry,
            config,
            restarted,
        })
    }

    /// Confirm, then delete a backup.
    ///
    /// # Errors
    ///
    /// [`BackupError::NotFound`] or [`BackupError::Cancelled`].
    pub fn delete_backup(&self, name: &str, confirm: &dyn Confirm) -> Result<BackupEntry, LabError> {
        let store = self.backups();
        let entry = store.get(name)?;
        if !confirm.confirm_by_typing(&entry.summary(), name)? {
            return Err(BackupError::Cancelled.into());
        }
        store.delete(name)?;
        Ok(entry)
    }

    /// # Errors
    ///
    /// See [`BackupStore::export`].
    pub fn export_backup(&self, name: &str, dest: Option<&Path>) -> Result<PathBuf, LabError> {
        Ok(self.backups().export(name, dest)?)
    }

    /// # Errors
    ///
    /// See [`BackupStore::import`].
    pub fn import_backup(&self, archive: &Path, name: Option<&str>) -> Result<BackupEntry, LabError> {
        Ok(self.backups().import(archive, name)?)
    }

    /// # Errors
    ///
    /// See [`BackupStore::list`].
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>, LabError> {
        Ok(self.backups().list()?)
    }
}

fn build_http(ctx: &LabContext) -> Result<reqwest::Client, LabError> {
    let ca = ctx.paths.ca_cert();
    let ca = (ctx.lab.tls_enabled && ca.is_file()).then_some(ca.as_path());
    Ok(client::http_client(ca)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backup::AssumeYes;
    use crate::config::{BackendType, ClusterMode};
    use crate::paths::LabPaths;

    struct Decline;

    impl Confirm for Decline {
        fn confirm_by_typing(&self, _summary: &str, _expected: &str) -> Result<bool, BackupError> {
            Ok(false)
        }
    }

    fn lab_at(dir: &Path, lab: LabConfig) -> Lab {
        Lab::new(LabContext::new(LabPaths::new(dir), lab)).unwrap()
    }

    #[tokio::test]
    async fn status_and_stop_on_empty_base() {
        let dir = tempfile::tempdir().unwrap();
        let lab = lab_at(dir.path(), LabConfig::default());
        let status = lab.status().await;
        assert_eq!(status.state, LabState::Stopped);
        assert!(status.config.is_none());
        assert_eq!(status.vault_nodes.len(), 1);
        assert!(status.consul.is_none());
        assert_eq!(lab.stop().await, 0);
        assert_eq!(lab.stop().await, 0);
    }

    #[tokio::test]
    async fn status_reflects_persisted_cluster_shape() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LabPaths::new(dir.path());
        LabConfig::new(BackendType::Consul, ClusterMode::Multi, false)
            .save(&paths.lab_config())
            .unwrap();
        let status = lab_at(dir.path(), LabConfig::default()).status().await;
        assert_eq!(status.vault_nodes.len(), 3);
        assert_eq!(status.vault_nodes[2].port, 8220);
        assert_eq!(status.vault_nodes[1].name, "vault-node2");
        assert!(status.consul.is_some());
    }

    #[tokio::test]
    async fn stale_pid_file_reads_as_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let lab = lab_at(dir.path(), LabConfig::default());
        let pid_path = lab.context().paths.vault_pid(1);
        state::write_pid(&pid_path, 4_000_000).unwrap();
        assert!(!lab.is_running());
        assert_eq!(lab.status().await.state, LabState::Stopped);
        assert_eq!(lab.stop().await, 0);
        assert!(!pid_path.exists());
    }

    #[test]
    fn pid_file_naming_a_foreign_process_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let lab = lab_at(dir.path(), LabConfig::default());
        // The test harness is alive but is not this lab's Vault.
        state::write_pid(&lab.context().paths.vault_pid(1), std::process::id()).unwrap();
        assert!(!lab.is_running());
        assert!(lab.check_not_running().is_ok());
    }

    #[test]
    fn taken_cluster_port_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        // Find a bound port whose predecessor is free to act as the API port.
        let (squatter, cluster) = (0..20)
            .find_map(|_| {
                let l = std::net::TcpListener::bind("127.0.0.1:0").ok()?;
                let port = l.local_addr().ok()?.port();
                (!supervisor::port_in_use(port - 1)).then_some((l, port))
            })
            .unwrap();
        let mut ctx = LabContext::new(LabPaths::new(dir.path()), LabConfig::default());
        ctx.ports.vault_base = cluster - 1;
        let lab = Lab::new(ctx).unwrap();

        let err = lab.check_ports().unwrap_err();
        assert!(
            matches!(&err, LabError::Process(ProcessError::PortInUse { name, port }) if name == "vault" && *port == cluster),
            "got {err}"
        );
        drop(squatter);
        assert!(lab.check_ports().is_ok());
    }

    #[tokio::test]
    async fn cleanup_recreates_empty_dirs_and_drops_config() {
        let dir = tempfile::tempdir().unwrap();
        let lab = lab_at(dir.path(), LabConfig::default());
        let paths = lab.context().paths.clone();
        std::fs::create_dir_all(paths.vault_storage()).unwrap();
        std::fs::write(paths.unseal_key(), "k").unwrap();
        std::fs::create_dir_all(paths.backups_dir().join("keep")).unwrap();
        LabConfig::default().save(&paths.lab_config()).unwrap();

        lab.cleanup().await.unwrap();
        for d in paths.data_dirs() {
            assert!(d.is_dir());
            assert_eq!(std::fs::read_dir(&d).unwrap().count(), 0);
        }
        assert!(!paths.lab_config().exists());
        assert!(paths.backups_dir().join("keep").is_dir());
    }

    #[test]
    fn access_env_only_sets_known_values() {
        let dir = tempfile::tempdir().unwrap();
        let lab = lab_at(
            dir.path(),
            LabConfig::new(BackendType::Consul, ClusterMode::Single, false),
        );
        let paths = &lab.context().paths;
        UnsealMaterial {
            root_token: "hvs.root".to_owned(),
            unseal_key: "k".to_owned(),
        }
        .save(paths)
        .unwrap();
        state::write_secret(&paths.consul_token(), "mgmt").unwrap();

        let env = lab.access_info().env();
        let keys: Vec<&str> = env.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            keys,
            ["VAULT_ADDR", "VAULT_TOKEN", "CONSUL_HTTP_ADDR", "CONSUL_HTTP_TOKEN"]
        );
        assert!(env.contains(&("VAULT_ADDR", "http://127.0.0.1:8200".to_owned())));
    }

    #[tokio::test]
    async fn declined_restore_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut lab = lab_at(dir.path(), LabConfig::default());
        let paths = lab.context().paths.clone();
        std::fs::create_dir_all(paths.vault_storage()).unwrap();
        std::fs::write(paths.vault_config(1), "original\n").unwrap();
        lab.backup(Some("b1".to_owned()), None).await.unwrap();
        std::fs::write(paths.vault_config(1), "edited\n").unwrap();

        let err = lab.restore("b1", &Decline).await.unwrap_err();
        assert!(matches!(err, LabError::Backup(BackupError::Cancelled)));
        assert_eq!(std::fs::read_to_string(paths.vault_config(1)).unwrap(), "edited\n");

        let restored = lab.restore("b1", &AssumeYes).await.unwrap();
        assert!(restored.restarted.is_none());
        assert_eq!(std::fs::read_to_string(paths.vault_config(1)).unwrap(), "original\n");
    }
}
