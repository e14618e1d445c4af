//! On-disk layout of a lab, rooted at a single base directory.
//!
//! ```text
//! <base>/bin/{vault,consul}
//! <base>/vault-data/{config.hcl, vault.log, vault.pid, root_token.txt, ...}
//! <base>/consul-data/{consul_config.hcl, consul.log, consul.pid, data/}
//! <base>/tls/{ca/, certs/}
//! <base>/vault-lab-ctl.conf
//! <base>/backups/<name>/
//! ```
//!
//! Node 1 of a cluster uses the plain file names; nodes 2.. add a
//! `-nodeN` suffix (`config-node2.hcl`, `vault-node2.pid`).

use std::path::{Path, PathBuf};

/// Vault API port of node 1; node `n` listens on `8200 + 10 * (n - 1)`.
pub const VAULT_BASE_PORT: u16 = 8200;
/// Consul HTTP API port.
pub const CONSUL_HTTP_PORT: u16 = 8500;
/// Consul server RPC port.
pub const CONSUL_SERVER_PORT: u16 = 8300;
/// Consul serf LAN port.
pub const CONSUL_SERF_LAN_PORT: u16 = 8301;
/// Consul serf WAN port.
pub const CONSUL_SERF_WAN_PORT: u16 = 8302;

/// Highest node index ever managed; `stop` sweeps all of them.
pub const MAX_VAULT_NODES: usize = 3;

/// Every path the lab reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabPaths {
    base: PathBuf,
}

impl LabPaths {
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    // ── binaries ─────────────────────────────────────────────────────

    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.base.join("bin")
    }

    #[must_use]
    pub fn binary(&self, product: &str) -> PathBuf {
        let name = if cfg!(windows) {
            format!("{product}.exe")
        } else {
            product.to_owned()
        };
        self.bin_dir().join(name)
    }

    // ── vault ────────────────────────────────────────────────────────

    #[must_use]
    pub fn vault_data(&self) -> PathBuf {
        self.base.join("vault-data")
    }

    #[must_use]
    pub fn vault_storage(&self) -> PathBuf {
        self.vault_data().join("storage")
    }

    #[must_use]
    pub fn vault_config(&self, node: usize) -> PathBuf {
        self.vault_data().join(node_file("config", node, "hcl"))
    }

    #[must_use]
    pub fn vault_log(&self, node: usize) -> PathBuf {
        self.vault_data().join(node_file("vault", node, "log"))
    }

    #[must_use]
    pub fn vault_pid(&self, node: usize) -> PathBuf {
        self.vault_data().join(node_file("vault", node, "pid"))
    }

    #[must_use]
    pub fn root_token(&self) -> PathBuf {
        self.vault_data().join("root_token.txt")
    }

    #[must_use]
    pub fn unseal_key(&self) -> PathBuf {
        self.vault_data().join("unseal_key.txt")
    }

    #[must_use]
    pub fn approle_role_id(&self) -> PathBuf {
        self.vault_data().join("approle_role_id.txt")
    }

    #[must_use]
    pub fn approle_secret_id(&self) -> PathBuf {
        self.vault_data().join("approle_secret_id.txt")
    }

    #[must_use]
    pub fn audit_log(&self) -> PathBuf {
        self.vault_data().join("audit.log")
    }

    // ── consul ───────────────────────────────────────────────────────

    #[must_use]
    pub fn consul_data(&self) -> PathBuf {
        self.base.join("consul-data")
    }

    #[must_use]
    pub fn consul_state_dir(&self) -> PathBuf {
        self.consul_data().join("data")
    }

    #[must_use]
    pub fn consul_config(&self) -> PathBuf {
        self.consul_data().join("consul_config.hcl")
    }

    #[must_use]
    pub fn consul_log(&self) -> PathBuf {
        self.consul_data().join("consul.log")
    }

    #[must_use]
    pub fn consul_pid(&self) -> PathBuf {
        self.consul_data().join("consul.pid")
    }

    #[must_use]
    pub fn consul_token(&self) -> PathBuf {
        self.consul_data().join("acl_master_token.txt")
    }

    // ── tls ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn tls_dir(&self) -> PathBuf {
        self.base.join("tls")
    }

    #[must_use]
    pub fn ca_cert(&self) -> PathBuf {
        self.tls_dir().join("ca").join("ca.pem")
    }

    #[must_use]
    pub fn ca_key(&self) -> PathBuf {
        self.tls_dir().join("ca").join("ca-key.pem")
    }

    #[must_use]
    pub fn server_cert(&self) -> PathBuf {
        self.tls_dir().join("certs").join("vault.pem")
    }

    #[must_use]
    pub fn server_key(&self) -> PathBuf {
        self.tls_dir().join("certs").join("vault-key.pem")
    }

    // ── bookkeeping ──────────────────────────────────────────────────

    #[must_use]
    pub fn lab_config(&self) -> PathBuf {
        self.base.join("vault-lab-ctl.conf")
    }

    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.base.join(".vault-lab-ctl.lock")
    }

    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.base.join("backups")
    }

    #[must_use]
    pub fn backup(&self, name: &str) -> PathBuf {
        self.backups_dir().join(name)
    }

    /// Directories wiped by `cleanup`/`reset`, recreated empty afterwards.
    #[must_use]
    pub fn data_dirs(&self) -> [PathBuf; 3] {
        [self.vault_data(), self.consul_data(), self.tls_dir()]
    }
}

/// Loopback ports the lab's servers listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ports {
    /// API port of Vault node 1; node `n` listens `10 * (n - 1)` above it.
    pub vault_base: u16,
    pub consul_http: u16,
    pub consul_server: u16,
    pub consul_serf_lan: u16,
    pub consul_serf_wan: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            vault_base: VAULT_BASE_PORT,
            consul_http: CONSUL_HTTP_PORT,
            consul_server: CONSUL_SERVER_PORT,
            consul_serf_lan: CONSUL_SERF_LAN_PORT,
            consul_serf_wan: CONSUL_SERF_WAN_PORT,
        }
    }
}

impl Ports {
    /// API port of Vault node `node` (1-based).
    #[must_use]
    pub fn vault_api(&self, node: usize) -> u16 {
        let offset = u16::try_from(node.saturating_sub(1)).unwrap_or(0);
        self.vault_base.saturating_add(offset.saturating_mul(10))
    }

    /// Cluster (request forwarding) port of Vault node `node`.
    #[must_use]
    pub fn vault_cluster(&self, node: usize) -> u16 {
        self.vault_api(node).saturating_add(1)
    }

    /// Consul ports checked for conflicts before Consul starts.
    #[must_use]
    pub fn consul_listeners(&self) -> [u16; 3] {
        [self.consul_http, self.consul_server, self.consul_serf_lan]
    }
}

fn node_file(stem: &str, node: usize, ext: &str) -> String {
    if node <= 1 {
        format!("{stem}.{ext}")
    } else {
        format!("{stem}-node{node}.{ext}")
    }
}
