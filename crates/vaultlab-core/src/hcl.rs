//! Rendering of the Vault and Consul server configuration files.

use std::fmt::Write as _;
use std::path::Path;

use crate::config::LabConfig;
use crate::paths::{LabPaths, Ports};

/// Loopback host every lab server binds to.
pub const LOOPBACK: &str = "127.0.0.1";

/// Base URL of Vault node `node` (`https` when TLS is on).
#[must_use]
pub fn vault_addr(lab: &LabConfig, ports: &Ports, node: usize) -> String {
    let scheme = if lab.tls_enabled { "https" } else { "http" };
    format!("{scheme}://{LOOPBACK}:{}", ports.vault_api(node))
}

/// Base URL of the Consul HTTP API. Consul stays on plain HTTP even when
/// Vault's listener uses TLS.
#[must_use]
pub fn consul_addr(ports: &Ports) -> String {
    format!("http://{LOOPBACK}:{}", ports.consul_http)
}

/// Config for Vault node `node`. `consul_token` is required for the
/// Consul backend and ignored for file storage.
#[must_use]
pub fn vault_config(
    lab: &LabConfig,
    paths: &LabPaths,
    ports: &Ports,
    node: usize,
    consul_token: Option<&str>,
) -> String {
    let api_port = ports.vault_api(node);
    let cluster_port = ports.vault_cluster(node);
    let scheme = if lab.tls_enabled { "https" } else { "http" };

    let mut out = String::new();
    out.push_str("# Generated by vault-lab-ctl. Local lab use only.\n\n");

    if lab.uses_consul() {
        let _ = writeln!(out, "storage \"consul\" {{");
        let _ = writeln!(out, "  address = \"{LOOPBACK}:{}\"", ports.consul_http);
        out.push_str("  path    = \"vault/\"\n");
        if let Some(token) = consul_token {
            let _ = writeln!(out, "  token   = \"{token}\"");
        }
        out.push_str("}\n\n");
    } else {
        out.push_str("storage \"file\" {\n");
        let _ = writeln!(out, "  path = {}", quoted(&paths.vault_storage()));
        out.push_str("}\n\n");
    }

    out.push_str("listener \"tcp\" {\n");
    let _ = writeln!(out, "  address         = \"{LOOPBACK}:{api_port}\"");
    let _ = writeln!(out, "  cluster_address = \"{LOOPBACK}:{cluster_port}\"");
    if lab.tls_enabled {
        let _ = writeln!(out, "  tls_cert_file   = {}", quoted(&paths.server_cert()));
        let _ = writeln!(out, "  tls_key_file    = {}", quoted(&paths.server_key()));
    } else {
        out.push_str("  tls_disable     = true\n");
    }
    out.push_str("}\n\n");

    let _ = writeln!(out, "api_addr      = \"{scheme}://{LOOPBACK}:{api_port}\"");
    let _ = writeln!(out, "cluster_addr  = \"https://{LOOPBACK}:{cluster_port}\"");
    out.push_str("disable_mlock = true\n");
    out.push_str("ui            = true\n");
    out
}

/// Single-server Consul config with ACLs on and DNS disabled.
#[must_use]
pub fn consul_config(paths: &LabPaths, ports: &Ports, management_token: &str) -> String {
    format!(
        r#"# Generated by vault-lab-ctl. Local lab use only.

datacenter       = "lab"
node_name        = "vault-lab-consul"
data_dir         = {data_dir}
server           = true
bootstrap_expect = 1
bind_addr        = "{LOOPBACK}"
client_addr      = "{LOOPBACK}"
log_level        = "INFO"

ports {{
  http     = {http}
  server   = {server}
  serf_lan = {serf_lan}
  serf_wan = {serf_wan}
  dns      = -1
}}

acl {{
  enabled                  = true
  default_policy           = "deny"
  enable_token_persistence = true
  tokens {{
    initial_management = "{management_token}"
  }}
}}
"#,
        data_dir = quoted(&paths.consul_state_dir()),
        http = ports.consul_http,
        server = ports.consul_server,
        serf_lan = ports.consul_serf_lan,
        serf_wan = ports.consul_serf_wan,
    )
}

/// HCL string literal for a path, escaping backslashes and quotes.
fn quoted(path: &Path) -> String {
    let raw = path.display().to_string();
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}
