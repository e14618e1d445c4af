//! Lab configuration.
//!
//! [`LabConfig`] is the small record persisted between invocations so that
//! `stop`, `restart`, `status` and friends recover the choices made at
//! `start`. It is stored as shell-sourceable `KEY=value` lines:
//!
//! ```text
//! BACKEND_TYPE=consul
//! CLUSTER_MODE=multi
//! TLS_ENABLED=true
//! ```
//!
//! [`LabContext`] bundles the resolved configuration with every other
//! per-invocation setting and is passed explicitly to each component.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths::{LabPaths, Ports};
use crate::version::VersionSpec;

/// Storage backend used by Vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Vault's integrated file storage.
    #[default]
    File,
    /// A local Consul server.
    Consul,
}

impl BackendType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Consul => "consul",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "consul" => Ok(Self::Consul),
            other => Err(ConfigError::InvalidChoice {
                what: "backend",
                value: other.to_owned(),
                expected: "file, consul",
            }),
        }
    }
}

/// Number of Vault nodes in the lab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    #[default]
    Single,
    /// Three Vault nodes sharing Consul storage.
    Multi,
}

impl ClusterMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
        }
    }

    /// Number of Vault server processes this mode runs.
    #[must_use]
    pub fn node_count(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Multi => 3,
        }
    }
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "multi" => Ok(Self::Multi),
            other => Err(ConfigError::InvalidChoice {
                what: "cluster mode",
                value: other.to_owned(),
                expected: "single, multi",
            }),
        }
    }
}

/// The persisted lab choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabConfig {
    pub backend_type: BackendType,
    pub cluster_mode: ClusterMode,
    pub tls_enabled: bool,
}

const KEY_BACKEND: &str = "BACKEND_TYPE";
const KEY_CLUSTER: &str = "CLUSTER_MODE";
const KEY_TLS: &str = "TLS_ENABLED";

impl LabConfig {
    /// Build a config, forcing the Consul backend for multi-node clusters.
    #[must_use]
    pub fn new(backend_type: BackendType, cluster_mode: ClusterMode, tls_enabled: bool) -> Self {
        Self {
            backend_type,
            cluster_mode,
            tls_enabled,
        }
        .normalized()
    }

    /// Multi-node Vault needs HA storage, which only Consul provides here.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.cluster_mode == ClusterMode::Multi {
            self.backend_type = BackendType::Consul;
        }
        self
    }

    /// Whether the Consul server is part of this lab.
    #[must_use]
    pub fn uses_consul(&self) -> bool {
        self.backend_type == BackendType::Consul
    }

    /// Parse `KEY=value` lines. Blank lines, comments and unknown keys are
    /// skipped; surrounding quotes on values are stripped.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a known key has a bad value.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            let invalid = || ConfigError::InvalidValue {
                path: origin.to_path_buf(),
                key: key.to_owned(),
                value: value.to_owned(),
            };
            match key {
                KEY_BACKEND => config.backend_type = value.parse().map_err(|_| invalid())?,
                KEY_CLUSTER => config.cluster_mode = value.parse().map_err(|_| invalid())?,
                KEY_TLS => config.tls_enabled = parse_bool(value).ok_or_else(invalid)?,
                _ => {}
            }
        }
        Ok(config.normalized())
    }

    /// Render as shell-sourceable lines.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "# vault-lab-ctl configuration (generated, safe to source)\n\
             {KEY_BACKEND}={}\n\
             {KEY_CLUSTER}={}\n\
             {KEY_TLS}={}\n",
            self.backend_type, self.cluster_mode, self.tls_enabled
        )
    }

    /// Load the persisted config, or `None` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content, path).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::io(path)(e)),
        }
    }

    /// Write the config, replacing any previous file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::io(parent))?;
        }
        let tmp = path.with_extension("conf.tmp");
        std::fs::write(&tmp, self.render()).map_err(ConfigError::io(&tmp))?;
        std::fs::rename(&tmp, path).map_err(ConfigError::io(path))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Bounded waits used by the lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Readiness wait for a single file-backed Vault node.
    pub single: Duration,
    /// Readiness wait for Consul, or Vault on Consul/multi-node.
    pub extended: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Interval between readiness probes.
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            single: Duration::from_secs(30),
            extended: Duration::from_secs(60),
            stop_grace: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Timeouts {
    /// Readiness timeout for Vault under the given lab shape.
    #[must_use]
    pub fn vault_ready(&self, lab: &LabConfig) -> Duration {
        if lab.uses_consul() || lab.cluster_mode == ClusterMode::Multi {
            self.extended
        } else {
            self.single
        }
    }
}

/// Everything a lifecycle command needs, resolved once per invocation.
#[derive(Debug, Clone)]
pub struct LabContext {
    pub paths: LabPaths,
    pub lab: LabConfig,
    pub vault_version: VersionSpec,
    pub consul_version: VersionSpec,
    /// Use a pre-existing binary when download or resolution fails.
    pub allow_binary_fallback: bool,
    pub timeouts: Timeouts,
    pub ports: Ports,
}

impl LabContext {
    /// Context with default versions (`latest`), timeouts and ports.
    #[must_use]
    pub fn new(paths: LabPaths, lab: LabConfig) -> Self {
        Self {
            paths,
            lab,
            vault_version: VersionSpec::Latest,
            consul_version: VersionSpec::Latest,
            allow_binary_fallback: true,
            timeouts: Timeouts::default(),
            ports: Ports::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn origin() -> PathBuf {
        PathBuf::from("vault-lab-ctl.conf")
    }

    #[test]
    fn render_then_parse_preserves_choices() {
        let cfg = LabConfig::new(BackendType::Consul, ClusterMode::Single, true);
        let parsed = LabConfig::parse(&cfg.render(), &origin()).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn multi_forces_consul() {
        let cfg = LabConfig::new(BackendType::File, ClusterMode::Multi, false);
        assert_eq!(cfg.backend_type, BackendType::Consul);

        let parsed =
            LabConfig::parse("BACKEND_TYPE=file\nCLUSTER_MODE=multi\n", &origin()).unwrap();
        assert_eq!(parsed.backend_type, BackendType::Consul);
    }

    #[test]
    fn parse_accepts_shell_syntax() {
        let content = "# comment\nexport BACKEND_TYPE=\"consul\"\n\nTLS_ENABLED='1'\nOTHER=x\n";
        let parsed = LabConfig::parse(content, &origin()).unwrap();
        assert_eq!(parsed.backend_type, BackendType::Consul);
        assert_eq!(parsed.cluster_mode, ClusterMode::Single);
        assert!(parsed.tls_enabled);
    }

    #[test]
    fn parse_rejects_bad_values() {
        let err = LabConfig::parse("BACKEND_TYPE=raft\n", &origin()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "BACKEND_TYPE"));

        let err = LabConfig::parse("TLS_ENABLED=maybe\n", &origin()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn load_missing_is_none_and_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault-lab-ctl.conf");
        assert!(LabConfig::load(&path).unwrap().is_none());

        let cfg = LabConfig::new(BackendType::File, ClusterMode::Single, true);
        cfg.save(&path).unwrap();
        assert_eq!(LabConfig::load(&path).unwrap(), Some(cfg));
    }

    #[test]
    fn choices_parse_case_insensitively() {
        assert_eq!("CONSUL".parse::<BackendType>().unwrap(), BackendType::Consul);
        assert_eq!(" multi ".parse::<ClusterMode>().unwrap(), ClusterMode::Multi);
        assert!("triple".parse::<ClusterMode>().is_err());
    }

    #[test]
    fn extended_timeout_for_consul_backends() {
        let t = Timeouts::default();
        let file = LabConfig::default();
        let consul = LabConfig::new(BackendType::Consul, ClusterMode::Single, false);
        assert_eq!(t.vault_ready(&file), Duration::from_secs(30));
        assert_eq!(t.vault_ready(&consul), Duration::from_secs(60));
    }
}
