//! Typed access to the small state files a lab keeps between invocations:
//! PID files, the unseal key and root token, and the demo AppRole
//! credentials.
//!
//! Secret-bearing files are written with mode `0600` and replaced
//! atomically (write to a sibling, then rename).

use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::paths::LabPaths;

/// One supervised server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandle {
    /// Display name, e.g. `vault`, `vault-node2`, `consul`.
    pub name: String,
    pub pid: u32,
    pub listen_port: u16,
    pub log_path: PathBuf,
    pub pid_path: PathBuf,
}

/// Read a PID file. Missing, empty, or malformed files yield `None`.
#[must_use]
pub fn read_pid(path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(path).ok()?;
    let pid = raw.trim().parse::<u32>().ok()?;
    if pid == 0 { None } else { Some(pid) }
}

/// Record a freshly spawned process id.
///
/// # Errors
///
/// Returns the underlying I/O error if the file cannot be written.
pub fn write_pid(path: &Path, pid: u32) -> std::io::Result<()> {
    write_atomic(path, format!("{pid}\n").as_bytes(), false)
}

/// Output of the one-time `sys/init` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsealMaterial {
    pub root_token: String,
    pub unseal_key: String,
}

impl UnsealMaterial {
    /// Load both files; `Ok(None)` if either is absent.
    ///
    /// # Errors
    ///
    /// Returns the I/O error for any failure other than not-found.
    pub fn load(paths: &LabPaths) -> std::io::Result<Option<Self>> {
        let Some(unseal_key) = read_secret(&paths.unseal_key())? else {
            return Ok(None);
        };
        let Some(root_token) = read_secret(&paths.root_token())? else {
            return Ok(None);
        };
        Ok(Some(Self {
            root_token,
            unseal_key,
        }))
    }

    /// Persist both files with owner-only permissions.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if either write fails.
    pub fn save(&self, paths: &LabPaths) -> std::io::Result<()> {
        write_secret(&paths.unseal_key(), &self.unseal_key)?;
        write_secret(&paths.root_token(), &self.root_token)
    }
}

/// Credentials of the demo AppRole role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRoleCredential {
    pub role_id: String,
    pub secret_id: String,
}

impl AppRoleCredential {
    /// # Errors
    ///
    /// Returns the I/O error for any failure other than not-found.
    pub fn load(paths: &LabPaths) -> std::io::Result<Option<Self>> {
        let role_id = read_secret(&paths.approle_role_id())?;
        let secret_id = read_secret(&paths.approle_secret_id())?;
        Ok(role_id
            .zip(secret_id)
            .map(|(role_id, secret_id)| Self { role_id, secret_id }))
    }

    /// # Errors
    ///
    /// Returns the I/O error if either write fails.
    pub fn save(&self, paths: &LabPaths) -> std::io::Result<()> {
        write_secret(&paths.approle_role_id(), &self.role_id)?;
        write_secret(&paths.approle_secret_id(), &self.secret_id)
    }
}

/// Read a single-line secret file, trimmed. `Ok(None)` when absent or empty.
///
/// # Errors
///
/// Returns the I/O error for any failure other than not-found.
pub fn read_secret(path: &Path) -> std::io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => {
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_owned()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a single-line secret with mode `0600`.
///
/// # Errors
///
/// Returns the I/O error if the write or rename fails.
pub fn write_secret(path: &Path, value: &str) -> std::io::Result<()> {
    write_atomic(path, format!("{value}\n").as_bytes(), true)
}

/// Replace `path` via a sibling temp file; `private` sets mode `0600`.
pub(crate) fn write_atomic(path: &Path, content: &[u8], private: bool) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if private {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(&tmp)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}
