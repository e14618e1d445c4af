//! Checksummed snapshots of a lab's on-disk state.
//!
//! A backup is a directory under `<base>/backups/<name>/`:
//!
//! ```text
//! vault-data/  consul-data/  tls-data/  vault-lab-ctl.conf
//! api-export/{policies,auth_methods,secrets_engines,approle_role}.json
//! backup_metadata.json
//! checksums.sha256
//! ```
//!
//! Backups are staged in a hidden `.<name>.partial` directory and renamed
//! into place only once complete, so a failure never leaves a record that
//! `list` or `restore` would pick up. PID files are never copied.
//!
//! [`BackupStore`] only moves files. Stopping and restarting the lab
//! around a restore is the lifecycle controller's job.

pub mod archive;
pub mod manifest;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::LabConfig;
use crate::error::BackupError;
use crate::paths::LabPaths;

pub const METADATA_FILE: &str = "backup_metadata.json";
pub const API_EXPORT_DIR: &str = "api-export";
pub const FORMAT_VERSION: u32 = 1;
const MAX_NAME_LEN: usize = 64;

/// Shown for metadata fields that could not be read.
pub const UNKNOWN: &str = "unknown";

/// Directory mapping between the live lab and a backup.
fn payload_dirs(paths: &LabPaths) -> [(PathBuf, &'static str); 3] {
    [
        (paths.vault_data(), "vault-data"),
        (paths.consul_data(), "consul-data"),
        (paths.tls_dir(), "tls-data"),
    ]
}

const CONFIG_COPY: &str = "vault-lab-ctl.conf";

/// Confirmation gate for destructive backup operations.
pub trait Confirm {
    /// Ask the user to type `expected` after showing `summary`. Returns
    /// `Ok(true)` only on an exact match.
    ///
    /// # Errors
    ///
    /// [`BackupError::ConfirmationRequired`] when no one can be asked.
    fn confirm_by_typing(&self, summary: &str, expected: &str) -> Result<bool, BackupError>;
}

/// Confirmer used with `--force`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm_by_typing(&self, _summary: &str, _expected: &str) -> Result<bool, BackupError> {
        Ok(true)
    }
}

/// Versions of the binaries in use when the backup was taken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolVersions {
    #[serde(default)]
    pub vault: Option<String>,
    #[serde(default)]
    pub consul: Option<String>,
}

/// Contents of `backup_metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_date: String,
    pub backend_type: String,
    pub tls_enabled: bool,
    pub cluster_mode: String,
    pub lab_was_running: bool,
    #[serde(default)]
    pub tool_versions: ToolVersions,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    pub format_version: u32,
}

/// Inputs to [`BackupStore::create`] gathered by the caller.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub lab: LabConfig,
    pub running: bool,
    pub tool_versions: ToolVersions,
    /// `file name → JSON` written under `api-export/`.
    pub api_export: Vec<(String, Value)>,
}

/// One directory under `backups/`.
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub name: String,
    pub path: PathBuf,
    /// `None` if the metadata file is missing or unreadable.
    pub metadata: Option<BackupMetadata>,
    pub size_bytes: u64,
}

impl BackupEntry {
    #[must_use]
    pub fn created(&self) -> &str {
        self.metadata.as_ref().map_or(UNKNOWN, |m| m.created_date.as_str())
    }

    #[must_use]
    pub fn backend(&self) -> &str {
        self.metadata.as_ref().map_or(UNKNOWN, |m| m.backend_type.as_str())
    }

    #[must_use]
    pub fn cluster(&self) -> &str {
        self.metadata.as_ref().map_or(UNKNOWN, |m| m.cluster_mode.as_str())
    }

    #[must_use]
    pub fn tls(&self) -> &str {
        match self.metadata.as_ref().map(|m| m.tls_enabled) {
            Some(true) => "yes",
            Some(false) => "no",
            None => UNKNOWN,
        }
    }

    #[must_use]
    pub fn description(&self) -> &str {
        self.metadata
            .as_ref()
            .map(|m| m.description.as_str())
            .filter(|d| !d.is_empty())
            .unwrap_or("-")
    }

    /// Multi-line description used before destructive prompts.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "backup:      {}\ncreated:     {}\nbackend:     {}\ncluster:     {}\ntls:         {}\ndescription: {}\nlocation:    {}",
            self.name,
            self.created(),
            self.backend(),
            self.cluster(),
            self.tls(),
            self.description(),
            self.path.display()
        )
    }
}

/// Check a backup name before anything touches the filesystem.
///
/// # Errors
///
/// [`BackupError::InvalidName`] unless the name is 1-64 characters of
/// `[A-Za-z0-9._-]` starting with a letter or digit.
pub fn validate_name(name: &str) -> Result<(), BackupError> {
    let valid = name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BackupError::InvalidName {
            name: name.to_owned(),
        })
    }
}

/// `backup_YYYYMMDD_HHMMSS` in local time.
#[must_use]
pub fn default_name(now: DateTime<Local>) -> String {
    now.format("backup_%Y%m%d_%H%M%S").to_string()
}

/// Filesystem side of backup management.
#[derive(Debug, Clone)]
pub struct BackupStore {
    paths: LabPaths,
}

impl BackupStore {
    #[must_use]
    pub fn new(paths: LabPaths) -> Self {
        Self { paths }
    }

    #[must_use]
    pub fn dir(&self) -> PathBuf {
        self.paths.backups_dir()
    }

    fn existing(&self, name: &str) -> Result<PathBuf, BackupError> {
        validate_name(name)?;
        let path = self.paths.backup(name);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(BackupError::NotFound {
                name: name.to_owned(),
                dir: self.dir(),
            })
        }
    }

    /// Snapshot the live lab.
    ///
    /// # Errors
    ///
    /// [`BackupError::InvalidName`], [`BackupError::AlreadyExists`],
    /// [`BackupError::NothingToBackUp`], or I/O failures. On failure no
    /// backup directory is left behind.
    pub fn create(&self, req: &CreateRequest) -> Result<BackupEntry, BackupError> {
        let name = req
            .name
            .clone()
            .unwrap_or_else(|| default_name(Local::now()));
        validate_name(&name)?;
        let dest = self.paths.backup(&name);
        if dest.exists() {
            return Err(BackupError::AlreadyExists { name });
        }
        if !self.paths.vault_data().is_dir() {
            return Err(BackupError::NothingToBackUp {
                path: self.paths.vault_data(),
            });
        }

        let backups = self.dir();
        std::fs::create_dir_all(&backups).map_err(BackupError::io(&backups))?;
        let staging = backups.join(format!(".{name}.partial"));
        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(BackupError::io(&staging))?;
        }

        let result = self.fill(&staging, &name, req);
        if let Err(e) = result {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        std::fs::rename(&staging, &dest).map_err(BackupError::io(&dest))?;
        info!(backup = %name, path = %dest.display(), "backup created");
        Ok(self.entry(&name, dest))
    }

    fn fill(&self, staging: &Path, name: &str, req: &CreateRequest) -> Result<(), BackupError> {
        std::fs::create_dir_all(staging).map_err(BackupError::io(staging))?;
        for (live, stored) in payload_dirs(&self.paths) {
            if live.is_dir() {
                let copied = copy_tree(&live, &staging.join(stored))?;
                debug!(from = %live.display(), files = copied, "copied");
            }
        }
        let config = self.paths.lab_config();
        if config.is_file() {
            let to = staging.join(CONFIG_COPY);
            std::fs::copy(&config, &to).map_err(BackupError::io(&to))?;
        }

        if !req.api_export.is_empty() {
            let dir = staging.join(API_EXPORT_DIR);
            std::fs::create_dir_all(&dir).map_err(BackupError::io(&dir))?;
            for (file, value) in &req.api_export {
                write_json(&dir.join(file), value)?;
            }
        }

        let metadata = BackupMetadata {
            name: name.to_owned(),
            description: req.description.clone().unwrap_or_default(),
            created_date: Local::now().to_rfc3339(),
            backend_type: req.lab.backend_type.to_string(),
            tls_enabled: req.lab.tls_enabled,
            cluster_mode: req.lab.cluster_mode.to_string(),
            lab_was_running: req.running,
            tool_versions: req.tool_versions.clone(),
            host: host_name(),
            user: user_name(),
            format_version: FORMAT_VERSION,
        };
        let value = serde_json::to_value(&metadata).map_err(|e| BackupError::Metadata {
            reason: e.to_string(),
        })?;
        write_json(&staging.join(METADATA_FILE), &value)?;

        let files = manifest::write(staging)?;
        debug!(backup = name, files, "manifest written");
        Ok(())
    }

    /// Verify a backup's manifest without changing anything.
    ///
    /// # Errors
    ///
    /// [`BackupError::NotFound`] or [`BackupError::Integrity`] listing
    /// every problem found.
    pub fn verify(&self, name: &str) -> Result<BackupEntry, BackupError> {
        let path = self.existing(name)?;
        let problems = manifest::verify(&path)?;
        if !problems.is_empty() {
            return Err(BackupError::Integrity {
                name: name.to_owned(),
                problems,
            });
        }
        Ok(self.entry(name, path))
    }

    /// Look up one backup.
    ///
    /// # Errors
    ///
    /// [`BackupError::NotFound`] if it does not exist.
    pub fn get(&self, name: &str) -> Result<BackupEntry, BackupError> {
        let path = self.existing(name)?;
        Ok(self.entry(name, path))
    }

    /// Every non-hidden backup directory, sorted by name.
    ///
    /// # Errors
    ///
    /// I/O failures reading the backups directory.
    pub fn list(&self) -> Result<Vec<BackupEntry>, BackupError> {
        let dir = self.dir();
        let read = match std::fs::read_dir(&dir) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackupError::io(&dir)(e)),
        };
        let mut out = Vec::new();
        for entry in read.filter_map(Result::ok) {
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') || !path.is_dir() {
                continue;
            }
            out.push(self.entry(&name, path));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Remove a backup directory.
    ///
    /// # Errors
    ///
    /// [`BackupError::NotFound`] or I/O failures.
    pub fn delete(&self, name: &str) -> Result<(), BackupError> {
        let path = self.existing(name)?;
        std::fs::remove_dir_all(&path).map_err(BackupError::io(&path))?;
        info!(backup = name, "backup deleted");
        Ok(())
    }

    /// Write a backup as `<dest or ./<name>.tar.gz>`.
    ///
    /// # Errors
    ///
    /// [`BackupError::NotFound`], [`BackupError::TargetExists`], or I/O.
    pub fn export(&self, name: &str, dest: Option<&Path>) -> Result<PathBuf, BackupError> {
        let path = self.existing(name)?;
        let dest = dest.map_or_else(|| PathBuf::from(format!("{name}.tar.gz")), Path::to_path_buf);
        archive::pack(&path, name, &dest)?;
        info!(backup = name, archive = %dest.display(), "backup exported");
        Ok(dest)
    }

    /// Bring an exported archive back in as `name` (or the archive's own
    /// directory name), verifying its manifest before it becomes visible.
    ///
    /// # Errors
    ///
    /// [`BackupError::InvalidArchive`], [`BackupError::InvalidName`],
    /// [`BackupError::AlreadyExists`], or [`BackupError::Integrity`].
    pub fn import(&self, archive_path: &Path, name: Option<&str>) -> Result<BackupEntry, BackupError> {
        if let Some(name) = name {
            validate_name(name)?;
        }
        let backups = self.dir();
        std::fs::create_dir_all(&backups).map_err(BackupError::io(&backups))?;
        let staging = tempfile::Builder::new()
            .prefix(".import-")
            .tempdir_in(&backups)
            .map_err(BackupError::io(&backups))?;

        let top = archive::unpack(archive_path, staging.path())?;
        let name = match name {
            Some(n) => n.to_owned(),
            None => top
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
                .ok_or_else(|| BackupError::InvalidArchive {
                    path: archive_path.to_path_buf(),
                    reason: "top-level directory name is not UTF-8".to_owned(),
                })?,
        };
        validate_name(&name)?;
        let dest = self.paths.backup(&name);
        if dest.exists() {
            return Err(BackupError::AlreadyExists { name });
        }

        let problems = manifest::verify(&top)?;
        if !problems.is_empty() {
            return Err(BackupError::Integrity { name, problems });
        }
        std::fs::rename(&top, &dest).map_err(BackupError::io(&dest))?;
        info!(backup = %name, archive = %archive_path.display(), "backup imported");
        Ok(self.entry(&name, dest))
    }

    /// Replace the live lab state with a verified backup's contents.
    /// Returns the configuration that was restored. The lab must already
    /// be stopped.
    ///
    /// # Errors
    ///
    /// [`BackupError::Integrity`] before anything is touched, or I/O
    /// failures while swapping directories (not transactional).
    pub fn restore_files(&self, name: &str) -> Result<Option<LabConfig>, BackupError> {
        let entry = self.verify(name)?;
        let src = entry.path;

        for (live, _) in payload_dirs(&self.paths) {
            remove_if_present(&live)?;
        }
        let config = self.paths.lab_config();
        if config.exists() {
            std::fs::remove_file(&config).map_err(BackupError::io(&config))?;
        }

        for (live, stored) in payload_dirs(&self.paths) {
            let from = src.join(stored);
            if from.is_dir() {
                copy_tree(&from, &live)?;
            } else {
                std::fs::create_dir_all(&live).map_err(BackupError::io(&live))?;
            }
        }
        let saved_config = src.join(CONFIG_COPY);
        if saved_config.is_file() {
            std::fs::copy(&saved_config, &config).map_err(BackupError::io(&config))?;
        }

        let restored = LabConfig::load(&config).unwrap_or_else(|e| {
            warn!(error = %e, "restored config unreadable, using backup metadata");
            None
        });
        let restored = restored.or_else(|| {
            entry.metadata.as_ref().and_then(|m| {
                Some(LabConfig::new(
                    m.backend_type.parse().ok()?,
                    m.cluster_mode.parse().ok()?,
                    m.tls_enabled,
                ))
            })
        });
        info!(backup = name, "backup restored");
        Ok(restored)
    }

    fn entry(&self, name: &str, path: PathBuf) -> BackupEntry {
        let metadata = read_metadata(&path);
        if metadata.is_none() {
            debug!(backup = name, "no readable metadata");
        }
        BackupEntry {
            name: name.to_owned(),
            size_bytes: dir_size(&path),
            path,
            metadata,
        }
    }
}

/// Parse `backup_metadata.json`, or `None` if missing or invalid.
#[must_use]
pub fn read_metadata(backup_dir: &Path) -> Option<BackupMetadata> {
    let raw = std::fs::read_to_string(backup_dir.join(METADATA_FILE)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Copy a directory tree, skipping `*.pid` files and symlinks. Returns the
/// number of files copied.
fn copy_tree(src: &Path, dst: &Path) -> Result<usize, BackupError> {
    let mut copied = 0;
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            BackupError::io(e.path().unwrap_or(src).to_path_buf())(std::io::Error::other(
                e.to_string(),
            ))
        })?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(rel);
        let kind = entry.file_type();
        if kind.is_dir() {
            std::fs::create_dir_all(&target).map_err(BackupError::io(&target))?;
        } else if kind.is_file() {
            if entry.path().extension().is_some_and(|ext| ext == "pid") {
                continue;
            }
            std::fs::copy(entry.path(), &target).map_err(BackupError::io(&target))?;
            copied += 1;
        } else {
            warn!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    Ok(copied)
}

fn remove_if_present(path: &Path) -> Result<(), BackupError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackupError::io(path)(e)),
    }
}

fn write_json(path: &Path, value: &Value) -> Result<(), BackupError> {
    let mut text = serde_json::to_string_pretty(value).map_err(|e| BackupError::Metadata {
        reason: e.to_string(),
    })?;
    text.push('\n');
    std::fs::write(path, text).map_err(BackupError::io(path))
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(std::fs::Metadata::is_file)
        .map(|m| m.len())
        .sum()
}

#[cfg(unix)]
fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| UNKNOWN.to_owned())
}

#[cfg(not(unix))]
fn host_name() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| UNKNOWN.to_owned())
}

#[cfg(unix)]
fn user_name() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| UNKNOWN.to_owned())
}

#[cfg(not(unix))]
fn user_name() -> String {
    std::env::var("USERNAME").unwrap_or_else(|_| UNKNOWN.to_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{BackendType, ClusterMode};

    fn seeded_lab() -> (tempfile::TempDir, LabPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = LabPaths::new(dir.path());
        std::fs::create_dir_all(paths.vault_storage()).unwrap();
        std::fs::write(paths.vault_config(1), "ui = true\n").unwrap();
        std::fs::write(paths.vault_storage().join("core"), b"sealed-bytes").unwrap();
        std::fs::write(paths.vault_pid(1), "12345\n").unwrap();
        std::fs::write(paths.unseal_key(), "key\n").unwrap();
        LabConfig::new(BackendType::File, ClusterMode::Single, false)
            .save(&paths.lab_config())
            .unwrap();
        (dir, paths)
    }

    fn request(name: &str) -> CreateRequest {
        CreateRequest {
            name: Some(name.to_owned()),
            description: Some("before upgrade".to_owned()),
            ..CreateRequest::default()
        }
    }

    #[test]
    fn names_are_validated() {
        let longest = "x".repeat(64);
        let too_long = "x".repeat(65);
        for ok in ["b1", "nightly.2024-01-01", "A_b-c.d", longest.as_str()] {
            assert!(validate_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", ".hidden", "-flag", "a/b", "../x", "with space", too_long.as_str()] {
            assert!(validate_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn default_name_format() {
        let now = chrono::TimeZone::with_ymd_and_hms(&Local, 2024, 3, 9, 14, 5, 7)
            .single()
            .unwrap();
        assert_eq!(default_name(now), "backup_20240309_140507");
    }

    #[test]
    fn create_copies_payload_and_skips_pid_files() {
        let (_dir, paths) = seeded_lab();
        let store = BackupStore::new(paths.clone());
        let entry = store.create(&request("b1")).unwrap();

        assert!(entry.path.join("vault-data/config.hcl").is_file());
        assert!(entry.path.join("vault-data/storage/core").is_file());
        assert!(!entry.path.join("vault-data/vault.pid").exists());
        assert!(entry.path.join(CONFIG_COPY).is_file());
        assert!(entry.path.join(manifest::MANIFEST_FILE).is_file());

        let meta = entry.metadata.unwrap();
        assert_eq!(meta.name, "b1");
        assert_eq!(meta.description, "before upgrade");
        assert_eq!(meta.format_version, FORMAT_VERSION);
        assert!(!meta.lab_was_running);

        assert!(store.verify("b1").is_ok());
        assert!(!paths.backups_dir().join(".b1.partial").exists());
    }

    #[test]
    fn create_refusals() {
        let (_dir, paths) = seeded_lab();
        let store = BackupStore::new(paths.clone());
        store.create(&request("b1")).unwrap();
        assert!(matches!(
            store.create(&request("b1")).unwrap_err(),
            BackupError::AlreadyExists { .. }
        ));
        assert!(matches!(
            store.create(&request("../evil")).unwrap_err(),
            BackupError::InvalidName { .. }
        ));

        let empty = tempfile::tempdir().unwrap();
        let store = BackupStore::new(LabPaths::new(empty.path()));
        assert!(matches!(
            store.create(&request("b1")).unwrap_err(),
            BackupError::NothingToBackUp { .. }
        ));
    }

    #[test]
    fn api_export_is_written_and_covered() {
        let (_dir, paths) = seeded_lab();
        let store = BackupStore::new(paths);
        let mut req = request("with-api");
        req.running = true;
        req.api_export = vec![("policies.json".to_owned(), serde_json::json!(["default"]))];
        let entry = store.create(&req).unwrap();
        assert!(entry.path.join("api-export/policies.json").is_file());
        assert!(store.verify("with-api").is_ok());
    }

    #[test]
    fn corrupted_backup_is_not_restored() {
        let (_dir, paths) = seeded_lab();
        let store = BackupStore::new(paths.clone());
        let entry = store.create(&request("b1")).unwrap();

        std::fs::write(entry.path.join("vault-data/config.hcl"), "tampered").unwrap();
        std::fs::write(paths.vault_config(1), "live edit\n").unwrap();

        let err = store.restore_files("b1").unwrap_err();
        assert!(matches!(err, BackupError::Integrity { .. }));
        assert_eq!(
            std::fs::read_to_string(paths.vault_config(1)).unwrap(),
            "live edit\n"
        );
    }

    #[test]
    fn restore_replaces_live_state() {
        let (_dir, paths) = seeded_lab();
        let store = BackupStore::new(paths.clone());
        store.create(&request("b1")).unwrap();

        std::fs::write(paths.vault_config(1), "changed\n").unwrap();
        std::fs::write(paths.vault_data().join("new-file"), "x").unwrap();
        LabConfig::new(BackendType::Consul, ClusterMode::Single, true)
            .save(&paths.lab_config())
            .unwrap();

        let restored = store.restore_files("b1").unwrap().unwrap();
        assert_eq!(restored.backend_type, BackendType::File);
        assert_eq!(
            std::fs::read_to_string(paths.vault_config(1)).unwrap(),
            "ui = true\n"
        );
        assert!(!paths.vault_data().join("new-file").exists());
        assert!(paths.consul_data().is_dir());
    }

    #[test]
    fn list_reports_unknown_for_missing_metadata() {
        let (_dir, paths) = seeded_lab();
        let store = BackupStore::new(paths.clone());
        store.create(&request("b2")).unwrap();
        std::fs::create_dir_all(paths.backup("a-manual")).unwrap();
        std::fs::create_dir_all(paths.backups_dir().join(".x.partial")).unwrap();

        let list = store.list().unwrap();
        let names: Vec<&str> = list.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a-manual", "b2"]);
        assert_eq!(list[0].created(), UNKNOWN);
        assert_eq!(list[0].tls(), UNKNOWN);
        assert_eq!(list[1].backend(), "file");
    }

    #[test]
    fn export_then_import_under_new_name() {
        let (dir, paths) = seeded_lab();
        let store = BackupStore::new(paths.clone());
        store.create(&request("b1")).unwrap();

        let archive = dir.path().join("b1.tar.gz");
        store.export("b1", Some(&archive)).unwrap();
        assert!(matches!(
            store.export("b1", Some(&archive)).unwrap_err(),
            BackupError::TargetExists { .. }
        ));

        assert!(matches!(
            store.import(&archive, None).unwrap_err(),
            BackupError::AlreadyExists { .. }
        ));
        let imported = store.import(&archive, Some("b1-copy")).unwrap();
        assert_eq!(imported.name, "b1-copy");
        assert!(store.verify("b1-copy").is_ok());
        let leftovers: Vec<_> = std::fs::read_dir(paths.backups_dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".import-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn delete_removes_directory() {
        let (_dir, paths) = seeded_lab();
        let store = BackupStore::new(paths);
        store.create(&request("b1")).unwrap();
        store.delete("b1").unwrap();
        assert!(matches!(store.get("b1").unwrap_err(), BackupError::NotFound { .. }));
    }
}
