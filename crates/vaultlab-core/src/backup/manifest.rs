//! `checksums.sha256`: a `sha256sum`-compatible manifest of a backup.
//!
//! One line per file, `<hex>  <relative/path>`, sorted by path, covering
//! every file under the backup root except the manifest itself. A backup
//! verifies only if every listed file matches and no unlisted file exists.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Component, Path};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::BackupError;

pub const MANIFEST_FILE: &str = "checksums.sha256";

/// SHA-256 of a file, lowercase hex.
///
/// # Errors
///
/// Returns the I/O error if the file cannot be read.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Relative paths (with `/` separators) of every file under `root` except
/// the manifest, sorted.
///
/// # Errors
///
/// Returns [`BackupError::Io`] if the tree cannot be walked.
pub fn files_under(root: &Path) -> Result<Vec<String>, BackupError> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            BackupError::io(path)(io::Error::other(e.to_string()))
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = rel_string(rel);
        if rel != MANIFEST_FILE {
            out.push(rel);
        }
    }
    out.sort();
    Ok(out)
}

/// Hash every file under `root` and write the manifest.
///
/// # Errors
///
/// Returns [`BackupError::Io`] on any read or write failure.
pub fn write(root: &Path) -> Result<usize, BackupError> {
    let mut content = String::new();
    let files = files_under(root)?;
    for rel in &files {
        let path = root.join(rel);
        let digest = sha256_file(&path).map_err(BackupError::io(&path))?;
        content.push_str(&digest);
        content.push_str("  ");
        content.push_str(rel);
        content.push('\n');
    }
    let manifest = root.join(MANIFEST_FILE);
    std::fs::write(&manifest, content).map_err(BackupError::io(&manifest))?;
    Ok(files.len())
}

/// Parse manifest text into `path → hex`. Malformed lines are returned as
/// problems rather than silently skipped.
#[must_use]
pub fn parse(content: &str) -> (BTreeMap<String, String>, Vec<String>) {
    let mut entries = BTreeMap::new();
    let mut problems = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = line.split_once("  ").filter(|(digest, path)| {
            digest.len() == 64
                && digest.bytes().all(|b| b.is_ascii_hexdigit())
                && is_safe_relative(path)
        });
        match parsed {
            Some((digest, path)) => {
                entries.insert(path.to_owned(), digest.to_ascii_lowercase());
            }
            None => problems.push(format!("malformed manifest line {}", n + 1)),
        }
    }
    (entries, problems)
}

/// Check `root` against its manifest. Returns the list of problems; empty
/// means the backup is intact.
///
/// # Errors
///
/// Returns [`BackupError::Io`] only if the tree itself cannot be walked.
pub fn verify(root: &Path) -> Result<Vec<String>, BackupError> {
    let manifest = root.join(MANIFEST_FILE);
    let content = match std::fs::read_to_string(&manifest) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(vec![format!("{MANIFEST_FILE} is missing")]);
        }
        Err(e) => return Err(BackupError::io(&manifest)(e)),
    };

    let (listed, mut problems) = parse(&content);
    for (rel, expected) in &listed {
        let path = root.join(rel);
        match sha256_file(&path) {
            Ok(actual) if actual == *expected => {}
            Ok(_) => problems.push(format!("checksum mismatch: {rel}")),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                problems.push(format!("missing file: {rel}"));
            }
            Err(e) => problems.push(format!("unreadable file {rel}: {e}")),
        }
    }
    for rel in files_under(root)? {
        if !listed.contains_key(&rel) {
            problems.push(format!("unlisted file: {rel}"));
        }
    }
    Ok(problems)
}

fn rel_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}
