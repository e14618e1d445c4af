//! Portable `.tar.gz` form of a backup directory.
//!
//! An export holds exactly one top-level directory named after the backup.
//! Import unpacks into a staging directory and insists on that shape.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write as _};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::BackupError;

/// Write `src` as `<top>/...` into a new gzip'd tarball at `dest`. An
/// existing `dest` is never overwritten; a failed write leaves no file.
///
/// # Errors
///
/// [`BackupError::TargetExists`] if `dest` exists, [`BackupError::Io`]
/// otherwise.
pub fn pack(src: &Path, top: &str, dest: &Path) -> Result<(), BackupError> {
    let file = match OpenOptions::new().write(true).create_new(true).open(dest) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(BackupError::TargetExists {
                path: dest.to_path_buf(),
            });
        }
        Err(e) => return Err(BackupError::io(dest)(e)),
    };

    let result = write_tarball(file, src, top);
    if result.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    result.map_err(BackupError::io(dest))
}

fn write_tarball(file: File, src: &Path, top: &str) -> io::Result<()> {
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(top, src)?;
    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

/// Unpack `archive` into `staging` and return the single top-level
/// directory it contained.
///
/// # Errors
///
/// [`BackupError::InvalidArchive`] if the archive is unreadable or does
/// not hold exactly one directory at the top.
pub fn unpack(archive: &Path, staging: &Path) -> Result<PathBuf, BackupError> {
    let invalid = |reason: String| BackupError::InvalidArchive {
        path: archive.to_path_buf(),
        reason,
    };
    let file = File::open(archive).map_err(BackupError::io(archive))?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    tar.set_preserve_permissions(true);
    tar.unpack(staging).map_err(|e| invalid(e.to_string()))?;

    let entries: Vec<_> = std::fs::read_dir(staging)
        .map_err(BackupError::io(staging))?
        .filter_map(Result::ok)
        .collect();
    match entries.as_slice() {
        [only] if only.path().is_dir() => Ok(only.path()),
        [] => Err(invalid("archive is empty".to_owned())),
        _ => Err(invalid(format!(
            "expected a single top-level directory, found {} entries",
            entries.len()
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pack_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("b1");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("f"), "x").unwrap();
        let dest = dir.path().join("b1.tar.gz");
        std::fs::write(&dest, "keep").unwrap();

        let err = pack(&src, "b1", &dest).unwrap_err();
        assert!(matches!(err, BackupError::TargetExists { .. }));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "keep");
    }

    #[test]
    fn unpack_yields_single_top_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("content");
        std::fs::create_dir_all(src.join("vault-data")).unwrap();
        std::fs::write(src.join("vault-data/config.hcl"), "ui = true").unwrap();
        let dest = dir.path().join("out.tar.gz");
        pack(&src, "nightly", &dest).unwrap();

        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let top = unpack(&dest, &staging).unwrap();
        assert_eq!(top.file_name().unwrap(), "nightly");
        assert_eq!(
            std::fs::read_to_string(top.join("vault-data/config.hcl")).unwrap(),
            "ui = true"
        );
    }

    #[test]
    fn unpack_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.tar.gz");
        std::fs::write(&bogus, "definitely not gzip").unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        assert!(matches!(
            unpack(&bogus, &staging).unwrap_err(),
            BackupError::InvalidArchive { .. }
        ));
    }
}
