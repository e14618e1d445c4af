//! Advisory lock serializing mutating commands against one lab.
//!
//! The lock is an exclusive `flock` on `<base>/.vault-lab-ctl.lock`. The
//! holder writes its pid into the file so a rejected invocation can say who
//! holds it. The lock is released when the [`LabLock`] is dropped (the
//! descriptor closes), including on crash, so there is no stale-lock cleanup.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read as _, Seek as _, SeekFrom, Write as _};

use fs4::FileExt;

use crate::error::LabError;
use crate::paths::LabPaths;

/// Held for the duration of a mutating command.
#[derive(Debug)]
pub struct LabLock {
    _file: File,
}

impl LabLock {
    /// Try to take the lock without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Locked`] if another process holds it, or
    /// [`LabError::Io`] if the lock file cannot be opened.
    pub fn acquire(paths: &LabPaths) -> Result<Self, LabError> {
        let path = paths.lock_file();
        std::fs::create_dir_all(paths.base()).map_err(LabError::io(paths.base()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(LabError::io(&path))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                let holder = holder.trim();
                return Err(LabError::Locked {
                    base: paths.base().to_path_buf(),
                    holder: if holder.is_empty() {
                        "unknown".to_owned()
                    } else {
                        holder.to_owned()
                    },
                });
            }
            Err(err) => return Err(LabError::io(&path)(err)),
        }

        file.set_len(0).map_err(LabError::io(&path))?;
        file.seek(SeekFrom::Start(0)).map_err(LabError::io(&path))?;
        write!(file, "{}", std::process::id()).map_err(LabError::io(&path))?;
        file.flush().map_err(LabError::io(&path))?;

        tracing::debug!(path = %path.display(), "acquired lab lock");
        Ok(Self { _file: file })
    }
}
