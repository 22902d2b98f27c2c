//! Cross-process advisory lock held for the duration of one mutation.

use anyhow::{Context, Result};
use fs2::FileExt;
use log::debug;
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::error::ConfError;

pub const LOCK_FILE_NAME: &str = "xrayctl.lock";

/// Released when dropped (and by the kernel if the process dies).
#[derive(Debug)]
pub struct MutationLock {
    path: PathBuf,
    file: File,
}

impl MutationLock {
    /// Non-blocking: a held lock is reported as [`ConfError::Locked`].
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("mkdir {}", dir.display()))?;
        let path = dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lock {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(ConfError::Locked { path }.into());
        }

        // Holder's pid, for humans only.
        file.set_len(0).with_context(|| format!("truncate lock {}", path.display()))?;
        let _ = writeln!(file, "{}", std::process::id());
        debug!("lock: acquired {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MutationLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("lock: released {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let first = MutationLock::acquire(dir.path()).unwrap();
        assert!(first.path().ends_with(LOCK_FILE_NAME));

        // flock locks belong to the open file description, so a second open conflicts.
        let err = MutationLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(crate::error::find(&err), Some(ConfError::Locked { .. })));

        drop(first);
        MutationLock::acquire(dir.path()).unwrap();
    }
}
