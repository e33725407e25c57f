//! Per-source-type run lock.
//!
//! One lock file per source type under `<root>/.lock/`, held with an
//! exclusive non-blocking `flock`. The lock lives outside process memory
//! because invocations are independent scheduled processes; the kernel
//! releases it if the holder crashes, so no staleness handling is needed.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{lock_io, LockError};

const LOCK_DIR: &str = ".lock";

/// RAII guard over one source type's execution rights. Dropping it (on any
/// exit path, including panic unwind) releases the lock.
#[derive(Debug)]
pub struct RunLock {
    file: std::fs::File,
    path: PathBuf,
}

impl RunLock {
    /// Acquire the named lock under `root`, failing fast with
    /// [`LockError::AlreadyRunning`] if another invocation holds it.
    pub fn acquire(root: &Path, name: &str) -> Result<RunLock, LockError> {
        let dir = root.join(LOCK_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| lock_io(&dir, e))?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| lock_io(&path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(RunLock { file, path }),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(LockError::AlreadyRunning {
                name: name.to_owned(),
            }),
            Err(e) => Err(lock_io(&path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Refuse to run against an unmounted backup filesystem: `root` must sit on
/// a different device than its parent directory.
#[cfg(unix)]
pub fn ensure_backup_mounted(root: &Path) -> Result<(), LockError> {
    use std::os::unix::fs::MetadataExt;

    let parent = root.parent().unwrap_or(root);
    let root_dev = std::fs::metadata(root).map_err(|e| lock_io(root, e))?.dev();
    let parent_dev = std::fs::metadata(parent)
        .map_err(|e| lock_io(parent, e))?
        .dev();
    if root_dev == parent_dev {
        return Err(LockError::NotMounted {
            path: root.to_path_buf(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_creates_lock_file() {
        let root = TempDir::new().unwrap();
        let lock = RunLock::acquire(root.path(), "remote-fs").unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn second_acquire_fails_fast() {
        let root = TempDir::new().unwrap();
        let _held = RunLock::acquire(root.path(), "remote-fs").unwrap();
        match RunLock::acquire(root.path(), "remote-fs") {
            Err(LockError::AlreadyRunning { name }) => assert_eq!(name, "remote-fs"),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn different_names_do_not_contend() {
        let root = TempDir::new().unwrap();
        let _a = RunLock::acquire(root.path(), "remote-fs").unwrap();
        let _b = RunLock::acquire(root.path(), "repo-host").unwrap();
    }

    #[test]
    fn drop_releases() {
        let root = TempDir::new().unwrap();
        {
            let _held = RunLock::acquire(root.path(), "archive").unwrap();
        }
        RunLock::acquire(root.path(), "archive").expect("lock should be free after drop");
    }

    #[test]
    #[cfg(unix)]
    fn tmpdir_root_is_not_a_mountpoint() {
        let root = TempDir::new().unwrap();
        assert!(matches!(
            ensure_backup_mounted(root.path()),
            Err(LockError::NotMounted { .. })
        ));
    }
}
