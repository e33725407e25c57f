//! Volume/snapshot provider boundary.
//!
//! The engine only assumes copy-on-write snapshots with create/list/
//! delete plus a way to mount one read-only for the archive read path.
//! [`LvmVolume`] drives LVM thin snapshots through the usual tools;
//! [`MemoryVolume`] is the in-memory double the test suites use.

use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use crate::error::EngineError;

/// Snapshot tag distinguishing Backhaul's snapshots from everything else
/// in the volume group.
const SNAPSHOT_TAG: &str = "backhaul-snapshot";

pub trait VolumeProvider: Send + Sync {
    fn create_snapshot(&self, name: &str) -> Result<(), EngineError>;

    /// All Backhaul snapshots, unordered; callers sort after parsing.
    fn list_snapshots(&self) -> Result<Vec<String>, EngineError>;

    fn delete_snapshot(&self, name: &str) -> Result<(), EngineError>;

    /// Activate and mount a snapshot read-only at `mountpoint`.
    fn mount_snapshot(&self, name: &str, mountpoint: &Path) -> Result<(), EngineError>;

    fn unmount_snapshot(&self, name: &str, mountpoint: &Path) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// LVM implementation
// ---------------------------------------------------------------------------

/// Thin-snapshot provider over `lvs`/`lvcreate`/`lvremove`/`lvchange`.
pub struct LvmVolume {
    vg: String,
    lv: String,
}

impl LvmVolume {
    pub fn new(vg: impl Into<String>, lv: impl Into<String>) -> Self {
        LvmVolume {
            vg: vg.into(),
            lv: lv.into(),
        }
    }

    fn run(args: &[&str]) -> Result<String, EngineError> {
        let output = Command::new("sudo")
            .args(args)
            .output()
            .map_err(|e| EngineError::Volume {
                detail: format!("failed to run sudo {}: {e}", args.first().unwrap_or(&"")),
            })?;
        if !output.status.success() {
            return Err(EngineError::Volume {
                detail: format!(
                    "{} exited with {:?}: {}",
                    args.join(" "),
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl VolumeProvider for LvmVolume {
    fn create_snapshot(&self, name: &str) -> Result<(), EngineError> {
        Self::run(&[
            "lvcreate",
            "-s",
            &format!("{}/{}", self.vg, self.lv),
            "-p",
            "r",
            "-n",
            name,
            "--addtag",
            SNAPSHOT_TAG,
        ])
        .map(|_| ())
    }

    fn list_snapshots(&self) -> Result<Vec<String>, EngineError> {
        let out = Self::run(&[
            "lvs",
            "--noheadings",
            "-o",
            "lv_name",
            &format!("@{SNAPSHOT_TAG}"),
        ])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn delete_snapshot(&self, name: &str) -> Result<(), EngineError> {
        Self::run(&["lvremove", "-f", &format!("{}/{name}", self.vg)]).map(|_| ())
    }

    fn mount_snapshot(&self, name: &str, mountpoint: &Path) -> Result<(), EngineError> {
        Self::run(&["lvchange", "-a", "y", "-K", &format!("{}/{name}", self.vg)])?;
        std::fs::create_dir_all(mountpoint).map_err(|e| crate::error::io_err(mountpoint, e))?;
        Self::run(&[
            "mount",
            "-o",
            "ro",
            &format!("/dev/{}/{name}", self.vg),
            &mountpoint.to_string_lossy(),
        ])
        .map(|_| ())
    }

    fn unmount_snapshot(&self, name: &str, mountpoint: &Path) -> Result<(), EngineError> {
        Self::run(&["umount", &mountpoint.to_string_lossy()])?;
        let _ = std::fs::remove_dir(mountpoint);
        Self::run(&["lvchange", "-a", "n", &format!("{}/{name}", self.vg)]).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------------

/// In-memory provider for tests: records snapshots and can be told to
/// fail deletions of specific names.
#[derive(Debug, Default)]
pub struct MemoryVolume {
    snapshots: Mutex<Vec<String>>,
    fail_delete: Mutex<Vec<String>>,
}

impl MemoryVolume {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshots<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        let volume = Self::default();
        *volume.snapshots.lock().unwrap() = names.into_iter().map(Into::into).collect();
        volume
    }

    /// Make future deletions of `name` fail.
    pub fn fail_deletion_of(&self, name: &str) {
        self.fail_delete.lock().unwrap().push(name.to_owned());
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshots.lock().unwrap().clone()
    }
}

impl VolumeProvider for MemoryVolume {
    fn create_snapshot(&self, name: &str) -> Result<(), EngineError> {
        let mut snapshots = self.snapshots.lock().unwrap();
        if snapshots.iter().any(|s| s == name) {
            return Err(EngineError::Snapshot {
                name: name.to_owned(),
                detail: "already exists".into(),
            });
        }
        snapshots.push(name.to_owned());
        Ok(())
    }

    fn list_snapshots(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.names())
    }

    fn delete_snapshot(&self, name: &str) -> Result<(), EngineError> {
        if self.fail_delete.lock().unwrap().iter().any(|s| s == name) {
            return Err(EngineError::Snapshot {
                name: name.to_owned(),
                detail: "deletion refused by test double".into(),
            });
        }
        let mut snapshots = self.snapshots.lock().unwrap();
        let before = snapshots.len();
        snapshots.retain(|s| s != name);
        if snapshots.len() == before {
            return Err(EngineError::Snapshot {
                name: name.to_owned(),
                detail: "no such snapshot".into(),
            });
        }
        Ok(())
    }

    fn mount_snapshot(&self, _name: &str, mountpoint: &Path) -> Result<(), EngineError> {
        std::fs::create_dir_all(mountpoint).map_err(|e| crate::error::io_err(mountpoint, e))
    }

    fn unmount_snapshot(&self, _name: &str, _mountpoint: &Path) -> Result<(), EngineError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
