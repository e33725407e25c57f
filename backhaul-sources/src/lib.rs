//! # backhaul-sources
//!
//! The source-plugin capability interface and its five implementations:
//! remote filesystems over rsync, object-store buckets, block-device
//! images, distributed-fs replica volumes, and hosted repositories.
//!
//! A plugin enumerates its units from configuration and performs
//! `backup`/`scrub` against the shared backup tree, confining every write
//! to the unit's own subtree and routing all mutations through the atomic
//! update primitives in `backhaul_core::fsutil`.

pub mod block_device;
pub mod cmd;
mod digest;
pub mod error;
pub mod fs_replica;
pub mod object_store;
pub mod remote_fs;
pub mod repo_host;

use std::path::PathBuf;
use std::time::Duration;

use backhaul_core::config::{Config, Settings};
use backhaul_core::types::{SourceKind, Unit, UnitOutcome};

pub use error::SourceError;

// ---------------------------------------------------------------------------
// Job context
// ---------------------------------------------------------------------------

/// How much work a backup pass should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    /// Fetch changes since the last successful backup.
    Incremental,
    /// Resynchronize everything, catching deletions invisible to an
    /// incremental pass.
    Full,
}

/// Paths and limits shared by every unit operation within one run.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Backup tree root.
    pub root: PathBuf,
    /// Root of per-unit log directories (`<root>/Logs`).
    pub log_root: PathBuf,
    /// Per-operation subprocess timeout.
    pub timeout: Option<Duration>,
}

impl JobContext {
    pub fn from_settings(settings: &Settings) -> Self {
        JobContext {
            root: settings.root.clone(),
            log_root: settings.log_root(),
            timeout: settings.unit_timeout(),
        }
    }

    /// The unit's exclusive subtree.
    pub fn unit_dir(&self, unit: &Unit) -> PathBuf {
        self.root.join(&unit.relroot)
    }

    /// The unit's log directory.
    pub fn unit_log_dir(&self, unit: &Unit) -> PathBuf {
        self.log_root.join(&unit.relroot)
    }
}

// ---------------------------------------------------------------------------
// Source contract
// ---------------------------------------------------------------------------

/// The capability interface every source type satisfies. The coordinator
/// holds no type-specific logic; it only sees this trait.
pub trait Source: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Enumerate this source's units. Pure and deterministic for a given
    /// configuration; sorted by unit subtree.
    fn list_units(&self) -> Vec<Unit>;

    /// Fetch changes since the last successful backup of `unit` and apply
    /// them under the unit's subtree. Every exit path leaves the subtree
    /// fully committed.
    fn backup(&self, unit: &Unit, ctx: &JobContext, depth: Depth)
        -> Result<UnitOutcome, SourceError>;

    /// Re-validate the unit's stored data against the live source.
    /// Legitimate drift is corrected transparently; an integrity mismatch
    /// comes back as [`UnitOutcome::ScrubFailed`] and changes nothing.
    fn scrub(&self, unit: &Unit, ctx: &JobContext) -> Result<UnitOutcome, SourceError>;
}

/// All five sources for a configuration, in `SourceKind::ALL` order.
/// Sources with empty manifests are still present; they simply list no
/// units.
pub fn registry(config: &Config) -> Vec<Box<dyn Source>> {
    SourceKind::ALL
        .iter()
        .map(|kind| source_for(config, *kind))
        .collect()
}

/// The plugin for one source kind.
pub fn source_for(config: &Config, kind: SourceKind) -> Box<dyn Source> {
    match kind {
        SourceKind::RemoteFs => Box::new(remote_fs::RemoteFsSource::new(config)),
        SourceKind::ObjectStore => Box::new(object_store::ObjectStoreSource::new(config)),
        SourceKind::BlockDevice => Box::new(block_device::BlockDeviceSource::new(config)),
        SourceKind::FsReplica => Box::new(fs_replica::FsReplicaSource::new(config)),
        SourceKind::RepoHost => Box::new(repo_host::RepoHostSource::new(config)),
    }
}
