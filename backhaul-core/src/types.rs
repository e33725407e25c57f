//! Domain types for the Backhaul backup tree.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem
//! paths. Everything here serializes via serde so run reports can be fed to
//! an external notification layer as JSON.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Source kinds
// ---------------------------------------------------------------------------

/// The five source families a backup unit can belong to.
///
/// The label doubles as the config-section key, the lock-file name, and the
/// first component of every unit's subtree under the backup root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    RemoteFs,
    ObjectStore,
    BlockDevice,
    FsReplica,
    RepoHost,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::RemoteFs,
        SourceKind::ObjectStore,
        SourceKind::BlockDevice,
        SourceKind::FsReplica,
        SourceKind::RepoHost,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SourceKind::RemoteFs => "remote-fs",
            SourceKind::ObjectStore => "object-store",
            SourceKind::BlockDevice => "block-device",
            SourceKind::FsReplica => "fs-replica",
            SourceKind::RepoHost => "repo-host",
        }
    }

    /// Default probability of substituting a scrub for a backup, per unit
    /// per run. Roughly once every sixty runs.
    pub fn default_scrub_probability(self) -> f64 {
        0.0166
    }

    /// Default probability of forcing a full resynchronization instead of an
    /// incremental pass. Non-zero only where incremental transfer cannot
    /// observe deletions on its own.
    pub fn default_full_probability(self) -> f64 {
        match self {
            SourceKind::RemoteFs | SourceKind::BlockDevice => 0.0,
            SourceKind::ObjectStore | SourceKind::FsReplica | SourceKind::RepoHost => 0.143,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote-fs" => Ok(SourceKind::RemoteFs),
            "object-store" => Ok(SourceKind::ObjectStore),
            "block-device" => Ok(SourceKind::BlockDevice),
            "fs-replica" => Ok(SourceKind::FsReplica),
            "repo-host" => Ok(SourceKind::RepoHost),
            other => Err(format!(
                "unknown source kind '{other}'; expected: remote-fs, object-store, \
                 block-device, fs-replica, repo-host"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// A strongly-typed name for a backup unit within one source kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitName(pub String);

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for UnitName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UnitName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// An addressable backup target. Identity is `(kind, name)`; `relroot` is
/// the unit's subtree relative to the backup root, owned exclusively by this
/// unit's plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub kind: SourceKind,
    pub name: UnitName,
    pub relroot: PathBuf,
}

impl Unit {
    /// A unit whose subtree is `<kind-label>/<name>`.
    pub fn new(kind: SourceKind, name: impl Into<UnitName>) -> Self {
        let name = name.into();
        let relroot = PathBuf::from(kind.label()).join(name.0.replace('/', "-"));
        Unit {
            kind,
            name,
            relroot,
        }
    }

    /// A unit with an explicit subtree, for sources that alias their units.
    pub fn with_relroot(kind: SourceKind, name: impl Into<UnitName>, relroot: PathBuf) -> Self {
        Unit {
            kind,
            name: name.into(),
            relroot,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Per-unit result of one backup or scrub invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum UnitOutcome {
    /// The operation completed; `changed` reports whether stored data was
    /// modified.
    Success { changed: bool },
    /// Fetch/apply failure, isolated to this unit.
    TransferFailed { reason: String },
    /// Integrity mismatch found by a scrub. Never auto-corrected.
    ScrubFailed { reason: String },
    /// The plugin subprocess exceeded its per-operation timeout.
    TimedOut { after_secs: u64 },
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Success { .. })
    }

    pub fn is_scrub_failure(&self) -> bool {
        matches!(self, UnitOutcome::ScrubFailed { .. })
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Success { changed: true } => write!(f, "ok (changed)"),
            UnitOutcome::Success { changed: false } => write!(f, "ok (unchanged)"),
            UnitOutcome::TransferFailed { reason } => write!(f, "transfer failed: {reason}"),
            UnitOutcome::ScrubFailed { reason } => write!(f, "SCRUB FAILED: {reason}"),
            UnitOutcome::TimedOut { after_secs } => write!(f, "timed out after {after_secs}s"),
        }
    }
}

/// One unit's entry in a run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit: Unit,
    pub scrubbed: bool,
    pub outcome: UnitOutcome,
    pub elapsed_secs: f64,
}

/// Aggregate result of one run across all units of one source kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub kind: SourceKind,
    pub started: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub units: Vec<UnitReport>,
}

impl RunReport {
    pub fn new(kind: SourceKind, started: DateTime<Utc>, elapsed: Duration) -> Self {
        RunReport {
            kind,
            started,
            elapsed_secs: elapsed.as_secs_f64(),
            units: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.units
            .iter()
            .filter(|u| u.outcome.is_success())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.units.len() - self.succeeded()
    }

    /// Some units failed but not all. The run still counts as having run.
    pub fn degraded(&self) -> bool {
        let failed = self.failed();
        failed > 0 && failed < self.units.len()
    }

    /// Every unit failed (and there was at least one unit).
    pub fn failed_entirely(&self) -> bool {
        !self.units.is_empty() && self.failed() == self.units.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_label_roundtrip() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.label().parse::<SourceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unit_relroot_is_kind_scoped() {
        let unit = Unit::new(SourceKind::RemoteFs, "db01");
        assert_eq!(unit.relroot, PathBuf::from("remote-fs/db01"));
    }

    #[test]
    fn unit_relroot_flattens_slashes() {
        let unit = Unit::new(SourceKind::BlockDevice, "vms/web01");
        assert_eq!(unit.relroot, PathBuf::from("block-device/vms-web01"));
    }

    #[test]
    fn report_degraded_vs_failed() {
        let mut report = RunReport::new(SourceKind::RemoteFs, Utc::now(), Duration::from_secs(1));
        report.units.push(UnitReport {
            unit: Unit::new(SourceKind::RemoteFs, "a"),
            scrubbed: false,
            outcome: UnitOutcome::Success { changed: true },
            elapsed_secs: 0.1,
        });
        report.units.push(UnitReport {
            unit: Unit::new(SourceKind::RemoteFs, "b"),
            scrubbed: false,
            outcome: UnitOutcome::TransferFailed {
                reason: "connection refused".into(),
            },
            elapsed_secs: 0.1,
        });
        assert!(report.degraded());
        assert!(!report.failed_entirely());

        report.units.remove(0);
        assert!(!report.degraded());
        assert!(report.failed_entirely());
    }

    #[test]
    fn outcome_serde_tagging() {
        let yaml = serde_yaml::to_string(&UnitOutcome::ScrubFailed {
            reason: "digest mismatch".into(),
        })
        .unwrap();
        assert!(yaml.contains("scrub-failed"));
    }
}
