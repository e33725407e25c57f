//! YAML configuration.
//!
//! One document, default path `~/.backhaul.yaml`:
//!
//! ```text
//! settings:
//!   root: /srv/backup
//!   backup-volume: vg0/backup
//!   workers: { remote-fs: 4 }
//!   scrub-probability: { remote-fs: 0.0166 }
//! archivers:
//!   default: { backend: dir, path: /mnt/offsite/backhaul }
//! remote-fs:
//!   db01.example.org: { mounts: ["/", "/srv"] }
//! ```
//!
//! # API pattern
//!
//! `load_at(path)` takes an explicit path and is what tests use;
//! `load(override)` resolves the default path via `dirs::home_dir()` and
//! delegates. Tests must never call `load`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{config_io, ConfigError};
use crate::types::SourceKind;

pub const DEFAULT_CONFIG_NAME: &str = ".backhaul.yaml";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The `settings:` section. Everything except `root` has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// Backup tree root. Must be the mountpoint of the snapshot-capable
    /// volume when `require-mounted-root` is set.
    pub root: PathBuf,

    /// `vg/lv` of the copy-on-write volume holding the backup tree.
    /// Required for snapshot and prune operations.
    pub backup_volume: Option<String>,

    /// Refuse to run when `root` sits on the same device as its parent
    /// (i.e. the backup filesystem is not mounted).
    #[serde(default = "default_true")]
    pub require_mounted_root: bool,

    /// Keep every snapshot younger than this many days.
    #[serde(default = "default_gc_duplicate_days")]
    pub gc_duplicate_days: u32,

    /// Keep one snapshot per day for this many weeks.
    #[serde(default = "default_gc_daily_weeks")]
    pub gc_daily_weeks: u32,

    /// Keep one snapshot per ISO week for this many 28-day months.
    #[serde(default = "default_gc_weekly_months")]
    pub gc_weekly_months: u32,

    /// Keep unit logs for this many distinct days per log directory.
    #[serde(default = "default_gc_log_distinct_days")]
    pub gc_log_distinct_days: usize,

    /// Per-operation timeout for plugin subprocesses, minutes. 0 disables.
    #[serde(default = "default_unit_timeout_minutes")]
    pub unit_timeout_minutes: u64,

    /// Worker-pool width per source kind, keyed by label. Default 1.
    #[serde(default)]
    pub workers: BTreeMap<String, usize>,

    /// Scrub probability per source kind, keyed by label.
    #[serde(default)]
    pub scrub_probability: BTreeMap<String, f64>,

    /// Full-resync probability per source kind, keyed by label.
    #[serde(default)]
    pub full_probability: BTreeMap<String, f64>,

    // --- remote-fs ---
    /// Local rsync binary override.
    pub rsync_local_binary: Option<String>,
    /// Exclude patterns applied to every remote-fs unit.
    #[serde(default)]
    pub rsync_exclude: Vec<String>,

    // --- block-device ---
    #[serde(default = "default_block_tool")]
    pub block_tool: String,

    // --- fs-replica ---
    #[serde(default = "default_replica_tool")]
    pub replica_tool: String,

    // --- repo-host ---
    #[serde(default = "default_git_binary")]
    pub repo_git_binary: String,
    /// Base URL of the hosting API, e.g. `https://git.example.org/api/v3`.
    pub repo_api_base: Option<String>,
    /// Base URL for clone URLs, e.g. `https://git.example.org`.
    pub repo_clone_base: Option<String>,
    /// Token for the hosting API. Never logged.
    pub repo_api_token: Option<String>,

    // --- archiving ---
    /// Spool directory for packed archives awaiting upload.
    pub archive_spool: Option<PathBuf>,
    #[serde(default = "default_tar_path")]
    pub archive_tar_path: String,
    #[serde(default = "default_gpg_path")]
    pub archive_gpg_path: String,
    /// Recipient key IDs; encryption is enabled when non-empty.
    #[serde(default)]
    pub archive_gpg_recipients: Vec<String>,
    /// Signing key ID. Must not require interactive secret entry.
    pub archive_gpg_signing_key: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_gc_duplicate_days() -> u32 {
    14
}
fn default_gc_daily_weeks() -> u32 {
    8
}
fn default_gc_weekly_months() -> u32 {
    12
}
fn default_gc_log_distinct_days() -> usize {
    60
}
fn default_unit_timeout_minutes() -> u64 {
    1440
}
fn default_block_tool() -> String {
    "rbd".into()
}
fn default_replica_tool() -> String {
    "volutil".into()
}
fn default_git_binary() -> String {
    "git".into()
}
fn default_tar_path() -> String {
    "tar".into()
}
fn default_gpg_path() -> String {
    "gpg2".into()
}

impl Settings {
    pub fn workers_for(&self, kind: SourceKind) -> usize {
        self.workers.get(kind.label()).copied().unwrap_or(1).max(1)
    }

    pub fn scrub_probability_for(&self, kind: SourceKind) -> f64 {
        self.scrub_probability
            .get(kind.label())
            .copied()
            .unwrap_or_else(|| kind.default_scrub_probability())
    }

    pub fn full_probability_for(&self, kind: SourceKind) -> f64 {
        self.full_probability
            .get(kind.label())
            .copied()
            .unwrap_or_else(|| kind.default_full_probability())
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        match self.unit_timeout_minutes {
            0 => None,
            mins => Some(Duration::from_secs(mins * 60)),
        }
    }

    /// `(volume_group, logical_volume)` of the backup volume.
    pub fn backup_volume(&self) -> Result<(&str, &str), ConfigError> {
        let raw = self
            .backup_volume
            .as_deref()
            .ok_or_else(|| ConfigError::MissingSetting {
                key: "settings.backup-volume".into(),
            })?;
        raw.split_once('/').ok_or_else(|| ConfigError::MissingSetting {
            key: "settings.backup-volume (expected vg/lv)".into(),
        })
    }

    pub fn archive_spool(&self) -> Result<&Path, ConfigError> {
        self.archive_spool
            .as_deref()
            .ok_or_else(|| ConfigError::MissingSetting {
                key: "settings.archive-spool".into(),
            })
    }

    /// `<root>/Logs`
    pub fn log_root(&self) -> PathBuf {
        self.root.join("Logs")
    }
}

// ---------------------------------------------------------------------------
// Archiver profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// General-purpose mounted file store.
    Dir,
    /// Cold-storage object store + metadata index over HTTP.
    Cold,
}

/// One named archiver target under `archivers:`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArchiverProfile {
    pub backend: BackendKind,

    /// Archive sets to keep per unit beyond the protection window.
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,

    /// Minimum retention before a set may be deleted, days.
    #[serde(default = "default_protected_days")]
    pub protected_days: i64,

    /// Storage price used by the advisory cost estimate, $/GiB-month.
    #[serde(default = "default_price_per_gb_month")]
    pub price_per_gb_month: f64,

    /// Upload worker-pool width.
    #[serde(default = "default_archive_workers")]
    pub workers: usize,

    /// Dir backend: target directory (a mounted cloud drive, NFS export…).
    pub path: Option<PathBuf>,

    /// Cold backend: base URL of the archive gateway.
    pub endpoint: Option<String>,
    /// Cold backend: bearer token.
    pub access_token: Option<String>,
}

fn default_keep_count() -> usize {
    1
}
fn default_protected_days() -> i64 {
    90
}
fn default_price_per_gb_month() -> f64 {
    0.01
}
fn default_archive_workers() -> usize {
    8
}

// ---------------------------------------------------------------------------
// Per-source unit manifests
// ---------------------------------------------------------------------------

/// One remote host to mirror with rsync, keyed by hostname.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteFsUnit {
    /// Mountpoints to back up; each is transferred with `-R` relative paths.
    pub mounts: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Short name used for the unit's subtree; defaults to the first
    /// hostname component.
    pub alias: Option<String>,
    /// Command run on the host over ssh before the transfer.
    pub pre: Option<String>,
    /// Command run on the host over ssh after the transfer.
    pub post: Option<String>,
}

/// One bucket to mirror from an object-store gateway, keyed by bucket name.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ObjectStoreUnit {
    /// Gateway base URL, e.g. `https://rgw.internal:8080`.
    pub endpoint: String,
    pub access_token: Option<String>,
}

/// One block image, keyed by `pool/image`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockDeviceUnit {}

/// One distributed-fs volume, keyed by volume name.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FsReplicaUnit {
    /// Server holding the replica to dump from.
    pub server: String,
}

/// One hosted repository, keyed by `owner/name`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RepoHostUnit {
    /// Clone URL override; defaults to `<repo-clone-base>/<owner/name>.git`.
    pub clone_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Config root
// ---------------------------------------------------------------------------

/// Root of the Backhaul YAML configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub settings: Settings,

    #[serde(default)]
    pub archivers: BTreeMap<String, ArchiverProfile>,

    #[serde(default, rename = "remote-fs")]
    pub remote_fs: BTreeMap<String, RemoteFsUnit>,

    #[serde(default, rename = "object-store")]
    pub object_store: BTreeMap<String, ObjectStoreUnit>,

    #[serde(default, rename = "block-device")]
    pub block_device: BTreeMap<String, BlockDeviceUnit>,

    #[serde(default, rename = "fs-replica")]
    pub fs_replica: BTreeMap<String, FsReplicaUnit>,

    #[serde(default, rename = "repo-host")]
    pub repo_host: BTreeMap<String, RepoHostUnit>,
}

impl Config {
    /// Load from an explicit path. Tests use this.
    pub fn load_at(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| config_io(path, e))?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// `~/.backhaul.yaml`, unless overridden.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(DEFAULT_CONFIG_NAME))
    }

    /// Load from `override_path` when given, the default path otherwise.
    pub fn load(override_path: Option<&Path>) -> Result<Config, ConfigError> {
        match override_path {
            Some(p) => Self::load_at(p),
            None => Self::load_at(&Self::default_path()?),
        }
    }

    /// The named archiver profile, or `MissingSetting`.
    pub fn archiver(&self, profile: &str) -> Result<&ArchiverProfile, ConfigError> {
        self.archivers
            .get(profile)
            .ok_or_else(|| ConfigError::MissingSetting {
                key: format!("archivers.{profile}"),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("backhaul.yaml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "settings:\n  root: /srv/backup\n",
        );
        let config = Config::load_at(&path).unwrap();
        assert_eq!(config.settings.gc_duplicate_days, 14);
        assert_eq!(config.settings.gc_daily_weeks, 8);
        assert_eq!(config.settings.gc_weekly_months, 12);
        assert_eq!(config.settings.workers_for(SourceKind::RemoteFs), 1);
        assert!(config.settings.require_mounted_root);
        assert!(config.archivers.is_empty());
    }

    #[test]
    fn per_kind_overrides() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            concat!(
                "settings:\n",
                "  root: /srv/backup\n",
                "  workers: { remote-fs: 4 }\n",
                "  scrub-probability: { remote-fs: 0.5 }\n",
                "  full-probability: { repo-host: 0.25 }\n",
            ),
        );
        let config = Config::load_at(&path).unwrap();
        let s = &config.settings;
        assert_eq!(s.workers_for(SourceKind::RemoteFs), 4);
        assert_eq!(s.workers_for(SourceKind::RepoHost), 1);
        assert_eq!(s.scrub_probability_for(SourceKind::RemoteFs), 0.5);
        assert_eq!(s.full_probability_for(SourceKind::RepoHost), 0.25);
        // Untouched kinds keep their per-kind defaults.
        assert_eq!(s.full_probability_for(SourceKind::RemoteFs), 0.0);
        assert_eq!(s.full_probability_for(SourceKind::FsReplica), 0.143);
    }

    #[test]
    fn backup_volume_parse() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "settings:\n  root: /srv/backup\n  backup-volume: vg0/backup\n",
        );
        let config = Config::load_at(&path).unwrap();
        assert_eq!(config.settings.backup_volume().unwrap(), ("vg0", "backup"));
    }

    #[test]
    fn backup_volume_missing_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "settings:\n  root: /srv/backup\n");
        let config = Config::load_at(&path).unwrap();
        assert!(matches!(
            config.settings.backup_volume(),
            Err(ConfigError::MissingSetting { .. })
        ));
    }

    #[test]
    fn unit_manifests_parse() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            concat!(
                "settings:\n  root: /srv/backup\n",
                "remote-fs:\n",
                "  db01.example.org:\n",
                "    mounts: [\"/\", \"/srv\"]\n",
                "    alias: db01\n",
                "block-device:\n",
                "  vms/web01: {}\n",
                "archivers:\n",
                "  default:\n",
                "    backend: dir\n",
                "    path: /mnt/offsite\n",
            ),
        );
        let config = Config::load_at(&path).unwrap();
        assert_eq!(config.remote_fs.len(), 1);
        assert_eq!(
            config.remote_fs["db01.example.org"].alias.as_deref(),
            Some("db01")
        );
        assert!(config.block_device.contains_key("vms/web01"));
        let profile = config.archiver("default").unwrap();
        assert_eq!(profile.backend, BackendKind::Dir);
        assert_eq!(profile.keep_count, 1);
        assert_eq!(profile.protected_days, 90);
    }

    #[test]
    fn unknown_profile_is_missing_setting() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "settings:\n  root: /srv/backup\n");
        let config = Config::load_at(&path).unwrap();
        assert!(matches!(
            config.archiver("nope"),
            Err(ConfigError::MissingSetting { .. })
        ));
    }

    #[test]
    fn parse_error_carries_path() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "settings: [not, a, mapping]\n");
        match Config::load_at(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn timeout_zero_disables() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "settings:\n  root: /srv/backup\n  unit-timeout-minutes: 0\n",
        );
        let config = Config::load_at(&path).unwrap();
        assert_eq!(config.settings.unit_timeout(), None);
    }
}
