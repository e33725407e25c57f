//! Archiver backend contract.
//!
//! A backend stores opaque blobs plus one metadata record per archive
//! set. Records are the source of truth for disaster recovery: the index
//! they form must be enough to find, verify, and unpack every archive
//! without the original configuration.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use backhaul_core::config::{ArchiverProfile, BackendKind};
use backhaul_core::error::ConfigError;

use crate::error::ArchiveError;
use crate::packer::ArchiveInfo;

pub mod cold;
pub mod dir;

/// One archive set: one unit, one snapshot, one uploaded blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// The unit's subtree path — stable across config renames.
    pub unit: String,
    /// Snapshot the data was read from.
    pub snapshot: String,
    /// Backend blob key.
    pub key: String,
    pub size: u64,
    pub sha256: String,
    pub compression: String,
    pub encryption: String,
    pub created: DateTime<Utc>,
    /// The set may not be deleted before this time, regardless of
    /// keep-count.
    pub protected_until: DateTime<Utc>,
}

impl ArchiveRecord {
    pub fn new(
        unit: &str,
        snapshot: &str,
        info: &ArchiveInfo,
        created: DateTime<Utc>,
        protected_days: i64,
    ) -> Self {
        ArchiveRecord {
            unit: unit.to_owned(),
            snapshot: snapshot.to_owned(),
            key: blob_key(snapshot, unit),
            size: info.size,
            sha256: info.sha256.clone(),
            compression: info.compression.clone(),
            encryption: info.encryption.clone(),
            created,
            protected_until: created + Duration::days(protected_days),
        }
    }

    pub fn protected_at(&self, now: DateTime<Utc>) -> bool {
        self.protected_until > now
    }

    pub fn info(&self) -> ArchiveInfo {
        ArchiveInfo {
            compression: self.compression.clone(),
            encryption: self.encryption.clone(),
            sha256: self.sha256.clone(),
            size: self.size,
        }
    }
}

/// `<snapshot>/<unit with slashes flattened>`
pub fn blob_key(snapshot: &str, unit: &str) -> String {
    format!("{snapshot}/{}", unit.replace('/', "-"))
}

/// The storage contract every offsite target implements.
pub trait ArchiverBackend: Send + Sync {
    /// Upload the file at `path` under `key`. Overwriting an existing
    /// blob is allowed (a retried upload whose record was never written).
    fn put_blob(&self, key: &str, path: &Path) -> Result<(), ArchiveError>;

    /// Stream a blob into `out`, returning the byte count.
    fn get_blob(&self, key: &str, out: &mut dyn Write) -> Result<u64, ArchiveError>;

    fn delete_blob(&self, key: &str) -> Result<(), ArchiveError>;

    fn put_record(&self, record: &ArchiveRecord) -> Result<(), ArchiveError>;

    fn list_records(&self) -> Result<Vec<ArchiveRecord>, ArchiveError>;

    fn delete_record(&self, key: &str) -> Result<(), ArchiveError>;
}

/// Instantiate the backend for a profile.
pub fn backend_for(profile: &ArchiverProfile) -> Result<Box<dyn ArchiverBackend>, ArchiveError> {
    match profile.backend {
        BackendKind::Dir => {
            let path = profile
                .path
                .as_deref()
                .ok_or_else(|| ConfigError::MissingSetting {
                    key: "archivers.<profile>.path".into(),
                })?;
            Ok(Box::new(dir::DirArchiver::new(path)))
        }
        BackendKind::Cold => {
            let endpoint = profile
                .endpoint
                .as_deref()
                .ok_or_else(|| ConfigError::MissingSetting {
                    key: "archivers.<profile>.endpoint".into(),
                })?;
            Ok(Box::new(cold::ColdArchiver::new(
                endpoint,
                profile.access_token.clone(),
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
