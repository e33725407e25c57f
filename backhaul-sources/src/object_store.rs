//! Object-store source: bucket mirroring through an HTTP gateway.
//!
//! One unit per bucket. The gateway exposes a JSON key listing
//! (`GET <endpoint>/<bucket>?format=json`) and raw key bodies
//! (`GET <endpoint>/<bucket>/<key>`), authenticated with a bearer token.
//!
//! Incremental passes fetch only keys whose size or mtime changed; a full
//! pass refetches everything and garbage-collects local files for keys
//! that no longer exist. Each stored key carries its SHA-256 in an xattr
//! so scrubs can distinguish local corruption from upstream drift.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::Deserialize;

use backhaul_core::config::{Config, ObjectStoreUnit};
use backhaul_core::fsutil;
use backhaul_core::types::{SourceKind, Unit, UnitOutcome};

use crate::digest::{file_sha256, Sha256Reader};
use crate::error::{http_err, io_err, SourceError};
use crate::{Depth, JobContext, Source};

const ATTR_SHA256: &str = "user.backhaul.sha256";
const KEYS_SUBDIR: &str = "keys";

/// One entry in the gateway's bucket listing.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KeyEntry {
    pub name: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

pub struct ObjectStoreSource {
    units: BTreeMap<String, ObjectStoreUnit>,
    agent: ureq::Agent,
}

impl ObjectStoreSource {
    pub fn new(config: &Config) -> Self {
        ObjectStoreSource {
            units: config.object_store.clone(),
            agent: ureq::Agent::new(),
        }
    }

    fn unit_config(&self, unit: &Unit) -> Result<&ObjectStoreUnit, SourceError> {
        self.units
            .get(&unit.name.0)
            .ok_or_else(|| SourceError::UnknownUnit {
                name: unit.name.0.clone(),
            })
    }

    fn list_keys(&self, cfg: &ObjectStoreUnit, bucket: &str) -> Result<Vec<KeyEntry>, SourceError> {
        let url = format!("{}/{bucket}", cfg.endpoint.trim_end_matches('/'));
        let mut request = self.agent.get(&url).query("format", "json");
        if let Some(token) = &cfg.access_token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        let response = request.call().map_err(http_err)?;
        let keys: Vec<KeyEntry> = serde_json::from_reader(response.into_reader())?;
        Ok(keys)
    }

    fn fetch_key(
        &self,
        cfg: &ObjectStoreUnit,
        bucket: &str,
        entry: &KeyEntry,
        local: &Path,
    ) -> Result<bool, SourceError> {
        let url = format!(
            "{}/{bucket}/{}",
            cfg.endpoint.trim_end_matches('/'),
            entry.name
        );
        let mut request = self.agent.get(&url);
        if let Some(token) = &cfg.access_token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        let response = request.call().map_err(http_err)?;

        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut reader = Sha256Reader::new(response.into_reader());
        let changed = fsutil::update_file_from(local, &mut reader).map_err(|e| io_err(local, e))?;
        let digest = reader.digest();
        fsutil::update_xattr(local, ATTR_SHA256, digest.as_bytes())
            .map_err(|e| io_err(local, e))?;
        // Pin the stored copy to the listing's mtime, but only when it
        // differs: a gratuitous utimes still dirties the inode on a
        // copy-on-write volume.
        let meta = std::fs::metadata(local).map_err(|e| io_err(local, e))?;
        if FileTime::from_last_modification_time(&meta).unix_seconds() != entry.mtime.timestamp() {
            let mtime = FileTime::from_unix_time(entry.mtime.timestamp(), 0);
            filetime::set_file_mtime(local, mtime).map_err(|e| io_err(local, e))?;
        }
        Ok(changed)
    }

    fn sync_bucket(
        &self,
        unit: &Unit,
        ctx: &JobContext,
        refetch_all: bool,
        verify_integrity: bool,
    ) -> Result<UnitOutcome, SourceError> {
        let cfg = self.unit_config(unit)?;
        let bucket = &unit.name.0;
        let keys_dir = ctx.unit_dir(unit).join(KEYS_SUBDIR);
        std::fs::create_dir_all(&keys_dir).map_err(|e| io_err(&keys_dir, e))?;

        let listing = self.list_keys(cfg, bucket)?;
        let mut changed = false;
        let mut corrupt: Vec<String> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let mut valid: BTreeSet<PathBuf> = BTreeSet::new();

        for entry in &listing {
            let Some(relpath) = sanitize_key(&entry.name) else {
                tracing::warn!(bucket, key = %entry.name, "skipping unsafe key name");
                continue;
            };
            let local = keys_dir.join(&relpath);
            valid.insert(relpath);

            if verify_integrity && metadata_matches(&local, entry) {
                // Size and mtime still agree with the listing; the stored
                // bytes must match the digest recorded at fetch time.
                match stored_digest_matches(&local) {
                    Ok(true) => {}
                    Ok(false) => {
                        corrupt.push(entry.name.clone());
                        continue;
                    }
                    Err(e) => {
                        failed.push(format!("{}: {e}", entry.name));
                        continue;
                    }
                }
            }

            let wanted = refetch_all || !metadata_matches(&local, entry);
            if !wanted {
                continue;
            }
            match self.fetch_key(cfg, bucket, entry, &local) {
                Ok(c) => changed |= c,
                Err(e) => failed.push(format!("{}: {e}", entry.name)),
            }
        }

        if refetch_all && !verify_integrity {
            let removed = gc_tree(&keys_dir, &keys_dir, &valid)?;
            changed |= removed > 0;
        }

        if !corrupt.is_empty() {
            return Ok(UnitOutcome::ScrubFailed {
                reason: format!(
                    "{} key(s) corrupt in stored bucket: {}",
                    corrupt.len(),
                    corrupt.join(", ")
                ),
            });
        }
        if !failed.is_empty() {
            return Ok(UnitOutcome::TransferFailed {
                reason: format!("{} key(s) failed; first: {}", failed.len(), failed[0]),
            });
        }
        Ok(UnitOutcome::Success { changed })
    }
}

impl Source for ObjectStoreSource {
    fn kind(&self) -> SourceKind {
        SourceKind::ObjectStore
    }

    fn list_units(&self) -> Vec<Unit> {
        self.units
            .keys()
            .map(|bucket| Unit::new(SourceKind::ObjectStore, bucket.as_str()))
            .collect()
    }

    fn backup(
        &self,
        unit: &Unit,
        ctx: &JobContext,
        depth: Depth,
    ) -> Result<UnitOutcome, SourceError> {
        self.sync_bucket(unit, ctx, depth == Depth::Full, false)
    }

    fn scrub(&self, unit: &Unit, ctx: &JobContext) -> Result<UnitOutcome, SourceError> {
        self.sync_bucket(unit, ctx, true, true)
    }
}

/// Key name → safe relative path. Rejects absolute names and any `..`
/// traversal; empty segments collapse.
fn sanitize_key(name: &str) -> Option<PathBuf> {
    if name.starts_with('/') || name.is_empty() {
        return None;
    }
    let mut path = PathBuf::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => path.push(s),
        }
    }
    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Does the stored file still match the listing's size and mtime?
fn metadata_matches(local: &Path, entry: &KeyEntry) -> bool {
    let Ok(meta) = std::fs::metadata(local) else {
        return false;
    };
    if meta.len() != entry.size {
        return false;
    }
    let mtime = FileTime::from_last_modification_time(&meta);
    mtime.unix_seconds() == entry.mtime.timestamp()
}

/// Compare the stored file's digest with the xattr recorded at fetch time.
/// Returns true when no digest was ever recorded (nothing to check).
fn stored_digest_matches(local: &Path) -> Result<bool, SourceError> {
    let Some(recorded) = fsutil::read_xattr(local, ATTR_SHA256).map_err(|e| io_err(local, e))?
    else {
        return Ok(true);
    };
    let current = file_sha256(local).map_err(|e| io_err(local, e))?;
    Ok(current.as_bytes() == recorded.as_slice())
}

/// Delete everything under `dir` not present in `valid` (paths relative to
/// `root`), including stray temp files, then drop empty directories.
/// Returns the number of files removed.
fn gc_tree(root: &Path, dir: &Path, valid: &BTreeSet<PathBuf>) -> Result<usize, SourceError> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
        if file_type.is_dir() {
            removed += gc_tree(root, &path, valid)?;
            // Remove if now empty; ignore failure when it isn't.
            let _ = std::fs::remove_dir(&path);
        } else {
            let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            if !valid.contains(&rel) {
                std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn sanitize_rejects_traversal() {
        assert_eq!(sanitize_key("a/b.txt"), Some(PathBuf::from("a/b.txt")));
        assert_eq!(sanitize_key("a//b"), Some(PathBuf::from("a/b")));
        assert!(sanitize_key("/etc/passwd").is_none());
        assert!(sanitize_key("a/../../b").is_none());
        assert!(sanitize_key("").is_none());
    }

    #[test]
    fn metadata_match_requires_size_and_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key");
        fs::write(&path, b"12345").unwrap();
        let mtime = FileTime::from_unix_time(1_700_000_000, 0);
        filetime::set_file_mtime(&path, mtime).unwrap();

        let entry = KeyEntry {
            name: "key".into(),
            size: 5,
            mtime: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        assert!(metadata_matches(&path, &entry));

        let wrong_size = KeyEntry { size: 6, ..entry.clone() };
        assert!(!metadata_matches(&path, &wrong_size));

        let wrong_time = KeyEntry {
            mtime: DateTime::from_timestamp(1_700_000_001, 0).unwrap(),
            ..entry
        };
        assert!(!metadata_matches(&path, &wrong_time));
    }

    #[test]
    fn gc_tree_removes_stale_files_and_dirs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("stale")).unwrap();
        fs::write(root.join("a/keep"), b"k").unwrap();
        fs::write(root.join("a/drop"), b"d").unwrap();
        fs::write(root.join("stale/old"), b"o").unwrap();

        let valid: BTreeSet<PathBuf> = [PathBuf::from("a/keep")].into_iter().collect();
        let removed = gc_tree(root, root, &valid).unwrap();
        assert_eq!(removed, 2);
        assert!(root.join("a/keep").exists());
        assert!(!root.join("a/drop").exists());
        assert!(!root.join("stale").exists());
    }

    #[test]
    fn digest_check_passes_without_recorded_xattr() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key");
        fs::write(&path, b"data").unwrap();
        assert!(stored_digest_matches(&path).unwrap());
    }
}
