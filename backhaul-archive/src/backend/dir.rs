//! Directory backend: a general-purpose mounted file store.
//!
//! Blobs live under `<root>/blobs/<key>`, one JSON record per set under
//! `<root>/records/<key>.json`. The target is typically a mounted cloud
//! drive or NFS export; everything is written through tmp+rename so a
//! torn upload never looks like a finished one.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use backhaul_core::fsutil;

use crate::backend::{ArchiveRecord, ArchiverBackend};
use crate::error::{io_err, ArchiveError};

pub struct DirArchiver {
    root: PathBuf,
}

impl DirArchiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirArchiver { root: root.into() }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join("blobs").join(key)
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root.join("records").join(format!("{key}.json"))
    }
}

impl ArchiverBackend for DirArchiver {
    fn put_blob(&self, key: &str, path: &Path) -> Result<(), ArchiveError> {
        let dest = self.blob_path(key);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut source = File::open(path).map_err(|e| io_err(path, e))?;
        fsutil::write_atomic(&dest, |out| std::io::copy(&mut source, out).map(|_| ()))
            .map_err(|e| io_err(&dest, e))
    }

    fn get_blob(&self, key: &str, out: &mut dyn Write) -> Result<u64, ArchiveError> {
        let path = self.blob_path(key);
        let mut blob = File::open(&path).map_err(|e| io_err(&path, e))?;
        std::io::copy(&mut blob, out).map_err(|e| io_err(&path, e))
    }

    fn delete_blob(&self, key: &str) -> Result<(), ArchiveError> {
        let path = self.blob_path(key);
        std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
        // Drop the set directory once its last blob is gone.
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir(parent);
        }
        Ok(())
    }

    fn put_record(&self, record: &ArchiveRecord) -> Result<(), ArchiveError> {
        let path = self.record_path(&record.key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(record)?;
        fsutil::write_atomic(&path, |out| out.write_all(&json)).map_err(|e| io_err(&path, e))
    }

    fn list_records(&self) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let records_root = self.root.join("records");
        let mut records = Vec::new();
        if !records_root.exists() {
            return Ok(records);
        }
        collect_records(&records_root, &mut records)?;
        records.sort_by(|a, b| (&a.unit, &a.snapshot).cmp(&(&b.unit, &b.snapshot)));
        Ok(records)
    }

    fn delete_record(&self, key: &str) -> Result<(), ArchiveError> {
        let path = self.record_path(key);
        std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir(parent);
        }
        Ok(())
    }
}

fn collect_records(dir: &Path, records: &mut Vec<ArchiveRecord>) -> Result<(), ArchiveError> {
    for entry in std::fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        if entry.file_type().map_err(|e| io_err(&path, e))?.is_dir() {
            collect_records(&path, records)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            let bytes = std::fs::read(&path).map_err(|e| io_err(&path, e))?;
            records.push(serde_json::from_slice(&bytes)?);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
