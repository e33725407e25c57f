//! Archive-set lifecycle: create, resume, prune, retrieve.
//!
//! Every unit × snapshot pair is one independent archive set. Upload
//! strictly precedes the metadata record, so a failed upload leaves no
//! record and the next archiving pass simply redoes it — packaging is
//! idempotent. Pruning is per unit: the newest `keep-count` sets stay,
//! older ones go once their protection window has elapsed, and a
//! protected set is never deleted.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use backhaul_core::fsutil;
use backhaul_core::types::Unit;

use crate::backend::{blob_key, ArchiveRecord, ArchiverBackend};
use crate::cost::ThrottledWriter;
use crate::error::{io_err, ArchiveError};
use crate::packer::{ArchiveInfo, Packer};

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Per-unit outcome of one archiving pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived { size: u64 },
    /// A record for this unit + snapshot already exists (resumed pass).
    AlreadyArchived,
    /// The unit has no data under the snapshot (never backed up).
    NoData,
    Failed { reason: String },
}

#[derive(Debug)]
pub struct ArchiveRunReport {
    pub snapshot: String,
    pub outcomes: Vec<(Unit, ArchiveOutcome)>,
}

impl ArchiveRunReport {
    pub fn archived(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ArchiveOutcome::Archived { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ArchiveOutcome::Failed { .. }))
            .count()
    }
}

/// Pack and upload one unit as of one snapshot.
pub fn archive_unit(
    unit_relroot: &str,
    snapshot: &str,
    snapshot_root: &Path,
    packer: &Packer,
    backend: &dyn ArchiverBackend,
    protected_days: i64,
) -> Result<ArchiveRecord, ArchiveError> {
    let (spool, info) = packer.pack(snapshot, snapshot_root, unit_relroot)?;
    let key = blob_key(snapshot, unit_relroot);
    backend.put_blob(&key, spool.path())?;
    // Only now does the set exist: the record is written after the blob,
    // so an interrupted upload is invisible to the index.
    let record = ArchiveRecord::new(unit_relroot, snapshot, &info, Utc::now(), protected_days);
    backend.put_record(&record)?;
    tracing::info!(unit = unit_relroot, snapshot, size = info.size, "archived unit");
    Ok(record)
}

/// Archive every unit with data under the snapshot, skipping sets that
/// already exist, across a bounded pool of upload workers.
pub fn archive_snapshot(
    units: &[Unit],
    snapshot: &str,
    snapshot_root: &Path,
    packer: &Packer,
    backend: &dyn ArchiverBackend,
    protected_days: i64,
    workers: usize,
) -> Result<ArchiveRunReport, ArchiveError> {
    let existing: BTreeSet<String> = backend
        .list_records()?
        .into_iter()
        .filter(|r| r.snapshot == snapshot)
        .map(|r| r.unit)
        .collect();

    let queue: Mutex<Vec<&Unit>> = Mutex::new(units.iter().rev().collect());
    let outcomes: Mutex<Vec<(Unit, ArchiveOutcome)>> = Mutex::new(Vec::new());
    let worker_count = workers.clamp(1, units.len().max(1));

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| loop {
                let Some(unit) = queue.lock().unwrap().pop() else {
                    return;
                };
                let relroot = unit.relroot.to_string_lossy().into_owned();
                let outcome = if existing.contains(&relroot) {
                    ArchiveOutcome::AlreadyArchived
                } else if !snapshot_root.join(&unit.relroot).exists() {
                    ArchiveOutcome::NoData
                } else {
                    match archive_unit(
                        &relroot,
                        snapshot,
                        snapshot_root,
                        packer,
                        backend,
                        protected_days,
                    ) {
                        Ok(record) => ArchiveOutcome::Archived { size: record.size },
                        Err(e) => {
                            tracing::error!(unit = %unit, "archiving failed: {e}");
                            ArchiveOutcome::Failed {
                                reason: e.to_string(),
                            }
                        }
                    }
                };
                outcomes.lock().unwrap().push((unit.clone(), outcome));
            });
        }
    });

    let mut outcomes = outcomes.into_inner().unwrap();
    outcomes.sort_by(|a, b| a.0.relroot.cmp(&b.0.relroot));
    Ok(ArchiveRunReport {
        snapshot: snapshot.to_owned(),
        outcomes,
    })
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// The queryable archive-set index: every record, sorted by unit then
/// snapshot. Self-sufficient for disaster recovery.
pub fn index(backend: &dyn ArchiverBackend) -> Result<Vec<ArchiveRecord>, ArchiveError> {
    let mut records = backend.list_records()?;
    records.sort_by(|a, b| {
        (&a.unit, &a.snapshot)
            .cmp(&(&b.unit, &b.snapshot))
    });
    Ok(records)
}

// ---------------------------------------------------------------------------
// Pruning
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ArchivePruneReport {
    pub deleted: Vec<ArchiveRecord>,
    pub kept: usize,
    /// Sets past keep-count whose protection window has not elapsed.
    pub still_protected: usize,
    pub failed: Vec<(String, String)>,
}

/// Which of `records` (one unit's sets) should be deleted `now`.
///
/// Pure: sets are ordered newest-first by snapshot; the first
/// `keep_count` stay, the rest go only once unprotected.
pub fn plan_unit_prune(
    mut records: Vec<ArchiveRecord>,
    keep_count: usize,
    now: DateTime<Utc>,
) -> (Vec<ArchiveRecord>, Vec<ArchiveRecord>, usize) {
    records.sort_by(|a, b| b.snapshot.cmp(&a.snapshot));
    let mut keep = Vec::new();
    let mut delete = Vec::new();
    let mut still_protected = 0;
    for (index, record) in records.into_iter().enumerate() {
        if index < keep_count {
            keep.push(record);
        } else if record.protected_at(now) {
            still_protected += 1;
            keep.push(record);
        } else {
            delete.push(record);
        }
    }
    (keep, delete, still_protected)
}

/// Prune one unit's archive sets.
pub fn prune_unit(
    backend: &dyn ArchiverBackend,
    unit: &str,
    keep_count: usize,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<ArchivePruneReport, ArchiveError> {
    let records: Vec<ArchiveRecord> = backend
        .list_records()?
        .into_iter()
        .filter(|r| r.unit == unit)
        .collect();
    let (keep, delete, still_protected) = plan_unit_prune(records, keep_count, now);

    let mut report = ArchivePruneReport {
        kept: keep.len(),
        still_protected,
        ..Default::default()
    };
    for record in delete {
        if dry_run {
            report.deleted.push(record);
            continue;
        }
        match delete_set(backend, &record) {
            Ok(()) => {
                tracing::info!(unit, snapshot = %record.snapshot, "pruned archive set");
                report.deleted.push(record);
            }
            Err(e) => report.failed.push((record.key.clone(), e.to_string())),
        }
    }
    Ok(report)
}

/// Prune every unit present in the index.
pub fn prune_all(
    backend: &dyn ArchiverBackend,
    keep_count: usize,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<ArchivePruneReport, ArchiveError> {
    let units: BTreeSet<String> = backend
        .list_records()?
        .into_iter()
        .map(|r| r.unit)
        .collect();
    let mut combined = ArchivePruneReport::default();
    for unit in units {
        let report = prune_unit(backend, &unit, keep_count, now, dry_run)?;
        combined.deleted.extend(report.deleted);
        combined.kept += report.kept;
        combined.still_protected += report.still_protected;
        combined.failed.extend(report.failed);
    }
    Ok(combined)
}

fn delete_set(backend: &dyn ArchiverBackend, record: &ArchiveRecord) -> Result<(), ArchiveError> {
    // Blob first: a record without a blob would claim a recoverable copy
    // that does not exist.
    backend.delete_blob(&record.key)?;
    backend.delete_record(&record.key)
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// Download and verify one archive set into `dest_dir`, paced by
/// `rate_per_hour` when given. Returns the written path and the info
/// needed to unpack it.
pub fn retrieve(
    backend: &dyn ArchiverBackend,
    unit: &str,
    snapshot: &str,
    dest_dir: &Path,
    rate_per_hour: Option<u64>,
) -> Result<(PathBuf, ArchiveInfo), ArchiveError> {
    let record = backend
        .list_records()?
        .into_iter()
        .find(|r| r.unit == unit && r.snapshot == snapshot)
        .ok_or_else(|| ArchiveError::NoSuchArchive {
            unit: unit.to_owned(),
            snapshot: snapshot.to_owned(),
        })?;

    let out_path = dest_dir.join(format!("{snapshot}:{}", unit.replace('/', "-")));
    if out_path.exists() {
        return Err(ArchiveError::OutputExists { path: out_path });
    }
    std::fs::create_dir_all(dest_dir).map_err(|e| io_err(dest_dir, e))?;

    let mut verified: Option<(u64, String)> = None;
    fsutil::write_atomic(&out_path, |file| {
        let mut hashing = HashingWriter::new(file);
        let written = match rate_per_hour {
            Some(rate) => {
                let mut throttled = ThrottledWriter::new(&mut hashing, rate);
                write_blob(backend, &record.key, &mut throttled)?
            }
            None => write_blob(backend, &record.key, &mut hashing)?,
        };
        verified = Some((written, hashing.digest()));
        Ok(())
    })
    .map_err(|e| io_err(&out_path, e))?;

    let (written, digest) = verified.expect("write closure ran");
    if written != record.size {
        let _ = std::fs::remove_file(&out_path);
        return Err(ArchiveError::Verification {
            detail: format!("size mismatch: expected {}, got {written}", record.size),
        });
    }
    if digest != record.sha256 {
        let _ = std::fs::remove_file(&out_path);
        return Err(ArchiveError::Verification {
            detail: "SHA-256 mismatch".into(),
        });
    }
    Ok((out_path, record.info()))
}

fn write_blob(
    backend: &dyn ArchiverBackend,
    key: &str,
    out: &mut dyn Write,
) -> std::io::Result<u64> {
    backend
        .get_blob(key, out)
        .map_err(|e| std::io::Error::other(e.to_string()))
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        HashingWriter {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn digest(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
