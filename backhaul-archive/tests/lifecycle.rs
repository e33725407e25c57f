//! End-to-end archive lifecycle against the directory backend.
//!
//! These tests drive the real packer, so they need a GNU tar with
//! acl/selinux/xattr support; they bail out quietly where it is missing.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use chrono::Utc;

use backhaul_archive::backend::dir::DirArchiver;
use backhaul_archive::backend::ArchiverBackend;
use backhaul_archive::lifecycle::{self, ArchiveOutcome};
use backhaul_archive::{ArchiveError, Packer};
use backhaul_core::config::Settings;
use backhaul_core::types::{SourceKind, Unit};
use tempfile::TempDir;

fn tar_supports_metadata_flags() -> bool {
    Command::new("tar")
        .args(["--acls", "--selinux", "--xattrs", "--version"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn packer_for(spool: &Path) -> Packer {
    let yaml = format!(
        "root: /srv/backup\narchive-spool: {}\n",
        spool.display()
    );
    let settings: Settings = serde_yaml::from_str(&yaml).unwrap();
    Packer::from_settings(&settings).unwrap()
}

fn fake_snapshot_root(root: &Path) {
    let db = root.join("remote-fs/db01/etc");
    fs::create_dir_all(&db).unwrap();
    fs::write(db.join("hosts"), b"127.0.0.1 localhost\n").unwrap();
    let bucket = root.join("object-store/media/keys");
    fs::create_dir_all(&bucket).unwrap();
    fs::write(bucket.join("a.jpg"), vec![0xfe; 1024]).unwrap();
}

fn units() -> Vec<Unit> {
    vec![
        Unit::new(SourceKind::RemoteFs, "db01"),
        Unit::new(SourceKind::ObjectStore, "media"),
        // Configured but never backed up: nothing under the snapshot.
        Unit::new(SourceKind::FsReplica, "users.jdoe"),
    ]
}

#[test]
fn archive_resume_retrieve_and_prune() {
    if !tar_supports_metadata_flags() {
        return;
    }
    let spool = TempDir::new().unwrap();
    let snapshot_root = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    fake_snapshot_root(snapshot_root.path());

    let packer = packer_for(spool.path());
    let backend = DirArchiver::new(target.path());
    let snapshot = "20260807-030000";

    let report = lifecycle::archive_snapshot(
        &units(),
        snapshot,
        snapshot_root.path(),
        &packer,
        &backend,
        90,
        4,
    )
    .unwrap();
    assert_eq!(report.archived(), 2);
    assert_eq!(report.failed(), 0);
    assert!(report
        .outcomes
        .iter()
        .any(|(u, o)| u.kind == SourceKind::FsReplica && *o == ArchiveOutcome::NoData));

    // Records exist and are self-describing.
    let index = lifecycle::index(&backend).unwrap();
    assert_eq!(index.len(), 2);
    for record in &index {
        assert_eq!(record.snapshot, snapshot);
        assert_eq!(record.compression, "gzip");
        assert_eq!(record.encryption, "none");
        assert!(record.size > 0);
        assert!(record.protected_at(Utc::now()));
    }

    // A rerun resumes: everything is already archived.
    let rerun = lifecycle::archive_snapshot(
        &units(),
        snapshot,
        snapshot_root.path(),
        &packer,
        &backend,
        90,
        4,
    )
    .unwrap();
    assert_eq!(rerun.archived(), 0);
    assert!(rerun
        .outcomes
        .iter()
        .filter(|(u, _)| u.kind != SourceKind::FsReplica)
        .all(|(_, o)| *o == ArchiveOutcome::AlreadyArchived));

    // Retrieve, verify, unpack.
    let dest = TempDir::new().unwrap();
    let (path, info) =
        lifecycle::retrieve(&backend, "remote-fs/db01", snapshot, dest.path(), None).unwrap();
    assert!(path.exists());
    let out_root = TempDir::new().unwrap();
    packer.unpack(&path, &info, out_root.path()).unwrap();
    assert_eq!(
        fs::read(out_root.path().join("remote-fs/db01/etc/hosts")).unwrap(),
        b"127.0.0.1 localhost\n"
    );

    // All sets are inside their protection window: prune deletes nothing.
    let prune = lifecycle::prune_all(&backend, 0, Utc::now(), false).unwrap();
    assert!(prune.deleted.is_empty());
    assert_eq!(prune.still_protected, 2);
    assert_eq!(lifecycle::index(&backend).unwrap().len(), 2);
}

#[test]
fn corrupted_blob_fails_retrieval_verification() {
    if !tar_supports_metadata_flags() {
        return;
    }
    let spool = TempDir::new().unwrap();
    let snapshot_root = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    fake_snapshot_root(snapshot_root.path());

    let packer = packer_for(spool.path());
    let backend = DirArchiver::new(target.path());
    let snapshot = "20260807-030000";
    let record = lifecycle::archive_unit(
        "remote-fs/db01",
        snapshot,
        snapshot_root.path(),
        &packer,
        &backend,
        90,
    )
    .unwrap();

    // Flip a byte in the stored blob.
    let blob_path = target
        .path()
        .join("blobs")
        .join(&record.key);
    let mut blob = fs::read(&blob_path).unwrap();
    blob[0] ^= 0xff;
    fs::write(&blob_path, &blob).unwrap();

    let dest = TempDir::new().unwrap();
    match lifecycle::retrieve(&backend, "remote-fs/db01", snapshot, dest.path(), None) {
        Err(ArchiveError::Verification { .. }) => {}
        other => panic!("expected verification failure, got {other:?}"),
    }
    // The corrupt download is not left behind.
    assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
}

/// Backend wrapper whose uploads always fail.
struct FailingUploads(DirArchiver);

impl ArchiverBackend for FailingUploads {
    fn put_blob(&self, key: &str, _path: &Path) -> Result<(), ArchiveError> {
        Err(ArchiveError::Upload {
            key: key.to_owned(),
            detail: "simulated network failure".into(),
        })
    }

    fn get_blob(&self, key: &str, out: &mut dyn std::io::Write) -> Result<u64, ArchiveError> {
        self.0.get_blob(key, out)
    }

    fn delete_blob(&self, key: &str) -> Result<(), ArchiveError> {
        self.0.delete_blob(key)
    }

    fn put_record(&self, record: &backhaul_archive::ArchiveRecord) -> Result<(), ArchiveError> {
        self.0.put_record(record)
    }

    fn list_records(&self) -> Result<Vec<backhaul_archive::ArchiveRecord>, ArchiveError> {
        self.0.list_records()
    }

    fn delete_record(&self, key: &str) -> Result<(), ArchiveError> {
        self.0.delete_record(key)
    }
}

#[test]
fn failed_upload_leaves_no_record() {
    if !tar_supports_metadata_flags() {
        return;
    }
    let spool = TempDir::new().unwrap();
    let snapshot_root = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    fake_snapshot_root(snapshot_root.path());

    let packer = packer_for(spool.path());
    let backend = FailingUploads(DirArchiver::new(target.path()));
    let snapshot = "20260807-030000";

    let report = lifecycle::archive_snapshot(
        &units(),
        snapshot,
        snapshot_root.path(),
        &packer,
        &backend,
        90,
        2,
    )
    .unwrap();
    assert_eq!(report.failed(), 2);
    // No record was written for either attempt: the next pass retries.
    assert!(lifecycle::index(&backend).unwrap().is_empty());
}
