//! Block-device source: image backup via the block tool's diff stream.
//!
//! One unit per `pool/image`. Backups snapshot the image on the cluster,
//! then stream `<tool> export-diff` output into a local image file:
//!
//! - a **full** pass (first backup, or a drawn full-resync) rebuilds the
//!   image into a temp file and renames it into place;
//! - an **incremental** pass exports the delta from the previously
//!   recorded cluster snapshot into a `.pending` patch file, marks the
//!   pending snapshot in an xattr, applies the patch in place, and only
//!   then rebases the recorded-snapshot xattr. A crash mid-apply leaves
//!   the patch and marker behind; the next run re-applies them (diff
//!   writes are idempotent) before doing anything else.
//!
//! Scrubs re-export the recorded snapshot and compare it byte-for-byte
//! against the stored image without writing; any mismatch is an integrity
//! failure, never silently repaired.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use backhaul_core::config::{BlockDeviceUnit, Config};
use backhaul_core::fsutil;
use backhaul_core::types::{SourceKind, Unit, UnitOutcome};

use crate::cmd::{self, LogFiles};
use crate::error::{io_err, SourceError};
use crate::{Depth, JobContext, Source};

const ATTR_SNAPSHOT: &str = "user.backhaul.block-snapshot";
const ATTR_PENDING: &str = "user.backhaul.pending-snapshot";
const PENDING_EXT: &str = "pending";
const SNAP_PREFIX: &str = "backhaul-";

pub struct BlockDeviceSource {
    units: BTreeMap<String, BlockDeviceUnit>,
    tool: String,
}

impl BlockDeviceSource {
    pub fn new(config: &Config) -> Self {
        BlockDeviceSource {
            units: config.block_device.clone(),
            tool: config.settings.block_tool.clone(),
        }
    }

    fn snap_exec(
        &self,
        pool: &str,
        args: &[&str],
        log_dir: &Path,
        ctx: &JobContext,
    ) -> Result<(), SourceError> {
        let mut cmd = Command::new(&self.tool);
        cmd.args(args).args(["-p", pool]);
        let outcome = cmd::run_logged(cmd, log_dir, ctx.timeout)?;
        if !outcome.status.success() {
            return Err(SourceError::Tool {
                tool: self.tool.clone(),
                detail: format!(
                    "{} exited with {:?}: {}",
                    args.join(" "),
                    outcome.status.code(),
                    outcome.excerpt.unwrap_or_default()
                ),
            });
        }
        Ok(())
    }

    fn create_cluster_snapshot(
        &self,
        pool: &str,
        image: &str,
        log_dir: &Path,
        ctx: &JobContext,
    ) -> Result<String, SourceError> {
        let snap = new_snapshot_name();
        self.snap_exec(
            pool,
            &["snap", "create", "-i", image, "--snap", &snap],
            log_dir,
            ctx,
        )?;
        Ok(snap)
    }

    fn delete_cluster_snapshot(
        &self,
        pool: &str,
        image: &str,
        snap: &str,
        log_dir: &Path,
        ctx: &JobContext,
    ) {
        if let Err(e) = self.snap_exec(
            pool,
            &["snap", "rm", "-i", image, "--snap", snap],
            log_dir,
            ctx,
        ) {
            tracing::warn!(pool, image, snap, "failed to delete cluster snapshot: {e}");
        }
    }

    /// Spawn a streaming `export-diff`, stderr going to the unit's `.err`
    /// log.
    fn spawn_export(
        &self,
        pool: &str,
        image: &str,
        snap: &str,
        basis: Option<&str>,
        log_dir: &Path,
    ) -> Result<(Child, ChildStdout), SourceError> {
        let mut logs = LogFiles::open(log_dir)?;
        let mut cmd = Command::new(&self.tool);
        cmd.args(["export-diff", "--no-progress", "-p", pool, image, "--snap", snap]);
        if let Some(basis) = basis {
            cmd.args(["--from-snap", basis]);
        }
        cmd.arg("-");
        let _ = writeln!(logs.err, "# {}", cmd::render_command(&cmd));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(
                logs.err.try_clone().map_err(|e| io_err(log_dir, e))?,
            ));
        let mut child = cmd.spawn().map_err(|e| SourceError::Tool {
            tool: self.tool.clone(),
            detail: format!("failed to spawn export-diff: {e}"),
        })?;
        let stdout = child.stdout.take().expect("stdout was piped");
        Ok((child, stdout))
    }

    fn wait_export(&self, mut child: Child) -> Result<(), SourceError> {
        let status = child.wait().map_err(|e| SourceError::Tool {
            tool: self.tool.clone(),
            detail: format!("wait failed: {e}"),
        })?;
        if !status.success() {
            return Err(SourceError::Tool {
                tool: self.tool.clone(),
                detail: format!("export-diff exited with {:?}", status.code()),
            });
        }
        Ok(())
    }

    fn full_fetch(
        &self,
        pool: &str,
        image: &str,
        image_path: &Path,
        recorded: Option<String>,
        log_dir: &Path,
        ctx: &JobContext,
    ) -> Result<UnitOutcome, SourceError> {
        let snap = self.create_cluster_snapshot(pool, image, log_dir, ctx)?;
        let tmp = fsutil::tmp_path(image_path);

        let result = (|| -> Result<(), SourceError> {
            let (child, mut stdout) = self.spawn_export(pool, image, &snap, None, log_dir)?;
            let mut sink = diff::FileSink::create(&tmp)?;
            diff::apply_diff(&mut stdout, &mut sink)?;
            sink.finish()?;
            self.wait_export(child)?;
            std::fs::rename(&tmp, image_path).map_err(|e| io_err(image_path, e))?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            self.delete_cluster_snapshot(pool, image, &snap, log_dir, ctx);
            return Err(e);
        }

        if let Some(old) = recorded {
            self.delete_cluster_snapshot(pool, image, &old, log_dir, ctx);
        }
        fsutil::update_xattr(image_path, ATTR_SNAPSHOT, snap.as_bytes())
            .map_err(|e| io_err(image_path, e))?;
        fsutil::remove_xattr(image_path, ATTR_PENDING).map_err(|e| io_err(image_path, e))?;
        Ok(UnitOutcome::Success { changed: true })
    }

    fn incremental_fetch(
        &self,
        pool: &str,
        image: &str,
        image_path: &Path,
        recorded: &str,
        log_dir: &Path,
        ctx: &JobContext,
    ) -> Result<UnitOutcome, SourceError> {
        let pending_path = pending_path(image_path);
        let snap = self.create_cluster_snapshot(pool, image, log_dir, ctx)?;

        let exported = (|| -> Result<(), SourceError> {
            let (child, mut stdout) =
                self.spawn_export(pool, image, &snap, Some(recorded), log_dir)?;
            fsutil::write_atomic(&pending_path, |out| {
                std::io::copy(&mut stdout, out).map(|_| ())
            })
            .map_err(|e| io_err(&pending_path, e))?;
            self.wait_export(child)
        })();

        if let Err(e) = exported {
            let _ = std::fs::remove_file(&pending_path);
            self.delete_cluster_snapshot(pool, image, &snap, log_dir, ctx);
            return Err(e);
        }

        fsutil::update_xattr(image_path, ATTR_PENDING, snap.as_bytes())
            .map_err(|e| io_err(image_path, e))?;
        let summary = self.apply_pending(pool, image, image_path, log_dir, ctx)?;
        Ok(UnitOutcome::Success {
            changed: summary.bytes_changed > 0,
        })
    }

    /// Apply an exported-but-unapplied patch and rebase the recorded
    /// snapshot. Idempotent; also invoked at the start of a run to finish
    /// an interrupted previous one.
    fn apply_pending(
        &self,
        pool: &str,
        image: &str,
        image_path: &Path,
        log_dir: &Path,
        ctx: &JobContext,
    ) -> Result<diff::DiffSummary, SourceError> {
        let pending_snap = fsutil::read_xattr(image_path, ATTR_PENDING)
            .map_err(|e| io_err(image_path, e))?
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .ok_or_else(|| SourceError::Diff {
                detail: "no pending snapshot recorded".into(),
            })?;
        let old_snap = fsutil::read_xattr(image_path, ATTR_SNAPSHOT)
            .map_err(|e| io_err(image_path, e))?
            .map(|v| String::from_utf8_lossy(&v).into_owned());

        let pending = pending_path(image_path);
        let mut input = File::open(&pending).map_err(|e| io_err(&pending, e))?;
        let mut sink = diff::FileSink::open(image_path)?;
        let summary = diff::apply_diff(&mut input, &mut sink)?;
        sink.finish()?;

        if let Some(old) = old_snap {
            self.delete_cluster_snapshot(pool, image, &old, log_dir, ctx);
        }
        fsutil::update_xattr(image_path, ATTR_SNAPSHOT, pending_snap.as_bytes())
            .map_err(|e| io_err(image_path, e))?;
        fsutil::remove_xattr(image_path, ATTR_PENDING).map_err(|e| io_err(image_path, e))?;
        std::fs::remove_file(&pending).map_err(|e| io_err(&pending, e))?;
        Ok(summary)
    }
}

impl Source for BlockDeviceSource {
    fn kind(&self) -> SourceKind {
        SourceKind::BlockDevice
    }

    fn list_units(&self) -> Vec<Unit> {
        self.units
            .keys()
            .map(|name| Unit::new(SourceKind::BlockDevice, name.as_str()))
            .collect()
    }

    fn backup(
        &self,
        unit: &Unit,
        ctx: &JobContext,
        depth: Depth,
    ) -> Result<UnitOutcome, SourceError> {
        let (pool, image) = split_unit(&unit.name.0)?;
        let unit_dir = ctx.unit_dir(unit);
        std::fs::create_dir_all(&unit_dir).map_err(|e| io_err(&unit_dir, e))?;
        let image_path = unit_dir.join(format!("{image}.img"));
        let log_dir = ctx.unit_log_dir(unit);

        // Finish an interrupted apply before anything else.
        if image_path.exists()
            && fsutil::read_xattr(&image_path, ATTR_PENDING)
                .map_err(|e| io_err(&image_path, e))?
                .is_some()
            && pending_path(&image_path).exists()
        {
            self.apply_pending(pool, image, &image_path, &log_dir, ctx)?;
        }

        let recorded = if image_path.exists() {
            fsutil::read_xattr(&image_path, ATTR_SNAPSHOT)
                .map_err(|e| io_err(&image_path, e))?
                .map(|v| String::from_utf8_lossy(&v).into_owned())
        } else {
            None
        };

        if depth == Depth::Incremental {
            if let Some(basis) = recorded.clone() {
                return self.incremental_fetch(pool, image, &image_path, &basis, &log_dir, ctx);
            }
        }
        self.full_fetch(pool, image, &image_path, recorded, &log_dir, ctx)
    }

    fn scrub(&self, unit: &Unit, ctx: &JobContext) -> Result<UnitOutcome, SourceError> {
        let (pool, image) = split_unit(&unit.name.0)?;
        let image_path = ctx.unit_dir(unit).join(format!("{image}.img"));
        let log_dir = ctx.unit_log_dir(unit);

        let Some(recorded) = fsutil::read_xattr(&image_path, ATTR_SNAPSHOT)
            .map_err(|e| io_err(&image_path, e))?
            .map(|v| String::from_utf8_lossy(&v).into_owned())
        else {
            return Ok(UnitOutcome::TransferFailed {
                reason: "image has no recorded snapshot to scrub against".into(),
            });
        };

        let (child, mut stdout) = self.spawn_export(pool, image, &recorded, None, &log_dir)?;
        let mut sink = diff::ComparingSink::open(&image_path)?;
        let verdict = diff::apply_diff(&mut stdout, &mut sink);
        // Close the pipe before waiting: an aborted comparison must not
        // leave the exporter blocked on a full pipe.
        drop(stdout);
        let wait = self.wait_export(child);

        match verdict {
            Ok(_) => {
                wait?;
                Ok(UnitOutcome::Success { changed: false })
            }
            Err(SourceError::Integrity { detail }) => Ok(UnitOutcome::ScrubFailed {
                reason: format!("{}: {detail}", unit.name),
            }),
            Err(e) => Err(e),
        }
    }
}

fn split_unit(name: &str) -> Result<(&str, &str), SourceError> {
    name.split_once('/').ok_or_else(|| SourceError::UnknownUnit {
        name: name.to_owned(),
    })
}

fn pending_path(image_path: &Path) -> PathBuf {
    let mut p = image_path.as_os_str().to_os_string();
    p.push(".");
    p.push(PENDING_EXT);
    PathBuf::from(p)
}

fn new_snapshot_name() -> String {
    format!(
        "{SNAP_PREFIX}{}-{}",
        chrono::Local::now().format("%Y%m%d%H%M%S"),
        std::process::id()
    )
}

// ---------------------------------------------------------------------------
// Diff stream codec
// ---------------------------------------------------------------------------

/// The block tool's diff-stream format: a magic line, then tagged records
/// (`f`/`t` snapshot names, `s` image size, `w` data extent, `z` zero
/// extent, `e` end).
pub(crate) mod diff {
    use super::*;

    pub const DIFF_MAGIC: &[u8] = b"rbd diff v1\n";
    const BLOCK_SIZE: usize = 256 << 10;

    #[derive(Debug, Default)]
    pub struct DiffSummary {
        pub image_size: u64,
        pub bytes_changed: u64,
        pub from_snap: Option<String>,
        pub to_snap: Option<String>,
    }

    pub trait DiffSink {
        fn set_size(&mut self, size: u64) -> Result<(), SourceError>;
        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), SourceError>;
        fn zero_at(&mut self, offset: u64, length: u64) -> Result<(), SourceError>;
    }

    /// Applies a diff stream to an image file.
    pub struct FileSink {
        file: File,
        path: PathBuf,
    }

    impl FileSink {
        /// Fresh image file (full fetch into a temp path).
        pub fn create(path: &Path) -> Result<FileSink, SourceError> {
            let file = File::create(path).map_err(|e| io_err(path, e))?;
            Ok(FileSink {
                file,
                path: path.to_path_buf(),
            })
        }

        /// Existing image, opened for in-place patching.
        pub fn open(path: &Path) -> Result<FileSink, SourceError> {
            let file = File::options()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| io_err(path, e))?;
            Ok(FileSink {
                file,
                path: path.to_path_buf(),
            })
        }

        pub fn finish(self) -> Result<(), SourceError> {
            self.file.sync_all().map_err(|e| io_err(&self.path, e))
        }
    }

    impl DiffSink for FileSink {
        fn set_size(&mut self, size: u64) -> Result<(), SourceError> {
            self.file.set_len(size).map_err(|e| io_err(&self.path, e))
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), SourceError> {
            self.file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| self.file.write_all(data))
                .map_err(|e| io_err(&self.path, e))
        }

        fn zero_at(&mut self, offset: u64, length: u64) -> Result<(), SourceError> {
            let zeros = vec![0u8; BLOCK_SIZE.min(length as usize).max(1)];
            self.file
                .seek(SeekFrom::Start(offset))
                .map_err(|e| io_err(&self.path, e))?;
            let mut remaining = length;
            while remaining > 0 {
                let n = (remaining as usize).min(zeros.len());
                self.file
                    .write_all(&zeros[..n])
                    .map_err(|e| io_err(&self.path, e))?;
                remaining -= n as u64;
            }
            Ok(())
        }
    }

    /// Verifies a diff stream against an existing image without writing.
    /// Any mismatch is an error; the scrubber never repairs in place.
    pub struct ComparingSink {
        file: File,
        path: PathBuf,
    }

    impl ComparingSink {
        pub fn open(path: &Path) -> Result<ComparingSink, SourceError> {
            let file = File::open(path).map_err(|e| io_err(path, e))?;
            Ok(ComparingSink {
                file,
                path: path.to_path_buf(),
            })
        }

        fn compare_at(&mut self, offset: u64, expected: &[u8]) -> Result<(), SourceError> {
            self.file
                .seek(SeekFrom::Start(offset))
                .map_err(|e| io_err(&self.path, e))?;
            let mut actual = vec![0u8; expected.len()];
            let mut filled = 0;
            while filled < actual.len() {
                let n = self
                    .file
                    .read(&mut actual[filled..])
                    .map_err(|e| io_err(&self.path, e))?;
                if n == 0 {
                    return Err(SourceError::Integrity {
                        detail: format!("unexpected EOF at offset {}", offset + filled as u64),
                    });
                }
                filled += n;
            }
            if actual != expected {
                return Err(SourceError::Integrity {
                    detail: format!("data mismatch at offset {offset}"),
                });
            }
            Ok(())
        }
    }

    impl DiffSink for ComparingSink {
        fn set_size(&mut self, size: u64) -> Result<(), SourceError> {
            let len = self
                .file
                .metadata()
                .map_err(|e| io_err(&self.path, e))?
                .len();
            if len != size {
                return Err(SourceError::Integrity {
                    detail: format!("expected image length {size}, found {len}"),
                });
            }
            Ok(())
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), SourceError> {
            self.compare_at(offset, data)
        }

        fn zero_at(&mut self, offset: u64, length: u64) -> Result<(), SourceError> {
            let zeros = vec![0u8; BLOCK_SIZE.min(length as usize).max(1)];
            let mut remaining = length;
            let mut at = offset;
            while remaining > 0 {
                let n = (remaining as usize).min(zeros.len());
                self.compare_at(at, &zeros[..n])?;
                at += n as u64;
                remaining -= n as u64;
            }
            Ok(())
        }
    }

    fn bad(detail: impl Into<String>) -> SourceError {
        SourceError::Diff {
            detail: detail.into(),
        }
    }

    fn read_exact<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<(), SourceError> {
        input
            .read_exact(buf)
            .map_err(|e| bad(format!("truncated stream: {e}")))
    }

    fn read_u32<R: Read>(input: &mut R) -> Result<u32, SourceError> {
        let mut buf = [0u8; 4];
        read_exact(input, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64<R: Read>(input: &mut R) -> Result<u64, SourceError> {
        let mut buf = [0u8; 8];
        read_exact(input, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_name<R: Read>(input: &mut R) -> Result<String, SourceError> {
        let len = read_u32(input)? as usize;
        let mut buf = vec![0u8; len];
        read_exact(input, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Parse one diff stream, feeding extents into `sink`.
    pub fn apply_diff<R: Read>(
        input: &mut R,
        sink: &mut dyn DiffSink,
    ) -> Result<DiffSummary, SourceError> {
        let mut magic = [0u8; DIFF_MAGIC.len()];
        read_exact(input, &mut magic)?;
        if magic != *DIFF_MAGIC {
            return Err(bad("missing diff magic string"));
        }

        let mut summary = DiffSummary::default();
        let mut buf = vec![0u8; BLOCK_SIZE];
        loop {
            let mut tag = [0u8; 1];
            read_exact(input, &mut tag)?;
            match tag[0] {
                b'f' => summary.from_snap = Some(read_name(input)?),
                b't' => summary.to_snap = Some(read_name(input)?),
                b's' => {
                    summary.image_size = read_u64(input)?;
                    sink.set_size(summary.image_size)?;
                }
                b'w' => {
                    let offset = read_u64(input)?;
                    let length = read_u64(input)?;
                    summary.bytes_changed += length;
                    let mut at = offset;
                    let mut remaining = length;
                    while remaining > 0 {
                        let n = (remaining as usize).min(buf.len());
                        read_exact(input, &mut buf[..n])?;
                        sink.write_at(at, &buf[..n])?;
                        at += n as u64;
                        remaining -= n as u64;
                    }
                }
                b'z' => {
                    let offset = read_u64(input)?;
                    let length = read_u64(input)?;
                    summary.bytes_changed += length;
                    sink.zero_at(offset, length)?;
                }
                b'e' => {
                    let mut extra = [0u8; 1];
                    match input.read(&mut extra) {
                        Ok(0) => break,
                        Ok(_) => return Err(bad("trailing data after end record")),
                        Err(e) => return Err(bad(format!("read after end record: {e}"))),
                    }
                }
                other => return Err(bad(format!("unknown record type {:#x}", other))),
            }
        }
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::diff::{apply_diff, ComparingSink, DiffSummary, FileSink, DIFF_MAGIC};
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Build a synthetic diff stream in memory.
    struct DiffBuilder(Vec<u8>);

    impl DiffBuilder {
        fn new() -> Self {
            DiffBuilder(DIFF_MAGIC.to_vec())
        }

        fn snap(mut self, tag: u8, name: &str) -> Self {
            self.0.push(tag);
            self.0.extend((name.len() as u32).to_le_bytes());
            self.0.extend(name.as_bytes());
            self
        }

        fn size(mut self, size: u64) -> Self {
            self.0.push(b's');
            self.0.extend(size.to_le_bytes());
            self
        }

        fn write(mut self, offset: u64, data: &[u8]) -> Self {
            self.0.push(b'w');
            self.0.extend(offset.to_le_bytes());
            self.0.extend((data.len() as u64).to_le_bytes());
            self.0.extend(data);
            self
        }

        fn zero(mut self, offset: u64, length: u64) -> Self {
            self.0.push(b'z');
            self.0.extend(offset.to_le_bytes());
            self.0.extend(length.to_le_bytes());
            self
        }

        fn end(mut self) -> Vec<u8> {
            self.0.push(b'e');
            self.0
        }
    }

    fn apply_to_file(path: &Path, stream: &[u8]) -> DiffSummary {
        let mut sink = if path.exists() {
            FileSink::open(path).unwrap()
        } else {
            FileSink::create(path).unwrap()
        };
        let summary = apply_diff(&mut &stream[..], &mut sink).unwrap();
        sink.finish().unwrap();
        summary
    }

    #[test]
    fn full_stream_builds_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img");
        let stream = DiffBuilder::new()
            .snap(b't', "snap-1")
            .size(16)
            .write(0, b"hello")
            .write(8, b"world")
            .end();
        let summary = apply_to_file(&path, &stream);
        assert_eq!(summary.image_size, 16);
        assert_eq!(summary.bytes_changed, 10);
        assert_eq!(summary.to_snap.as_deref(), Some("snap-1"));

        let data = fs::read(&path).unwrap();
        assert_eq!(&data[0..5], b"hello");
        assert_eq!(&data[5..8], &[0, 0, 0]);
        assert_eq!(&data[8..13], b"world");
        assert_eq!(data.len(), 16);
    }

    #[test]
    fn incremental_stream_patches_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img");
        fs::write(&path, vec![0xaa; 32]).unwrap();

        let stream = DiffBuilder::new()
            .snap(b'f', "snap-1")
            .snap(b't', "snap-2")
            .size(32)
            .write(4, b"XY")
            .zero(16, 8)
            .end();
        let summary = apply_to_file(&path, &stream);
        assert_eq!(summary.from_snap.as_deref(), Some("snap-1"));
        assert_eq!(summary.bytes_changed, 10);

        let data = fs::read(&path).unwrap();
        assert_eq!(&data[4..6], b"XY");
        assert_eq!(&data[16..24], &[0u8; 8]);
        assert_eq!(data[3], 0xaa);
        assert_eq!(data[24], 0xaa);
    }

    #[test]
    fn truncating_size_record_shrinks_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img");
        fs::write(&path, vec![1u8; 64]).unwrap();
        let stream = DiffBuilder::new().size(10).end();
        apply_to_file(&path, &stream);
        assert_eq!(fs::metadata(&path).unwrap().len(), 10);
    }

    #[test]
    fn comparing_sink_accepts_identical_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img");
        let stream = DiffBuilder::new()
            .size(8)
            .write(0, b"abcd")
            .zero(4, 4)
            .end();
        apply_to_file(&path, &stream);

        let mut sink = ComparingSink::open(&path).unwrap();
        apply_diff(&mut &stream[..], &mut sink).expect("identical image should verify");
    }

    #[test]
    fn comparing_sink_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img");
        let stream = DiffBuilder::new().size(8).write(0, b"abcdefgh").end();
        apply_to_file(&path, &stream);

        // Flip one stored byte behind the scrubber's back.
        let mut data = fs::read(&path).unwrap();
        data[3] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let mut sink = ComparingSink::open(&path).unwrap();
        match apply_diff(&mut &stream[..], &mut sink) {
            Err(SourceError::Integrity { detail }) => {
                assert!(detail.contains("mismatch"), "{detail}")
            }
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[test]
    fn comparing_sink_detects_length_drift() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img");
        fs::write(&path, vec![0u8; 9]).unwrap();
        let stream = DiffBuilder::new().size(8).end();
        let mut sink = ComparingSink::open(&path).unwrap();
        assert!(matches!(
            apply_diff(&mut &stream[..], &mut sink),
            Err(SourceError::Integrity { .. })
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img");
        let mut sink = FileSink::create(&path).unwrap();
        let stream = b"not a diff stream";
        assert!(matches!(
            apply_diff(&mut &stream[..], &mut sink),
            Err(SourceError::Diff { .. })
        ));
    }

    #[test]
    fn unknown_record_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img");
        let mut stream = DIFF_MAGIC.to_vec();
        stream.push(b'q');
        let mut sink = FileSink::create(&path).unwrap();
        assert!(matches!(
            apply_diff(&mut &stream[..], &mut sink),
            Err(SourceError::Diff { .. })
        ));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img");
        let mut stream = DiffBuilder::new().size(4).end();
        stream.push(b'x');
        let mut sink = FileSink::create(&path).unwrap();
        assert!(matches!(
            apply_diff(&mut &stream[..], &mut sink),
            Err(SourceError::Diff { .. })
        ));
    }

    #[test]
    fn split_unit_requires_pool() {
        assert!(split_unit("vms/web01").is_ok());
        assert!(split_unit("web01").is_err());
    }

    #[test]
    fn pending_path_is_sibling() {
        assert_eq!(
            pending_path(Path::new("/b/x.img")),
            PathBuf::from("/b/x.img.pending")
        );
    }
}
