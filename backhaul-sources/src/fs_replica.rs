//! Distributed-fs replica source: volume dumps.
//!
//! One unit per replicated volume. The replica server's dump tool streams
//! a volume image to stdout; the stream goes through the atomic update
//! primitive, so a dump identical to the stored one touches nothing on
//! the copy-on-write volume. Incremental dumps ask the tool for changes
//! only where it supports them; the full-resync draw (default ~1/7)
//! periodically forces a complete dump to pick up whatever the
//! incremental format misses.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use backhaul_core::config::{Config, FsReplicaUnit};
use backhaul_core::fsutil;
use backhaul_core::types::{SourceKind, Unit, UnitOutcome};

use crate::cmd::{self, LogFiles};
use crate::digest::{file_sha256, Sha256Reader};
use crate::error::{io_err, SourceError};
use crate::{Depth, JobContext, Source};

const ATTR_SHA256: &str = "user.backhaul.sha256";

pub struct FsReplicaSource {
    units: BTreeMap<String, FsReplicaUnit>,
    tool: String,
}

impl FsReplicaSource {
    pub fn new(config: &Config) -> Self {
        FsReplicaSource {
            units: config.fs_replica.clone(),
            tool: config.settings.replica_tool.clone(),
        }
    }

    fn unit_config(&self, unit: &Unit) -> Result<&FsReplicaUnit, SourceError> {
        self.units
            .get(&unit.name.0)
            .ok_or_else(|| SourceError::UnknownUnit {
                name: unit.name.0.clone(),
            })
    }

    fn dump_args(server: &str, volume: &str, incremental: bool) -> Vec<String> {
        let mut args = vec!["-h".to_string(), server.to_string(), "dump".to_string()];
        if incremental {
            args.push("-i".to_string());
        }
        args.push(volume.to_string());
        args
    }

    /// Stream one dump into the stored file; returns whether it changed.
    fn dump_volume(
        &self,
        unit: &Unit,
        ctx: &JobContext,
        incremental: bool,
    ) -> Result<bool, SourceError> {
        let info = self.unit_config(unit)?;
        let volume = &unit.name.0;
        let unit_dir = ctx.unit_dir(unit);
        std::fs::create_dir_all(&unit_dir).map_err(|e| io_err(&unit_dir, e))?;
        let dump_path = dump_path(&unit_dir, volume);
        let log_dir = ctx.unit_log_dir(unit);

        let mut logs = LogFiles::open(&log_dir)?;
        let mut command = Command::new(&self.tool);
        command.args(Self::dump_args(&info.server, volume, incremental));
        let _ = writeln!(logs.err, "# {}", cmd::render_command(&command));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(
                logs.err.try_clone().map_err(|e| io_err(&log_dir, e))?,
            ));

        let mut child = command.spawn().map_err(|e| SourceError::Tool {
            tool: self.tool.clone(),
            detail: format!("failed to spawn dump: {e}"),
        })?;
        let stdout = child.stdout.take().expect("stdout was piped");

        // Stage the stream first: a dump that dies mid-flight still EOFs
        // its pipe, and a truncated image must never be committed.
        let stage_path = dump_path.with_extension("dump-stage");
        let staged = (|| -> Result<String, SourceError> {
            let mut reader = Sha256Reader::new(stdout);
            let mut stage =
                std::fs::File::create(&stage_path).map_err(|e| io_err(&stage_path, e))?;
            std::io::copy(&mut reader, &mut stage).map_err(|e| io_err(&stage_path, e))?;
            let status = child.wait().map_err(|e| io_err(&log_dir, e))?;
            if !status.success() {
                return Err(SourceError::Tool {
                    tool: self.tool.clone(),
                    detail: format!("dump exited with {:?}", status.code()),
                });
            }
            Ok(reader.digest())
        })();

        let digest = match staged {
            Ok(digest) => digest,
            Err(e) => {
                let _ = std::fs::remove_file(&stage_path);
                return Err(e);
            }
        };

        let stage = std::fs::File::open(&stage_path).map_err(|e| io_err(&stage_path, e))?;
        let changed =
            fsutil::update_file_from(&dump_path, stage).map_err(|e| io_err(&dump_path, e))?;
        let _ = std::fs::remove_file(&stage_path);

        fsutil::update_xattr(&dump_path, ATTR_SHA256, digest.as_bytes())
            .map_err(|e| io_err(&dump_path, e))?;
        Ok(changed)
    }
}

impl Source for FsReplicaSource {
    fn kind(&self) -> SourceKind {
        SourceKind::FsReplica
    }

    fn list_units(&self) -> Vec<Unit> {
        self.units
            .keys()
            .map(|volume| Unit::new(SourceKind::FsReplica, volume.as_str()))
            .collect()
    }

    fn backup(
        &self,
        unit: &Unit,
        ctx: &JobContext,
        depth: Depth,
    ) -> Result<UnitOutcome, SourceError> {
        let dump_exists = dump_path(&ctx.unit_dir(unit), &unit.name.0).exists();
        let incremental = depth == Depth::Incremental && dump_exists;
        let changed = self.dump_volume(unit, ctx, incremental)?;
        Ok(UnitOutcome::Success { changed })
    }

    /// Verify the stored dump against the digest recorded when it was
    /// written, then take a fresh full dump. Local corruption is reported
    /// and left untouched; upstream drift is corrected by the re-dump.
    fn scrub(&self, unit: &Unit, ctx: &JobContext) -> Result<UnitOutcome, SourceError> {
        let dump_path = dump_path(&ctx.unit_dir(unit), &unit.name.0);
        if dump_path.exists() {
            if let Some(recorded) =
                fsutil::read_xattr(&dump_path, ATTR_SHA256).map_err(|e| io_err(&dump_path, e))?
            {
                let current = file_sha256(&dump_path).map_err(|e| io_err(&dump_path, e))?;
                if current.as_bytes() != recorded.as_slice() {
                    return Ok(UnitOutcome::ScrubFailed {
                        reason: format!(
                            "stored dump for {} does not match its recorded digest",
                            unit.name
                        ),
                    });
                }
            }
        }
        let changed = self.dump_volume(unit, ctx, false)?;
        Ok(UnitOutcome::Success { changed })
    }
}

fn dump_path(unit_dir: &Path, volume: &str) -> PathBuf {
    unit_dir.join(format!("{}.dump", volume.replace('/', "-")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_args_shape() {
        assert_eq!(
            FsReplicaSource::dump_args("replica1.example.org", "users.jdoe", false),
            ["-h", "replica1.example.org", "dump", "users.jdoe"]
        );
        assert_eq!(
            FsReplicaSource::dump_args("replica1.example.org", "users.jdoe", true),
            ["-h", "replica1.example.org", "dump", "-i", "users.jdoe"]
        );
    }

    #[test]
    fn dump_path_flattens_slashes() {
        assert_eq!(
            dump_path(Path::new("/b/fs-replica/v"), "vol/sub"),
            PathBuf::from("/b/fs-replica/v/vol-sub.dump")
        );
    }
}
