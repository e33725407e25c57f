//! Remote-filesystem source: host backup over rsync.
//!
//! One unit per configured host. rsync owns the heavy lifting — delta
//! transfer, deletion propagation, xattr/ACL preservation — and commits
//! each file via its own tmp+rename, so the subtree is consistent on
//! every exit path. A scrub pass adds `--checksum`: rsync re-reads both
//! sides and transparently repairs any stored file whose content drifted,
//! so this variant reports drift as a corrected change rather than a
//! scrub failure.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use backhaul_core::config::{Config, RemoteFsUnit};
use backhaul_core::types::{SourceKind, Unit, UnitOutcome};

use crate::cmd::{self, CmdStatus};
use crate::error::SourceError;
use crate::{Depth, JobContext, Source};

/// rsync exit code 24: some source files vanished mid-transfer. Routine on
/// live hosts.
const RSYNC_VANISHED: i32 = 24;

const SSH_OPTS: &str = "ssh -o BatchMode=yes -o StrictHostKeyChecking=no";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    Incremental,
    Full,
    Scrub,
}

pub struct RemoteFsSource {
    units: BTreeMap<String, RemoteFsUnit>,
    rsync: String,
    global_exclude: Vec<String>,
}

impl RemoteFsSource {
    pub fn new(config: &Config) -> Self {
        RemoteFsSource {
            units: config.remote_fs.clone(),
            rsync: config
                .settings
                .rsync_local_binary
                .clone()
                .unwrap_or_else(|| "rsync".into()),
            global_exclude: config.settings.rsync_exclude.clone(),
        }
    }

    fn unit_config(&self, unit: &Unit) -> Result<&RemoteFsUnit, SourceError> {
        self.units
            .get(&unit.name.0)
            .ok_or_else(|| SourceError::UnknownUnit {
                name: unit.name.0.clone(),
            })
    }

    fn run(
        &self,
        unit: &Unit,
        ctx: &JobContext,
        mode: TransferMode,
    ) -> Result<UnitOutcome, SourceError> {
        let info = self.unit_config(unit)?;
        let host = &unit.name.0;
        let target = ctx.unit_dir(unit);
        std::fs::create_dir_all(&target).map_err(|e| crate::error::io_err(&target, e))?;
        let log_dir = ctx.unit_log_dir(unit);

        if let Some(pre) = &info.pre {
            let outcome = cmd::run_logged(ssh_command(host, pre), &log_dir, ctx.timeout)?;
            if !outcome.status.success() {
                return Ok(failure_outcome("pre hook", &outcome.status, outcome.excerpt));
            }
        }

        let args = backup_args(host, &info.mounts, &self.excludes(info), &target, mode);
        let mut rsync = Command::new(&self.rsync);
        rsync.args(&args);
        let outcome = cmd::run_logged(rsync, &log_dir, ctx.timeout)?;
        match outcome.status {
            CmdStatus::Success | CmdStatus::Failed {
                code: RSYNC_VANISHED,
            } => {}
            ref status => return Ok(failure_outcome("rsync", status, outcome.excerpt)),
        }

        if let Some(post) = &info.post {
            let outcome = cmd::run_logged(ssh_command(host, post), &log_dir, ctx.timeout)?;
            if !outcome.status.success() {
                return Ok(failure_outcome("post hook", &outcome.status, outcome.excerpt));
            }
        }

        Ok(UnitOutcome::Success { changed: true })
    }

    fn excludes(&self, info: &RemoteFsUnit) -> Vec<String> {
        let mut excludes = self.global_exclude.clone();
        excludes.extend(info.exclude.iter().cloned());
        excludes
    }
}

impl Source for RemoteFsSource {
    fn kind(&self) -> SourceKind {
        SourceKind::RemoteFs
    }

    fn list_units(&self) -> Vec<Unit> {
        let mut units: Vec<Unit> = self
            .units
            .iter()
            .map(|(host, info)| {
                let alias = relroot_alias(host, info);
                Unit::with_relroot(
                    SourceKind::RemoteFs,
                    host.as_str(),
                    Path::new(SourceKind::RemoteFs.label()).join(alias),
                )
            })
            .collect();
        units.sort_by(|a, b| a.relroot.cmp(&b.relroot));
        units
    }

    fn backup(
        &self,
        unit: &Unit,
        ctx: &JobContext,
        depth: Depth,
    ) -> Result<UnitOutcome, SourceError> {
        let mode = match depth {
            Depth::Incremental => TransferMode::Incremental,
            Depth::Full => TransferMode::Full,
        };
        self.run(unit, ctx, mode)
    }

    fn scrub(&self, unit: &Unit, ctx: &JobContext) -> Result<UnitOutcome, SourceError> {
        self.run(unit, ctx, TransferMode::Scrub)
    }
}

/// Subtree name for a host: explicit alias, else the first hostname
/// component.
fn relroot_alias(host: &str, info: &RemoteFsUnit) -> String {
    info.alias
        .clone()
        .unwrap_or_else(|| host.split('.').next().unwrap_or(host).to_string())
}

fn ssh_command(host: &str, command: &str) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.args([
        "-o",
        "BatchMode=yes",
        "-o",
        "StrictHostKeyChecking=no",
        &format!("root@{host}"),
        command,
    ]);
    cmd
}

/// The full rsync argument vector for one host transfer.
fn backup_args(
    host: &str,
    mounts: &[String],
    excludes: &[String],
    target: &Path,
    mode: TransferMode,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-aHRxi",
        "--acls",
        "--xattrs",
        "--fake-super",
        "--delete",
        "--delete-excluded",
        "--numeric-ids",
        "--stats",
        "--partial",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    args.push(format!("--rsh={SSH_OPTS}"));
    match mode {
        TransferMode::Incremental => {}
        TransferMode::Full => args.push("--ignore-times".into()),
        TransferMode::Scrub => args.push("--checksum".into()),
    }
    args.extend(excludes.iter().map(|e| format!("--exclude={e}")));
    for mount in mounts {
        let mount = mount.trim_end_matches('/');
        let mount = if mount.is_empty() { "/" } else { mount };
        args.push(format!("root@{host}:{mount}"));
    }
    args.push(target.to_string_lossy().trim_end_matches('/').to_string());
    args
}

fn failure_outcome(stage: &str, status: &CmdStatus, excerpt: Option<String>) -> UnitOutcome {
    match status {
        CmdStatus::TimedOut { after } => UnitOutcome::TimedOut {
            after_secs: after.as_secs(),
        },
        _ => UnitOutcome::TransferFailed {
            reason: match excerpt {
                Some(e) if !e.is_empty() => format!("{stage}: {e}"),
                _ => format!("{stage} exited with {:?}", status.code()),
            },
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn mounts(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn backup_args_shape() {
        let args = backup_args(
            "db01.example.org",
            &mounts(&["/", "/srv/"]),
            &mounts(&["*.tmp"]),
            Path::new("/backup/remote-fs/db01"),
            TransferMode::Incremental,
        );
        assert_eq!(args[0], "-aHRxi");
        assert!(args.contains(&"--delete".to_string()));
        assert!(args.contains(&"--exclude=*.tmp".to_string()));
        assert!(args.contains(&"root@db01.example.org:/".to_string()));
        assert!(args.contains(&"root@db01.example.org:/srv".to_string()));
        assert_eq!(*args.last().unwrap(), "/backup/remote-fs/db01");
        assert!(!args.contains(&"--checksum".to_string()));
    }

    #[test]
    fn scrub_adds_checksum_full_ignores_times() {
        let scrub = backup_args(
            "h",
            &mounts(&["/"]),
            &[],
            Path::new("/b/h"),
            TransferMode::Scrub,
        );
        assert!(scrub.contains(&"--checksum".to_string()));

        let full = backup_args(
            "h",
            &mounts(&["/"]),
            &[],
            Path::new("/b/h"),
            TransferMode::Full,
        );
        assert!(full.contains(&"--ignore-times".to_string()));
    }

    #[test]
    fn alias_defaults_to_short_hostname() {
        let info = RemoteFsUnit {
            mounts: mounts(&["/"]),
            exclude: vec![],
            alias: None,
            pre: None,
            post: None,
        };
        assert_eq!(relroot_alias("db01.example.org", &info), "db01");

        let aliased = RemoteFsUnit {
            alias: Some("primary".into()),
            ..info
        };
        assert_eq!(relroot_alias("db01.example.org", &aliased), "primary");
    }
}
