//! Archive packaging: tar, optional sign-then-encrypt, spooling.
//!
//! One unit's subtree, as seen through a mounted snapshot, becomes one
//! gzip-compressed GNU tar stream preserving sparse files, ACLs, SELinux
//! contexts, and xattrs. When recipients are configured the stream is
//! signed and encrypted by gpg in one pass; the signing key must be
//! usable without interactive secret entry. The result lands in a spool
//! temp file with its SHA-256 computed along the way.
//!
//! Unpacking is the reverse, except an encrypted archive is decrypted to
//! a spool file *completely* before tar sees a single byte: tar must
//! never consume data whose signature has not been verified.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use backhaul_core::config::Settings;

use crate::error::{io_err, ArchiveError};

const BUFLEN: usize = 4 << 20;

/// What was produced: how it was packed and how to verify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub compression: String,
    pub encryption: String,
    pub sha256: String,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Subprocess pipeline
// ---------------------------------------------------------------------------

/// A chain of subprocesses with each stdout feeding the next stdin; the
/// final stdout is handed back for reading.
pub(crate) struct Pipeline {
    children: Vec<(String, Child)>,
}

impl Pipeline {
    pub(crate) fn spawn(commands: Vec<Command>) -> Result<(Pipeline, ChildStdout), ArchiveError> {
        assert!(!commands.is_empty());
        let mut children: Vec<(String, Child)> = Vec::new();
        let mut upstream: Option<ChildStdout> = None;

        for mut command in commands {
            let stage = command.get_program().to_string_lossy().into_owned();
            match upstream.take() {
                Some(out) => command.stdin(Stdio::from(out)),
                None => command.stdin(Stdio::null()),
            };
            command.stdout(Stdio::piped());
            let mut child = command.spawn().map_err(|e| ArchiveError::PipelineFailed {
                stage: format!("{stage}: {e}"),
                code: None,
            })?;
            upstream = Some(child.stdout.take().expect("stdout was piped"));
            children.push((stage, child));
        }

        let out = upstream.expect("at least one stage");
        Ok((Pipeline { children }, out))
    }

    /// Wait for every stage; the first unsuccessful one is the error.
    pub(crate) fn finish(mut self) -> Result<(), ArchiveError> {
        let mut failure = None;
        for (stage, child) in self.children.iter_mut() {
            match child.wait() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    failure.get_or_insert(ArchiveError::PipelineFailed {
                        stage: stage.clone(),
                        code: status.code(),
                    });
                }
                Err(e) => {
                    failure.get_or_insert(ArchiveError::PipelineFailed {
                        stage: format!("{stage}: {e}"),
                        code: None,
                    });
                }
            }
        }
        match failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Packer
// ---------------------------------------------------------------------------

pub struct Packer {
    tar: String,
    gpg: String,
    recipients: Vec<String>,
    signing_key: Option<String>,
    spool: PathBuf,
}

impl Packer {
    pub fn from_settings(settings: &Settings) -> Result<Packer, ArchiveError> {
        Ok(Packer {
            tar: settings.archive_tar_path.clone(),
            gpg: settings.archive_gpg_path.clone(),
            recipients: settings.archive_gpg_recipients.clone(),
            signing_key: settings.archive_gpg_signing_key.clone(),
            spool: settings.archive_spool()?.to_path_buf(),
        })
    }

    pub fn compression(&self) -> &'static str {
        "gzip"
    }

    pub fn encryption(&self) -> &'static str {
        if self.recipients.is_empty() {
            "none"
        } else {
            "gpg"
        }
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool
    }

    fn tar_create_args(snapshot: &str, snapshot_root: &Path, unit_relroot: &str) -> Vec<String> {
        vec![
            "cz".into(),
            "--force-local".into(),
            "--format=gnu".into(),
            "--sparse".into(),
            "--acls".into(),
            "--selinux".into(),
            "--xattrs".into(),
            "-V".into(),
            format!("{snapshot} {unit_relroot}"),
            "-C".into(),
            snapshot_root.to_string_lossy().into_owned(),
            unit_relroot.into(),
        ]
    }

    fn tar_extract_args(out_root: &Path) -> Vec<String> {
        vec![
            "xz".into(),
            "--force-local".into(),
            "--acls".into(),
            "--selinux".into(),
            "--xattrs".into(),
            "-C".into(),
            out_root.to_string_lossy().into_owned(),
        ]
    }

    /// gpg invocation prefix shared by encrypt and decrypt.
    fn gpg_base_args(&self) -> Vec<String> {
        [
            "--batch",
            "--no-tty",
            "--no-options",
            "--personal-cipher-preferences",
            "AES256,AES192,AES",
            "--personal-digest-preferences",
            "SHA256,SHA1",
            "--personal-compress-preferences",
            "none",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn gpg_encrypt_args(&self) -> Vec<String> {
        let mut args = self.gpg_base_args();
        args.push("-se".into());
        if let Some(key) = &self.signing_key {
            args.push("-u".into());
            args.push(key.clone());
        }
        for recipient in &self.recipients {
            args.push("-r".into());
            args.push(recipient.clone());
        }
        args
    }

    /// Package one unit's subtree as of `snapshot` into a spool file.
    pub fn pack(
        &self,
        snapshot: &str,
        snapshot_root: &Path,
        unit_relroot: &str,
    ) -> Result<(NamedTempFile, ArchiveInfo), ArchiveError> {
        let mut commands = Vec::new();
        let mut tar = Command::new(&self.tar);
        tar.args(Self::tar_create_args(snapshot, snapshot_root, unit_relroot));
        commands.push(tar);
        if self.encryption() == "gpg" {
            let mut gpg = Command::new(&self.gpg);
            gpg.args(self.gpg_encrypt_args());
            commands.push(gpg);
        }

        std::fs::create_dir_all(&self.spool).map_err(|e| io_err(&self.spool, e))?;
        let mut spool = NamedTempFile::with_prefix_in("archive-", &self.spool)
            .map_err(|e| io_err(&self.spool, e))?;

        let (pipeline, mut out) = Pipeline::spawn(commands)?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; BUFLEN];
        loop {
            let n = out.read(&mut buf).map_err(|e| io_err(spool.path(), e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            spool
                .write_all(&buf[..n])
                .map_err(|e| io_err(spool.path(), e))?;
            size += n as u64;
        }
        pipeline.finish()?;
        spool.flush().map_err(|e| io_err(spool.path(), e))?;

        let info = ArchiveInfo {
            compression: self.compression().to_string(),
            encryption: self.encryption().to_string(),
            sha256: hex::encode(hasher.finalize()),
            size,
        };
        Ok((spool, info))
    }

    /// Unpack a downloaded archive under `out_root`, honouring the
    /// record's encryption mode.
    pub fn unpack(
        &self,
        archive: &Path,
        info: &ArchiveInfo,
        out_root: &Path,
    ) -> Result<(), ArchiveError> {
        // A compromised archive server must not bypass signature checking
        // by re-uploading plaintext and flipping the metadata to "none".
        if info.encryption != self.encryption() {
            return Err(ArchiveError::EncryptionMismatch {
                record: info.encryption.clone(),
                local: self.encryption().to_string(),
            });
        }

        std::fs::create_dir_all(out_root).map_err(|e| io_err(out_root, e))?;
        let mut input = File::open(archive).map_err(|e| io_err(archive, e))?;

        let mut decrypted;
        let tar_input: &mut File = if info.encryption == "gpg" {
            decrypted = tempfile::tempfile_in(&self.spool).map_err(|e| io_err(&self.spool, e))?;
            let mut gpg = Command::new(&self.gpg);
            gpg.args(self.gpg_base_args())
                .arg("-d")
                .stdin(Stdio::from(
                    input.try_clone().map_err(|e| io_err(archive, e))?,
                ))
                .stdout(Stdio::from(
                    decrypted.try_clone().map_err(|e| io_err(&self.spool, e))?,
                ));
            let status = gpg.status().map_err(|e| ArchiveError::PipelineFailed {
                stage: format!("{}: {e}", self.gpg),
                code: None,
            })?;
            if !status.success() {
                return Err(ArchiveError::PipelineFailed {
                    stage: self.gpg.clone(),
                    code: status.code(),
                });
            }
            decrypted
                .seek(SeekFrom::Start(0))
                .map_err(|e| io_err(&self.spool, e))?;
            &mut decrypted
        } else {
            &mut input
        };

        let mut tar = Command::new(&self.tar);
        tar.args(Self::tar_extract_args(out_root)).stdin(Stdio::from(
            tar_input.try_clone().map_err(|e| io_err(archive, e))?,
        ));
        let status = tar.status().map_err(|e| ArchiveError::PipelineFailed {
            stage: format!("{}: {e}", self.tar),
            code: None,
        })?;
        if !status.success() {
            return Err(ArchiveError::PipelineFailed {
                stage: self.tar.clone(),
                code: status.code(),
            });
        }
        Ok(())
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

    fn test_packer(spool: &Path, recipients: Vec<String>) -> Packer {
        Packer {
            tar: "tar".into(),
            gpg: "gpg2".into(),
            recipients,
            signing_key: Some("backup@example.org".into()),
            spool: spool.to_path_buf(),
        }
    }

    fn have_tool(tool: &str) -> bool {
        Command::new(tool)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn tar_create_args_shape() {
        let args =
            Packer::tar_create_args("20260807-030000", Path::new("/mnt/snap"), "remote-fs/db01");
        assert_eq!(args[0], "cz");
        assert!(args.contains(&"--sparse".to_string()));
        assert!(args.contains(&"--xattrs".to_string()));
        assert!(args.contains(&"20260807-030000 remote-fs/db01".to_string()));
        assert_eq!(*args.last().unwrap(), "remote-fs/db01");
    }

    #[test]
    fn gpg_args_sign_and_encrypt_to_all_recipients() {
        let dir = TempDir::new().unwrap();
        let packer = test_packer(
            dir.path(),
            vec!["alice@example.org".into(), "bob@example.org".into()],
        );
        let args = packer.gpg_encrypt_args();
        assert!(args.contains(&"--batch".to_string()));
        assert!(args.contains(&"-se".to_string()));
        assert!(args.contains(&"backup@example.org".to_string()));
        let recipients = args.iter().filter(|a| *a == "-r").count();
        assert_eq!(recipients, 2);
    }

    #[test]
    fn encryption_mode_follows_recipients() {
        let dir = TempDir::new().unwrap();
        assert_eq!(test_packer(dir.path(), vec![]).encryption(), "none");
        assert_eq!(
            test_packer(dir.path(), vec!["a@example.org".into()]).encryption(),
            "gpg"
        );
    }

    #[test]
    fn unpack_refuses_encryption_mismatch() {
        let dir = TempDir::new().unwrap();
        let packer = test_packer(dir.path(), vec![]);
        let info = ArchiveInfo {
            compression: "gzip".into(),
            encryption: "gpg".into(),
            sha256: String::new(),
            size: 0,
        };
        let archive = dir.path().join("a.tar.gz");
        fs::write(&archive, b"x").unwrap();
        assert!(matches!(
            packer.unpack(&archive, &info, dir.path()),
            Err(ArchiveError::EncryptionMismatch { .. })
        ));
    }

    #[test]
    fn pipeline_chains_stdout_to_stdin() {
        let mut first = Command::new("sh");
        first.args(["-c", "printf 'one\\ntwo\\nthree\\n'"]);
        let mut second = Command::new("grep");
        second.arg("two");

        let (pipeline, mut out) = Pipeline::spawn(vec![first, second]).unwrap();
        let mut collected = String::new();
        out.read_to_string(&mut collected).unwrap();
        pipeline.finish().unwrap();
        assert_eq!(collected, "two\n");
    }

    #[test]
    fn pipeline_reports_failing_stage() {
        let mut fail = Command::new("sh");
        fail.args(["-c", "exit 9"]);
        let (pipeline, mut out) = Pipeline::spawn(vec![fail]).unwrap();
        let mut sink = Vec::new();
        out.read_to_end(&mut sink).unwrap();
        match pipeline.finish() {
            Err(ArchiveError::PipelineFailed { stage, code }) => {
                assert_eq!(stage, "sh");
                assert_eq!(code, Some(9));
            }
            other => panic!("expected pipeline failure, got {other:?}"),
        }
    }

    #[test]
    fn pack_then_unpack_roundtrip_with_real_tar() {
        if !have_tool("tar") {
            return;
        }
        let spool = TempDir::new().unwrap();
        let snapshot_root = TempDir::new().unwrap();
        let unit_dir = snapshot_root.path().join("remote-fs/db01");
        fs::create_dir_all(unit_dir.join("etc")).unwrap();
        fs::write(unit_dir.join("etc/hosts"), b"127.0.0.1 localhost\n").unwrap();

        // Plain tar, no xattr/acl flags — CI tar builds vary.
        let packer = Packer {
            tar: "tar".into(),
            gpg: "gpg2".into(),
            recipients: vec![],
            signing_key: None,
            spool: spool.path().to_path_buf(),
        };
        let mut create = Command::new("tar");
        create.args([
            "cz",
            "-C",
            &snapshot_root.path().to_string_lossy(),
            "remote-fs/db01",
        ]);
        let (pipeline, mut out) = Pipeline::spawn(vec![create]).unwrap();
        let mut packed = Vec::new();
        out.read_to_end(&mut packed).unwrap();
        pipeline.finish().unwrap();
        assert!(!packed.is_empty());

        let archive_path = spool.path().join("set.tar.gz");
        fs::write(&archive_path, &packed).unwrap();
        let info = ArchiveInfo {
            compression: packer.compression().into(),
            encryption: "none".into(),
            sha256: String::new(),
            size: packed.len() as u64,
        };

        let out_root = TempDir::new().unwrap();
        packer.unpack(&archive_path, &info, out_root.path()).unwrap();
        let restored = out_root.path().join("remote-fs/db01/etc/hosts");
        assert_eq!(fs::read(&restored).unwrap(), b"127.0.0.1 localhost\n");
    }
}
