//! Atomic update primitives for the backup tree.
//!
//! The backup volume is copy-on-write: rewriting a file with identical
//! bytes still allocates new extents in every live snapshot. [`update_file`]
//! and [`update_xattr`] therefore compare before writing and skip the write
//! entirely when nothing changed. When a write is needed it goes to a
//! `*.backhaul-tmp` sibling and is renamed over the target, so no reader
//! ever observes a partially written file.
//!
//! Plugins must ignore `*.backhaul-tmp` files during restores and
//! garbage-collect any left behind by a crashed run.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Suffix of in-flight temporary files.
pub const TMP_SUFFIX: &str = ".backhaul-tmp";

const BLOCK_SIZE: usize = 256 << 10;

/// `<dir>/<name>.backhaul-tmp` — same directory as the target so the final
/// rename stays on one filesystem.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// update_file
// ---------------------------------------------------------------------------

/// Atomically replace `path` with `data`, unless the file already holds
/// exactly `data` — in that case nothing is opened for writing and the call
/// returns `false`.
pub fn update_file(path: &Path, data: &[u8]) -> io::Result<bool> {
    update_file_from(path, data)
}

/// Streaming form of [`update_file`]. The reader is consumed once; the
/// common prefix it shares with the existing file is recovered from the
/// existing file itself, so the reader does not need to be seekable.
pub fn update_file_from<R: Read>(path: &Path, mut new: R) -> io::Result<bool> {
    let mut old = match File::open(path) {
        Ok(f) => Some(f),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    let mut newbuf = vec![0u8; BLOCK_SIZE];
    let mut oldbuf = vec![0u8; BLOCK_SIZE];
    let mut matched: u64 = 0;

    // Find the length of the common prefix. `pending` holds bytes already
    // consumed from the reader that still need to be written out.
    let pending: usize = loop {
        let n = read_full(&mut new, &mut newbuf)?;
        let Some(oldfh) = old.as_mut() else {
            break n;
        };
        if n == 0 {
            let extra = read_full(oldfh, &mut oldbuf[..1])?;
            if extra == 0 {
                // Files are identical; nothing to write.
                return Ok(false);
            }
            break 0;
        }
        let m = read_full(oldfh, &mut oldbuf[..n])?;
        if m == n && oldbuf[..n] == newbuf[..n] {
            matched += n as u64;
            continue;
        }
        break n;
    };

    let tmp = tmp_path(path);
    let result = (|| -> io::Result<()> {
        let mut out = File::create(&tmp)?;
        if matched > 0 {
            // Replay the verified prefix from the old file.
            let mut oldfh = File::open(path)?;
            oldfh.seek(SeekFrom::Start(0))?;
            io::copy(&mut oldfh.take(matched), &mut out)?;
        }
        out.write_all(&newbuf[..pending])?;
        loop {
            let n = read_full(&mut new, &mut newbuf)?;
            if n == 0 {
                break;
            }
            out.write_all(&newbuf[..n])?;
        }
        out.sync_all()?;
        Ok(())
    })();

    match result.and_then(|()| std::fs::rename(&tmp, path)) {
        Ok(()) => Ok(true),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Unconditionally write `path` through a temp file + rename. Used where
/// the caller knows the content is new (e.g. archive retrieval) and wants
/// the all-or-nothing guarantee without the comparison pass.
pub fn write_atomic<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let tmp = tmp_path(path);
    let result = (|| -> io::Result<()> {
        let mut out = File::create(&tmp)?;
        write(&mut out)?;
        out.sync_all()?;
        Ok(())
    })();
    match result.and_then(|()| std::fs::rename(&tmp, path)) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Xattrs
// ---------------------------------------------------------------------------

/// Read one extended attribute; `None` when absent.
pub fn read_xattr(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    xattr::get(path, name)
}

/// Read-before-write xattr update: returns `false` without touching the
/// inode when the attribute already holds `value`.
pub fn update_xattr(path: &Path, name: &str, value: &[u8]) -> io::Result<bool> {
    if let Some(existing) = xattr::get(path, name)? {
        if existing == value {
            return Ok(false);
        }
    }
    xattr::set(path, name, value)?;
    Ok(true)
}

/// Remove an xattr, tolerating its absence.
pub fn remove_xattr(path: &Path, name: &str) -> io::Result<()> {
    if xattr::get(path, name)?.is_none() {
        return Ok(());
    }
    xattr::remove(path, name)
}

// ---------------------------------------------------------------------------
// Sizes
// ---------------------------------------------------------------------------

/// `1.5 MiB`-style rendering for reports and listings.
pub fn humanize_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = size as f64;
    let mut index = 0;
    while value >= 1024.0 && index < UNITS.len() - 1 {
        value /= 1024.0;
        index += 1;
    }
    format!("{value:.1} {}", UNITS[index])
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
    fn creates_new_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        assert!(update_file(&path, b"hello").unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn identical_content_performs_no_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"same bytes").unwrap();

        // Make the file unwritable; an unchanged update must still succeed
        // because it never opens the file for writing.
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&path, perms).unwrap();

        assert!(!update_file(&path, b"same bytes").unwrap());

        let mut perms = fs::metadata(&path).unwrap().permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        fs::set_permissions(&path, perms).unwrap();
    }

    #[test]
    fn changed_byte_mid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        let mut data = vec![7u8; (BLOCK_SIZE * 2) + 30];
        fs::write(&path, &data).unwrap();
        data[BLOCK_SIZE + 5] ^= 0xff;
        assert!(update_file(&path, &data).unwrap());
        assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[test]
    fn truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, vec![1u8; 300_000]).unwrap();
        assert!(update_file(&path, &vec![1u8; 100]).unwrap());
        assert_eq!(fs::metadata(&path).unwrap().len(), 100);
    }

    #[test]
    fn extends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"prefix").unwrap();
        assert!(update_file(&path, b"prefix-and-more").unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"prefix-and-more");
    }

    #[test]
    fn empty_to_content_and_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"").unwrap();
        assert!(update_file(&path, b"data").unwrap());
        assert!(update_file(&path, b"").unwrap());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert!(!update_file(&path, b"").unwrap());
    }

    #[test]
    fn tmp_file_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        update_file(&path, b"payload").unwrap();
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn streaming_reader_matches_slice_form() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        let data = vec![9u8; BLOCK_SIZE + 17];
        assert!(update_file_from(&path, data.as_slice()).unwrap());
        assert!(!update_file_from(&path, data.as_slice()).unwrap());
        assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[test]
    fn write_atomic_replaces_whole_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"old").unwrap();
        write_atomic(&path, |f| f.write_all(b"new")).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn write_atomic_failure_leaves_original() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"original").unwrap();
        let err = write_atomic(&path, |f| {
            f.write_all(b"partial")?;
            Err(io::Error::other("simulated failure"))
        });
        assert!(err.is_err());
        assert_eq!(fs::read(&path).unwrap(), b"original");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn xattr_update_skips_identical_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"x").unwrap();

        // Not every test filesystem supports user xattrs (tmpfs on older
        // kernels); bail out quietly when it doesn't.
        match update_xattr(&path, "user.backhaul.test", b"v1") {
            Ok(changed) => assert!(changed),
            Err(_) => return,
        }
        assert!(!update_xattr(&path, "user.backhaul.test", b"v1").unwrap());
        assert!(update_xattr(&path, "user.backhaul.test", b"v2").unwrap());
        assert_eq!(
            read_xattr(&path, "user.backhaul.test").unwrap().unwrap(),
            b"v2"
        );
        remove_xattr(&path, "user.backhaul.test").unwrap();
        remove_xattr(&path, "user.backhaul.test").unwrap();
        assert!(read_xattr(&path, "user.backhaul.test").unwrap().is_none());
    }

    #[test]
    fn humanize_size_units() {
        assert_eq!(humanize_size(512), "512.0 B");
        assert_eq!(humanize_size(1536), "1.5 KiB");
        assert_eq!(humanize_size(3 << 30), "3.0 GiB");
    }
}
