#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `fileio` provides the file-system plumbing shared by the SCR workspace:
//! buffered file copies with optional CRC32 computation, reads and writes
//! addressed into the logical concatenation of several files (used by the
//! XOR codec), atomic whole-file replacement, whole-file advisory locks,
//! and a few small path helpers.
//!
//! # Invariants
//!
//! - [`atomic_write`] never leaves a partially written file visible at the
//!   destination path: data lands in a temporary file in the same
//!   directory, is fsynced, and is renamed over the target.
//! - [`FileLock`] holds an exclusive advisory lock for its whole lifetime;
//!   dropping the guard releases the lock.
//! - Padded reads return zero bytes past the logical end; padded writes
//!   silently drop bytes past the logical end. Both match the behavior the
//!   redundancy encode relies on for ranks with short or empty files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

mod error;
mod lock;
mod pad;

pub use error::FileIoError;
pub use lock::FileLock;
pub use pad::{read_pad_n, write_pad_n};

/// Default buffer size for file-to-file copies (1 MiB).
pub const FILE_BUF_SIZE: usize = 1024 * 1024;

/// Returns the size of the file at `path` in bytes.
pub fn file_size(path: &Path) -> Result<u64, FileIoError> {
    let meta = fs::metadata(path).map_err(|source| FileIoError::io("stat", path, source))?;
    Ok(meta.len())
}

/// Computes the CRC32 of the file at `path`.
pub fn crc32_file(path: &Path) -> Result<u32, FileIoError> {
    let mut file = File::open(path).map_err(|source| FileIoError::io("open", path, source))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; FILE_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| FileIoError::io("read", path, source))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Copies `src` into `dst_dir`, preserving the basename.
///
/// Returns the destination path, the number of bytes copied, and the CRC32
/// of the data when `with_crc` is set. The destination is fsynced before
/// returning so a crash cannot leave a short copy that looks complete.
pub fn copy_to(
    src: &Path,
    dst_dir: &Path,
    buf_size: usize,
    with_crc: bool,
) -> Result<(PathBuf, u64, Option<u32>), FileIoError> {
    let name = src
        .file_name()
        .ok_or_else(|| FileIoError::invalid_path(src))?;
    let dst = dst_dir.join(name);

    let mut reader = File::open(src).map_err(|source| FileIoError::io("open", src, source))?;
    let mut writer = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&dst)
        .map_err(|source| FileIoError::io("create", &dst, source))?;

    let mut hasher = with_crc.then(crc32fast::Hasher::new);
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|source| FileIoError::io("read", src, source))?;
        if n == 0 {
            break;
        }
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        writer
            .write_all(&buf[..n])
            .map_err(|source| FileIoError::io("write", &dst, source))?;
        total += n as u64;
    }
    writer
        .sync_all()
        .map_err(|source| FileIoError::io("fsync", &dst, source))?;

    Ok((dst, total, hasher.map(crc32fast::Hasher::finalize)))
}

/// Writes `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename over the destination.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), FileIoError> {
    let dir = path.parent().ok_or_else(|| FileIoError::invalid_path(path))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|source| FileIoError::io("create temp file", dir, source))?;
    tmp.write_all(bytes)
        .map_err(|source| FileIoError::io("write", tmp.path(), source))?;
    tmp.as_file()
        .sync_all()
        .map_err(|source| FileIoError::io("fsync", tmp.path(), source))?;
    tmp.persist(path)
        .map_err(|err| FileIoError::io("rename", path, err.error))?;
    Ok(())
}

/// Creates `dir` and any missing parents.
pub fn mkdir_p(dir: &Path) -> Result<(), FileIoError> {
    fs::create_dir_all(dir).map_err(|source| FileIoError::io("mkdir", dir, source))
}

/// Truncates the file at `path` to `len` bytes.
pub fn truncate(path: &Path, len: u64) -> Result<(), FileIoError> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|source| FileIoError::io("open", path, source))?;
    file.set_len(len)
        .map_err(|source| FileIoError::io("truncate", path, source))
}

/// Reads exactly `buf.len()` bytes at `offset`, zero-filling past EOF.
pub fn read_at_padded(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf[filled..].fill(0);
    Ok(())
}

/// Returns this node's hostname.
pub fn hostname() -> String {
    rustix::system::uname()
        .nodename()
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_preserves_bytes_and_crc() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("input.dat");
        fs::write(&src, b"checkpoint payload").unwrap();

        let dst_dir = dir.path().join("out");
        mkdir_p(&dst_dir).unwrap();
        let (dst, bytes, crc) = copy_to(&src, &dst_dir, 4, true).unwrap();

        assert_eq!(bytes, 18);
        assert_eq!(fs::read(&dst).unwrap(), b"checkpoint payload");
        assert_eq!(crc.unwrap(), crc32_file(&src).unwrap());
    }

    #[test]
    fn atomic_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.scr");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn padded_read_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.dat");
        fs::write(&path, b"abc").unwrap();

        let mut file = File::open(&path).unwrap();
        let mut buf = [0xffu8; 6];
        read_at_padded(&mut file, 1, &mut buf).unwrap();
        assert_eq!(&buf, b"bc\0\0\0\0");
    }
}
