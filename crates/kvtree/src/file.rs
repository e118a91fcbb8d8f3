//! Tree file persistence.
//!
//! Files carry the magic line `SCRTREE 1\n` followed by the packed tree.
//! Plain writes go through the atomic temp-file-and-rename path; shared
//! files (halt, transfer, index) use [`lock_open_read`] /
//! [`write_close_unlock`] so a read-modify-write cycle holds the advisory
//! lock across both halves.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use fileio::FileLock;

use crate::{KvTree, KvTreeError};

const MAGIC: &[u8] = b"SCRTREE 1\n";

fn encode(tree: &KvTree) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MAGIC.len() + tree.pack_size());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&tree.pack());
    bytes
}

fn decode(bytes: &[u8], path: &Path) -> Result<KvTree, KvTreeError> {
    if bytes.is_empty() {
        // a freshly created (e.g. just-locked) file reads as an empty tree
        return Ok(KvTree::new());
    }
    let Some(rest) = bytes.strip_prefix(MAGIC) else {
        let found = bytes
            .iter()
            .take_while(|&&b| b != b'\n')
            .map(|&b| b as char)
            .collect();
        return Err(KvTreeError::VersionMismatch {
            path: path.to_path_buf(),
            found,
        });
    };
    KvTree::unpack(rest)
        .map_err(|_| KvTreeError::corrupt(format!("tree file '{}'", path.display())))
}

impl KvTree {
    /// Writes the tree to `path` atomically (temp file, fsync, rename).
    pub fn write_file(&self, path: &Path) -> Result<(), KvTreeError> {
        fileio::atomic_write(path, &encode(self))?;
        Ok(())
    }

    /// Reads a tree from `path`.
    pub fn read_file(path: &Path) -> Result<Self, KvTreeError> {
        let bytes = fs::read(path)
            .map_err(|source| fileio::FileIoError::Io {
                action: "read",
                path: path.to_path_buf(),
                source,
            })?;
        decode(&bytes, path)
    }

    /// Reads a tree from `path`, treating a missing file as `None`.
    pub fn read_file_if_exists(path: &Path) -> Result<Option<Self>, KvTreeError> {
        match fs::read(path) {
            Ok(bytes) => decode(&bytes, path).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(fileio::FileIoError::Io {
                action: "read",
                path: path.to_path_buf(),
                source,
            }
            .into()),
        }
    }
}

/// Acquires the advisory lock on `path` and reads the tree it holds.
///
/// The caller mutates the tree and finishes the cycle with
/// [`write_close_unlock`] (or drops the lock to abandon the update).
pub fn lock_open_read(path: &Path) -> Result<(FileLock, KvTree), KvTreeError> {
    let mut lock = FileLock::acquire(path)?;
    let bytes = lock.read_all()?;
    let tree = decode(&bytes, path)?;
    Ok((lock, tree))
}

/// Writes `tree` through the held lock and releases it.
pub fn write_close_unlock(mut lock: FileLock, tree: &KvTree) -> Result<(), KvTreeError> {
    lock.write_all(&encode(tree))?;
    Ok(())
}

/// Reads the tree at `path` under the advisory lock.
pub fn read_with_lock(path: &Path) -> Result<KvTree, KvTreeError> {
    let (_lock, tree) = lock_open_read(path)?;
    Ok(tree)
}

/// Replaces the tree at `path` under the advisory lock.
pub fn write_with_lock(path: &Path, tree: &KvTree) -> Result<(), KvTreeError> {
    let mut lock = FileLock::acquire(path)?;
    lock.write_all(&encode(tree))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.scr");

        let mut tree = KvTree::new();
        tree.set_u64("VERSION", 1);
        tree.set_kv("CURRENT", "scr.dataset.3");
        tree.write_file(&path).unwrap();

        assert_eq!(KvTree::read_file(&path).unwrap(), tree);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.scr");
        assert!(KvTree::read_file_if_exists(&path).unwrap().is_none());
        assert!(KvTree::read_file(&path).is_err());
    }

    #[test]
    fn bad_magic_is_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weird.scr");
        fs::write(&path, b"SCRTREE 9\nxxxx").unwrap();
        match KvTree::read_file(&path) {
            Err(KvTreeError::VersionMismatch { found, .. }) => assert_eq!(found, "SCRTREE 9"),
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn locked_read_modify_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.scr");

        let (lock, mut tree) = lock_open_read(&path).unwrap();
        assert!(tree.is_empty());
        tree.set_str("COMMAND", "RUN");
        write_close_unlock(lock, &tree).unwrap();

        let tree = read_with_lock(&path).unwrap();
        assert_eq!(tree.get_str("COMMAND"), Some("RUN"));
    }
}
