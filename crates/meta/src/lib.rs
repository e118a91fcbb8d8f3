#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `meta` defines the per-file metadata record SCR keeps for every file in
//! cache, and its on-disk form: a tree-store sidecar at `<file>.scr` next
//! to the payload. Completion is recorded by writing the sidecar and
//! revoked by unlinking it, so a missing sidecar always means "incomplete"
//! — a crash between creating a file and completing it needs no cleanup
//! pass to be detected.
//!
//! # Invariants
//!
//! - `complete == true` in a sidecar implies the recorded size matched the
//!   payload size when the sidecar was written.
//! - An absent CRC is "never computed", which is distinct from a CRC of
//!   zero.

use std::path::{Path, PathBuf};

use kvtree::KvTree;
use thiserror::Error;

/// Suffix appended to a payload path to name its sidecar.
pub const SIDECAR_SUFFIX: &str = ".scr";

/// What kind of payload a cache file holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// Application checkpoint data.
    Full,
    /// A parity chunk produced by the XOR codec.
    XorChunk,
}

impl FileKind {
    fn as_key(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::XorChunk => "XOR",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        match key {
            "FULL" => Some(Self::Full),
            "XOR" => Some(Self::XorChunk),
            _ => None,
        }
    }
}

/// Error raised by metadata operations.
#[derive(Debug, Error)]
pub enum MetaError {
    /// Underlying file failure.
    #[error(transparent)]
    Io(#[from] fileio::FileIoError),

    /// Sidecar could not be parsed as a tree.
    #[error(transparent)]
    Tree(#[from] kvtree::KvTreeError),

    /// No sidecar exists for the file, i.e. the file is incomplete.
    #[error("no metadata recorded for '{path}'")]
    Missing {
        /// Payload path that has no sidecar.
        path: PathBuf,
    },

    /// Sidecar exists but lacks required fields.
    #[error("malformed metadata for '{path}'")]
    Malformed {
        /// Payload path whose sidecar is bad.
        path: PathBuf,
    },
}

/// Metadata for one file in cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMeta {
    /// Basename of the file.
    pub filename: String,
    /// Path the application originally asked to write, if known.
    pub orig_path: Option<String>,
    /// Payload size in bytes.
    pub size: u64,
    /// World rank that owns the file.
    pub rank: usize,
    /// World size when the file was written.
    pub ranks: usize,
    /// Dataset the file belongs to.
    pub dataset: u64,
    /// Payload kind.
    pub kind: FileKind,
    /// Whether the owning rank declared the file valid and the size check
    /// passed.
    pub complete: bool,
    /// CRC32 of the payload, when one has been computed.
    pub crc32: Option<u32>,
}

impl FileMeta {
    /// Builds a record for `path`, reading its current size from disk.
    pub fn for_file(
        path: &Path,
        rank: usize,
        ranks: usize,
        dataset: u64,
        kind: FileKind,
        complete: bool,
    ) -> Result<Self, MetaError> {
        let filename = path
            .file_name()
            .ok_or_else(|| MetaError::Malformed {
                path: path.to_path_buf(),
            })?
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            filename,
            orig_path: None,
            size: fileio::file_size(path)?,
            rank,
            ranks,
            dataset,
            kind,
            complete,
            crc32: None,
        })
    }

    /// Serializes the record into a tree.
    #[must_use]
    pub fn to_tree(&self) -> KvTree {
        let mut tree = KvTree::new();
        tree.set_str("NAME", &self.filename);
        if let Some(orig) = &self.orig_path {
            tree.set_str("ORIG", orig);
        }
        tree.set_u64("SIZE", self.size);
        tree.set_u64("RANK", self.rank as u64);
        tree.set_u64("RANKS", self.ranks as u64);
        tree.set_u64("DSET", self.dataset);
        tree.set_str("TYPE", self.kind.as_key());
        tree.set_u64("COMPLETE", u64::from(self.complete));
        if let Some(crc) = self.crc32 {
            tree.set_u64("CRC", u64::from(crc));
        }
        tree
    }

    /// Rebuilds a record from a tree, typically one read from a sidecar or
    /// shipped inside an XOR chunk header.
    pub fn from_tree(tree: &KvTree, origin: &Path) -> Result<Self, MetaError> {
        let malformed = || MetaError::Malformed {
            path: origin.to_path_buf(),
        };
        Ok(Self {
            filename: tree.get_str("NAME").ok_or_else(malformed)?.to_owned(),
            orig_path: tree.get_str("ORIG").map(str::to_owned),
            size: tree.get_u64("SIZE").ok_or_else(malformed)?,
            rank: tree.get_u64("RANK").ok_or_else(malformed)? as usize,
            ranks: tree.get_u64("RANKS").ok_or_else(malformed)? as usize,
            dataset: tree.get_u64("DSET").ok_or_else(malformed)?,
            kind: tree
                .get_str("TYPE")
                .and_then(FileKind::from_key)
                .ok_or_else(malformed)?,
            complete: tree.get_u64("COMPLETE").ok_or_else(malformed)? != 0,
            crc32: tree.get_u64("CRC").map(|v| v as u32),
        })
    }
}

/// Path of the sidecar for `file`.
#[must_use]
pub fn sidecar_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Writes the sidecar for `file`, marking it complete as recorded in
/// `meta`. The payload's actual size is checked against the record; a
/// short or long payload forces `complete = false` in what lands on disk.
pub fn complete(file: &Path, meta: &FileMeta) -> Result<(), MetaError> {
    let mut meta = meta.clone();
    match fileio::file_size(file) {
        Ok(size) if size == meta.size => {}
        _ => meta.complete = false,
    }
    meta.to_tree().write_file(&sidecar_path(file))?;
    Ok(())
}

/// Removes the sidecar for `file`, revoking its completion. Missing
/// sidecars are fine; the end state is the same.
pub fn incomplete(file: &Path) {
    let _ = std::fs::remove_file(sidecar_path(file));
}

/// Reads the sidecar for `file`.
pub fn read(file: &Path) -> Result<FileMeta, MetaError> {
    let path = sidecar_path(file);
    let tree = KvTree::read_file_if_exists(&path)?.ok_or_else(|| MetaError::Missing {
        path: file.to_path_buf(),
    })?;
    FileMeta::from_tree(&tree, file)
}

/// Overwrites the sidecar for `file` without the size check, used when a
/// CRC is recorded after the fact.
pub fn write(file: &Path, meta: &FileMeta) -> Result<(), MetaError> {
    meta.to_tree().write_file(&sidecar_path(file))?;
    Ok(())
}

/// Computes the payload CRC32 and records it in the sidecar.
///
/// When the sidecar already holds a CRC, the freshly computed value is
/// compared against it and a mismatch reports the file as corrupt.
pub fn compute_crc(file: &Path) -> Result<u32, MetaError> {
    let mut meta = read(file)?;
    let crc = fileio::crc32_file(file)?;
    match meta.crc32 {
        Some(recorded) if recorded != crc => {
            meta.complete = false;
            write(file, &meta)?;
            Err(MetaError::Malformed {
                path: file.to_path_buf(),
            })
        }
        Some(_) => Ok(crc),
        None => {
            meta.crc32 = Some(crc);
            write(file, &meta)?;
            Ok(crc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample(dir: &Path) -> PathBuf {
        let path = dir.join("rank_0.ckpt");
        fs::write(&path, b"payload bytes").unwrap();
        path
    }

    #[test]
    fn complete_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let file = sample(dir.path());

        let meta = FileMeta::for_file(&file, 3, 8, 2, FileKind::Full, true).unwrap();
        complete(&file, &meta).unwrap();

        let back = read(&file).unwrap();
        assert_eq!(back, meta);
        assert!(back.complete);
    }

    #[test]
    fn size_mismatch_marks_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let file = sample(dir.path());

        let mut meta = FileMeta::for_file(&file, 0, 1, 1, FileKind::Full, true).unwrap();
        meta.size += 1;
        complete(&file, &meta).unwrap();
        assert!(!read(&file).unwrap().complete);
    }

    #[test]
    fn incomplete_revokes() {
        let dir = tempfile::tempdir().unwrap();
        let file = sample(dir.path());

        let meta = FileMeta::for_file(&file, 0, 1, 1, FileKind::Full, true).unwrap();
        complete(&file, &meta).unwrap();
        incomplete(&file);
        assert!(matches!(read(&file), Err(MetaError::Missing { .. })));
    }

    #[test]
    fn crc_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let file = sample(dir.path());

        let meta = FileMeta::for_file(&file, 0, 1, 1, FileKind::Full, true).unwrap();
        complete(&file, &meta).unwrap();
        compute_crc(&file).unwrap();

        // flip a byte behind the sidecar's back
        fs::write(&file, b"payload bytez").unwrap();
        assert!(compute_crc(&file).is_err());
        assert!(!read(&file).unwrap().complete);
    }
}
