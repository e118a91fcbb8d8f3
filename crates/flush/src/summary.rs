//! Summary file: the per-dataset manifest written to the PFS on flush.
//!
//! Version 6 layout:
//!
//! ```text
//! VERSION → 6
//! COMPLETE → 0|1
//! DSET → <dataset descriptor>
//! RANK2FILE → RANKS → <n>
//!             RANK → <r> → FILES → <count>
//!                          FILE → <name> → <meta tree>
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kvtree::KvTree;
use meta::FileMeta;

use crate::{Dataset, FlushError};

/// On-disk format version this crate writes.
pub const VERSION: u64 = 6;

/// Directory holding a dataset's PFS-side metadata.
#[must_use]
pub fn dataset_meta_dir(prefix: &Path, dataset: u64) -> PathBuf {
    crate::scr_dir(prefix).join(format!("scr.dataset.{dataset}"))
}

/// Path of the summary file for `dataset`.
#[must_use]
pub fn summary_path(prefix: &Path, dataset: u64) -> PathBuf {
    dataset_meta_dir(prefix, dataset).join("summary.scr")
}

/// The summary contents.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Summary {
    /// Whether every rank flushed successfully.
    pub complete: bool,
    /// Dataset descriptor.
    pub dataset: Dataset,
    /// World size at flush time.
    pub ranks: usize,
    /// Per-rank file records.
    pub rank_files: BTreeMap<usize, Vec<FileMeta>>,
}

impl Summary {
    fn to_tree(&self) -> KvTree {
        let mut tree = KvTree::new();
        tree.set_u64("VERSION", VERSION);
        tree.set_u64("COMPLETE", u64::from(self.complete));
        tree.set("DSET", self.dataset.to_tree());
        let rank2file = tree.ensure("RANK2FILE");
        rank2file.set_u64("RANKS", self.ranks as u64);
        let ranks = rank2file.ensure("RANK");
        for (&rank, metas) in &self.rank_files {
            let entry = ranks.ensure_int(rank as i64);
            entry.set_u64("FILES", metas.len() as u64);
            let files = entry.ensure("FILE");
            for m in metas {
                files.set(m.filename.clone(), m.to_tree());
            }
        }
        tree
    }

    fn from_tree(tree: &KvTree, path: &Path) -> Result<Self, FlushError> {
        let version = tree.get_u64("VERSION").unwrap_or(0);
        if version != VERSION {
            return Err(FlushError::VersionMismatch {
                what: "summary",
                found: version,
            });
        }
        let malformed = |detail: &str| FlushError::Malformed {
            what: "summary",
            detail: detail.to_owned(),
        };

        let rank2file = tree.get("RANK2FILE").ok_or_else(|| malformed("no RANK2FILE"))?;
        let ranks = rank2file
            .get_u64("RANKS")
            .ok_or_else(|| malformed("no RANKS"))? as usize;

        let mut rank_files = BTreeMap::new();
        if let Some(entries) = rank2file.get("RANK") {
            for rank in entries.int_keys() {
                let entry = entries.get_int(rank).expect("listed key");
                let mut metas = Vec::new();
                if let Some(files) = entry.get("FILE") {
                    for (name, sub) in files.iter() {
                        metas.push(FileMeta::from_tree(sub, &path.join(name)).map_err(|_| {
                            malformed(&format!("bad meta for '{name}'"))
                        })?);
                    }
                }
                rank_files.insert(rank as usize, metas);
            }
        }

        Ok(Self {
            complete: tree.get_u64("COMPLETE").unwrap_or(0) != 0,
            dataset: tree
                .get("DSET")
                .map(Dataset::from_tree)
                .ok_or_else(|| malformed("no DSET"))?,
            ranks,
            rank_files,
        })
    }

    /// Writes the summary for its dataset under `prefix`.
    pub fn write(&self, prefix: &Path) -> Result<(), FlushError> {
        let dir = dataset_meta_dir(prefix, self.dataset.id);
        fileio::mkdir_p(&dir)?;
        self.to_tree().write_file(&summary_path(prefix, self.dataset.id))?;
        Ok(())
    }

    /// Reads the summary for `dataset` under `prefix`.
    pub fn read(prefix: &Path, dataset: u64) -> Result<Self, FlushError> {
        let path = summary_path(prefix, dataset);
        let tree = KvTree::read_file(&path)?;
        Self::from_tree(&tree, &path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meta::FileKind;

    fn meta(name: &str, rank: usize) -> FileMeta {
        FileMeta {
            filename: name.into(),
            orig_path: None,
            size: 64,
            rank,
            ranks: 2,
            dataset: 5,
            kind: FileKind::Full,
            complete: true,
            crc32: Some(0xDEAD_BEEF),
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();

        let mut summary = Summary {
            complete: true,
            dataset: Dataset {
                id: 5,
                name: "scr.x.5".into(),
                is_checkpoint: true,
                ..Dataset::default()
            },
            ranks: 2,
            rank_files: BTreeMap::new(),
        };
        summary.rank_files.insert(0, vec![meta("a.ckpt", 0)]);
        summary
            .rank_files
            .insert(1, vec![meta("b.ckpt", 1), meta("c.ckpt", 1)]);

        summary.write(dir.path()).unwrap();
        let back = Summary::read(dir.path(), 5).unwrap();
        assert_eq!(back, summary);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = KvTree::new();
        tree.set_u64("VERSION", 5);
        fileio::mkdir_p(&dataset_meta_dir(dir.path(), 9)).unwrap();
        tree.write_file(&summary_path(dir.path(), 9)).unwrap();

        assert!(matches!(
            Summary::read(dir.path(), 9),
            Err(FlushError::VersionMismatch { found: 5, .. })
        ));
    }
}
