//! Index file: the catalog of datasets under a PFS prefix.
//!
//! Version 1 layout:
//!
//! ```text
//! VERSION → 1
//! CURRENT → <name>
//! NAME → <name> → DSET → <id>
//! DSET → <id> → NAME → <name> → COMPLETE → 0|1
//!                               DSET → <dataset descriptor>
//!                               FETCHED → <timestamp>...
//!                               FAILED → <timestamp>
//!                               FLUSHED → <timestamp>
//! ```
//!
//! Rank 0 owns updates, but the file is shared with post-job tools and
//! other runs under the same prefix, so reads and writes hold the
//! advisory lock.

use std::path::{Path, PathBuf};

use kvtree::KvTree;

use crate::{Dataset, FlushError};

/// On-disk format version this crate writes.
pub const VERSION: u64 = 1;

/// Path of the index file under `prefix`.
#[must_use]
pub fn index_path(prefix: &Path) -> PathBuf {
    crate::scr_dir(prefix).join("index.scr")
}

/// In-memory copy of the index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Index {
    tree: KvTree,
}

impl Index {
    /// Reads the index under `prefix`; missing file is an empty index.
    pub fn read(prefix: &Path) -> Result<Self, FlushError> {
        let path = index_path(prefix);
        if !path.exists() {
            return Ok(Self::default());
        }
        let tree = kvtree::file::read_with_lock(&path)?;
        let version = tree.get_u64("VERSION").unwrap_or(VERSION);
        if version != VERSION {
            return Err(FlushError::VersionMismatch {
                what: "index",
                found: version,
            });
        }
        Ok(Self { tree })
    }

    /// Writes the index back under `prefix`.
    pub fn write(&mut self, prefix: &Path) -> Result<(), FlushError> {
        let path = index_path(prefix);
        if let Some(parent) = path.parent() {
            fileio::mkdir_p(parent)?;
        }
        if self.tree.get_u64("VERSION").is_none() {
            self.tree.set_u64("VERSION", VERSION);
        }
        kvtree::file::write_with_lock(&path, &self.tree)?;
        Ok(())
    }

    fn name_entry(&mut self, id: u64, name: &str) -> &mut KvTree {
        // keep the name-to-id directory in step
        self.tree
            .ensure("NAME")
            .ensure(name)
            .set_u64("DSET", id);
        self.tree
            .ensure("DSET")
            .ensure_int(id as i64)
            .ensure("NAME")
            .ensure(name)
    }

    /// Registers `name` for dataset `id`.
    pub fn add_name(&mut self, id: u64, name: &str) {
        let _ = self.name_entry(id, name);
    }

    /// Records the dataset descriptor and completeness under its name.
    pub fn set_dataset(&mut self, id: u64, name: &str, dataset: &Dataset, complete: bool) {
        let entry = self.name_entry(id, name);
        entry.set("DSET", dataset.to_tree());
        entry.set_u64("COMPLETE", u64::from(complete));
    }

    /// Records a fetch timestamp; repeated fetches accumulate.
    pub fn mark_fetched(&mut self, id: u64, name: &str, now: u64) {
        let stamp = logging::format_timestamp(now);
        self.name_entry(id, name).set_kv("FETCHED", stamp);
    }

    /// Records a failed fetch; failed entries are skipped by
    /// [`Index::most_recent_complete`].
    pub fn mark_failed(&mut self, id: u64, name: &str, now: u64) {
        let stamp = logging::format_timestamp(now);
        self.name_entry(id, name).set_str("FAILED", stamp);
    }

    /// Records a flush timestamp.
    pub fn mark_flushed(&mut self, id: u64, name: &str, now: u64) {
        let stamp = logging::format_timestamp(now);
        self.name_entry(id, name).set_str("FLUSHED", stamp);
    }

    /// Completeness flag for `(id, name)`.
    #[must_use]
    pub fn complete(&self, id: u64, name: &str) -> Option<bool> {
        self.tree
            .get("DSET")?
            .get_int(id as i64)?
            .get("NAME")?
            .get(name)?
            .get_u64("COMPLETE")
            .map(|v| v != 0)
    }

    /// Dataset id registered under `name`.
    #[must_use]
    pub fn id_by_name(&self, name: &str) -> Option<u64> {
        self.tree.get("NAME")?.get(name)?.get_u64("DSET")
    }

    /// Stored dataset descriptor for `(id, name)`.
    #[must_use]
    pub fn dataset(&self, id: u64, name: &str) -> Option<Dataset> {
        self.tree
            .get("DSET")?
            .get_int(id as i64)?
            .get("NAME")?
            .get(name)?
            .get("DSET")
            .map(Dataset::from_tree)
    }

    /// Sets the restart target; the name must belong to a checkpoint.
    pub fn set_current(&mut self, name: &str) -> Result<(), FlushError> {
        let id = self.id_by_name(name).ok_or(FlushError::Malformed {
            what: "index",
            detail: format!("unknown dataset name '{name}'"),
        })?;
        let is_ckpt = self
            .dataset(id, name)
            .is_some_and(|d| d.is_checkpoint);
        if !is_ckpt {
            return Err(FlushError::Malformed {
                what: "index",
                detail: format!("'{name}' is not a checkpoint"),
            });
        }
        self.tree.set_str("CURRENT", name);
        Ok(())
    }

    /// Name of the restart target, if set.
    #[must_use]
    pub fn current(&self) -> Option<&str> {
        self.tree.get_str("CURRENT")
    }

    /// Clears the restart target.
    pub fn unset_current(&mut self) {
        self.tree.unset("CURRENT");
    }

    /// Most recent complete, unfailed checkpoint with id at most
    /// `earlier_than` (no bound when `None`). Returns `(id, name)`.
    #[must_use]
    pub fn most_recent_complete(&self, earlier_than: Option<u64>) -> Option<(u64, String)> {
        let dsets = self.tree.get("DSET")?;
        let mut best: Option<(u64, String)> = None;
        for id in dsets.int_keys() {
            let id = id as u64;
            if earlier_than.is_some_and(|bound| id > bound) {
                continue;
            }
            if best.as_ref().is_some_and(|(b, _)| id <= *b) {
                continue;
            }
            let Some(names) = dsets.get_int(id as i64).and_then(|d| d.get("NAME")) else {
                continue;
            };
            for (name, entry) in names.iter() {
                let complete = entry.get_u64("COMPLETE") == Some(1);
                let failed = entry.get("FAILED").is_some();
                let is_ckpt = entry
                    .get("DSET")
                    .map(Dataset::from_tree)
                    .is_some_and(|d| d.is_checkpoint);
                if complete && !failed && is_ckpt {
                    best = Some((id, name.to_owned()));
                    break;
                }
            }
        }
        best
    }

    /// Raw tree, for the CLI's listing mode.
    #[must_use]
    pub fn as_tree(&self) -> &KvTree {
        &self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(id: u64, name: &str) -> Dataset {
        Dataset {
            id,
            name: name.into(),
            is_checkpoint: true,
            ..Dataset::default()
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = Index::default();
        index.set_dataset(1, "scr.a.1", &dataset(1, "scr.a.1"), true);
        index.mark_flushed(1, "scr.a.1", 0);
        index.set_current("scr.a.1").unwrap();
        index.write(dir.path()).unwrap();

        let back = Index::read(dir.path()).unwrap();
        assert_eq!(back.current(), Some("scr.a.1"));
        assert_eq!(back.complete(1, "scr.a.1"), Some(true));
        assert_eq!(back.id_by_name("scr.a.1"), Some(1));
    }

    #[test]
    fn most_recent_complete_skips_failed_and_incomplete() {
        let mut index = Index::default();
        index.set_dataset(1, "one", &dataset(1, "one"), true);
        index.set_dataset(2, "two", &dataset(2, "two"), true);
        index.set_dataset(3, "three", &dataset(3, "three"), false);
        index.mark_failed(2, "two", 0);

        assert_eq!(index.most_recent_complete(None), Some((1, "one".into())));
        assert_eq!(index.most_recent_complete(Some(0)), None);
    }

    #[test]
    fn current_requires_checkpoint() {
        let mut index = Index::default();
        let mut output = dataset(4, "out");
        output.is_checkpoint = false;
        index.set_dataset(4, "out", &output, true);
        assert!(index.set_current("out").is_err());
    }
}
