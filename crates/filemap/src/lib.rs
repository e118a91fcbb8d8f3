#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! The filemap is the authoritative per-node record of what lives in
//! cache: for each dataset and each rank whose files this node holds, the
//! file paths, the expected file count, the redundancy descriptor in force
//! when that rank encoded, and free-form tags (such as the partner's
//! hostname). A node may hold entries for ranks other than its own while
//! files are in flight during a restart redistribute or parked as partner
//! shards.
//!
//! # Invariants
//!
//! The on-disk copy is a prefix of what is true in memory: callers rewrite
//! the map *before* creating a file it names and remove the entry only
//! *after* the file is unlinked, so a crash can leave stale entries
//! (cleaned by a later pass) but never an untracked file.
//!
//! Shape of the backing tree:
//!
//! ```text
//! DSET → <id> → RANK → <rank> → FILE → <path> → [META → ...]
//!                               EXPECTED → <n>
//!                               DESC → <descriptor tree>
//!                               TAG → <key> → <value>
//! ```

use std::path::{Path, PathBuf};

use kvtree::{KvTree, KvTreeError};
use meta::FileMeta;
use thiserror::Error;

const KEY_DSET: &str = "DSET";
const KEY_RANK: &str = "RANK";
const KEY_FILE: &str = "FILE";
const KEY_META: &str = "META";
const KEY_EXPECTED: &str = "EXPECTED";
const KEY_DESC: &str = "DESC";
const KEY_TAG: &str = "TAG";

/// Error raised by filemap operations.
#[derive(Debug, Error)]
pub enum FilemapError {
    /// Tree-store failure underneath.
    #[error(transparent)]
    Tree(#[from] KvTreeError),

    /// A stored meta record did not parse.
    #[error(transparent)]
    Meta(#[from] meta::MetaError),
}

/// The per-node filemap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filemap {
    tree: KvTree,
}

impl Filemap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the map at `path`; a missing file is an empty map.
    pub fn read(path: &Path) -> Result<Self, FilemapError> {
        let tree = KvTree::read_file_if_exists(path)?.unwrap_or_default();
        Ok(Self { tree })
    }

    /// Persists the map to `path` under the advisory lock.
    pub fn write(&self, path: &Path) -> Result<(), FilemapError> {
        kvtree::file::write_with_lock(path, &self.tree)?;
        Ok(())
    }

    fn rank_tree(&self, dataset: u64, rank: usize) -> Option<&KvTree> {
        self.tree
            .get(KEY_DSET)?
            .get_int(dataset as i64)?
            .get(KEY_RANK)?
            .get_int(rank as i64)
    }

    fn rank_tree_mut(&mut self, dataset: u64, rank: usize) -> &mut KvTree {
        self.tree
            .ensure(KEY_DSET)
            .ensure_int(dataset as i64)
            .ensure(KEY_RANK)
            .ensure_int(rank as i64)
    }

    /// Records `file` for `(dataset, rank)`.
    pub fn add_file(&mut self, dataset: u64, rank: usize, file: &Path) {
        self.rank_tree_mut(dataset, rank)
            .ensure(KEY_FILE)
            .ensure(file.to_string_lossy().into_owned());
    }

    /// Records `file` along with its meta record.
    pub fn add_file_with_meta(&mut self, dataset: u64, rank: usize, file: &Path, meta: &FileMeta) {
        self.rank_tree_mut(dataset, rank)
            .ensure(KEY_FILE)
            .ensure(file.to_string_lossy().into_owned())
            .set(KEY_META, meta.to_tree());
    }

    /// Meta record stored inline for `file`, if any.
    #[must_use]
    pub fn file_meta(&self, dataset: u64, rank: usize, file: &Path) -> Option<FileMeta> {
        let tree = self
            .rank_tree(dataset, rank)?
            .get(KEY_FILE)?
            .get(&file.to_string_lossy())?
            .get(KEY_META)?;
        FileMeta::from_tree(tree, file).ok()
    }

    /// Forgets `file` for `(dataset, rank)`.
    pub fn remove_file(&mut self, dataset: u64, rank: usize, file: &Path) {
        let rank_tree = self.rank_tree_mut(dataset, rank);
        if let Some(files) = rank_tree.get_mut(KEY_FILE) {
            files.unset(&file.to_string_lossy());
            if files.is_empty() {
                rank_tree.unset(KEY_FILE);
            }
        }
    }

    /// Files recorded for `(dataset, rank)`, in canonical order.
    #[must_use]
    pub fn files(&self, dataset: u64, rank: usize) -> Vec<PathBuf> {
        self.rank_tree(dataset, rank)
            .and_then(|t| t.get(KEY_FILE))
            .map(|files| files.keys().map(PathBuf::from).collect())
            .unwrap_or_default()
    }

    /// Number of files recorded for `(dataset, rank)`.
    #[must_use]
    pub fn num_files(&self, dataset: u64, rank: usize) -> usize {
        self.rank_tree(dataset, rank)
            .and_then(|t| t.get(KEY_FILE))
            .map_or(0, KvTree::len)
    }

    /// Sets the number of files `rank` is supposed to hold for `dataset`.
    pub fn set_expected_files(&mut self, dataset: u64, rank: usize, expected: usize) {
        self.rank_tree_mut(dataset, rank)
            .set_u64(KEY_EXPECTED, expected as u64);
    }

    /// Expected file count, when known.
    #[must_use]
    pub fn expected_files(&self, dataset: u64, rank: usize) -> Option<usize> {
        self.rank_tree(dataset, rank)?
            .get_u64(KEY_EXPECTED)
            .map(|v| v as usize)
    }

    /// Clears the expected file count.
    pub fn unset_expected_files(&mut self, dataset: u64, rank: usize) {
        self.rank_tree_mut(dataset, rank).unset(KEY_EXPECTED);
    }

    /// Stores the redundancy descriptor `rank` used when encoding
    /// `dataset`.
    pub fn set_desc(&mut self, dataset: u64, rank: usize, desc: KvTree) {
        self.rank_tree_mut(dataset, rank).set(KEY_DESC, desc);
    }

    /// Redundancy descriptor stored for `(dataset, rank)`.
    #[must_use]
    pub fn desc(&self, dataset: u64, rank: usize) -> Option<&KvTree> {
        self.rank_tree(dataset, rank)?.get(KEY_DESC)
    }

    /// Sets a free-form tag, e.g. `PARTNER → <hostname>`.
    pub fn set_tag(&mut self, dataset: u64, rank: usize, key: &str, value: &str) {
        self.rank_tree_mut(dataset, rank)
            .ensure(KEY_TAG)
            .set_str(key, value);
    }

    /// Reads a free-form tag.
    #[must_use]
    pub fn tag(&self, dataset: u64, rank: usize, key: &str) -> Option<&str> {
        self.rank_tree(dataset, rank)?.get(KEY_TAG)?.get_str(key)
    }

    /// True when the map holds an entry for `(dataset, rank)`.
    #[must_use]
    pub fn has_rank(&self, dataset: u64, rank: usize) -> bool {
        self.rank_tree(dataset, rank).is_some()
    }

    /// Ranks recorded under `dataset`, ascending.
    #[must_use]
    pub fn ranks(&self, dataset: u64) -> Vec<usize> {
        self.tree
            .get(KEY_DSET)
            .and_then(|d| d.get_int(dataset as i64))
            .and_then(|d| d.get(KEY_RANK))
            .map(|ranks| ranks.int_keys().into_iter().map(|r| r as usize).collect())
            .unwrap_or_default()
    }

    /// Every rank recorded under any dataset, ascending and deduplicated.
    #[must_use]
    pub fn all_ranks(&self) -> Vec<usize> {
        let mut ranks: Vec<usize> = self
            .datasets()
            .into_iter()
            .flat_map(|d| self.ranks(d))
            .collect();
        ranks.sort_unstable();
        ranks.dedup();
        ranks
    }

    /// Dataset ids present, ascending.
    #[must_use]
    pub fn datasets(&self) -> Vec<u64> {
        self.tree
            .get(KEY_DSET)
            .map(|d| d.int_keys().into_iter().map(|id| id as u64).collect())
            .unwrap_or_default()
    }

    /// Number of datasets present.
    #[must_use]
    pub fn num_datasets(&self) -> usize {
        self.tree.get(KEY_DSET).map_or(0, KvTree::len)
    }

    /// Highest dataset id present.
    #[must_use]
    pub fn latest_dataset(&self) -> Option<u64> {
        self.datasets().into_iter().max()
    }

    /// Lowest dataset id present.
    #[must_use]
    pub fn oldest_dataset(&self) -> Option<u64> {
        self.datasets().into_iter().min()
    }

    /// Removes the entry for `(dataset, rank)`.
    pub fn remove_rank(&mut self, dataset: u64, rank: usize) {
        if let Some(ranks) = self
            .tree
            .get_mut(KEY_DSET)
            .and_then(|d| d.get_mut(&dataset.to_string()))
            .and_then(|d| d.get_mut(KEY_RANK))
        {
            ranks.unset_int(rank as i64);
        }
        self.prune(dataset);
    }

    /// Removes every record of `dataset`.
    pub fn remove_dataset(&mut self, dataset: u64) {
        if let Some(dsets) = self.tree.get_mut(KEY_DSET) {
            dsets.unset_int(dataset as i64);
            if dsets.is_empty() {
                self.tree.unset(KEY_DSET);
            }
        }
    }

    /// Removes every entry belonging to `rank` across all datasets and
    /// returns them as a new map (used by gather/scatter on restart).
    #[must_use]
    pub fn extract_rank(&mut self, rank: usize) -> Self {
        let mut out = Self::new();
        for dataset in self.datasets() {
            let taken = self
                .tree
                .get_mut(KEY_DSET)
                .and_then(|d| d.get_mut(&dataset.to_string()))
                .and_then(|d| d.get_mut(KEY_RANK))
                .and_then(|ranks| ranks.unset_int(rank as i64));
            if let Some(sub) = taken {
                out.tree
                    .ensure(KEY_DSET)
                    .ensure_int(dataset as i64)
                    .ensure(KEY_RANK)
                    .set(rank.to_string(), sub);
            }
            self.prune(dataset);
        }
        out
    }

    fn prune(&mut self, dataset: u64) {
        let empty = self
            .tree
            .get(KEY_DSET)
            .and_then(|d| d.get_int(dataset as i64))
            .is_some_and(|d| d.get(KEY_RANK).is_none_or(KvTree::is_empty));
        if empty {
            self.remove_dataset(dataset);
        }
    }

    /// Merges `other` into `self`; incoming entries win on collisions.
    pub fn merge(&mut self, other: Self) {
        self.tree.merge(other.tree);
    }

    /// Borrow of the backing tree, used for exchange over the group.
    #[must_use]
    pub fn as_tree(&self) -> &KvTree {
        &self.tree
    }

    /// Wraps an exchanged tree back into a map.
    #[must_use]
    pub fn from_tree(tree: KvTree) -> Self {
        Self { tree }
    }
}

/// Checks one cached file against its sidecar: present, complete, and
/// stamped with the expected dataset, rank, and world size. When
/// `check_crc` is set the payload is re-hashed against the recorded CRC.
#[must_use]
pub fn file_is_good(
    file: &Path,
    dataset: u64,
    rank: usize,
    ranks_world: usize,
    check_crc: bool,
) -> bool {
    let Ok(meta) = meta::read(file) else {
        return false;
    };
    let Ok(size) = fileio::file_size(file) else {
        return false;
    };
    if !meta.complete
        || meta.dataset != dataset
        || meta.rank != rank
        || meta.ranks != ranks_world
        || meta.size != size
    {
        return false;
    }
    if check_crc {
        match (meta.crc32, fileio::crc32_file(file)) {
            (Some(recorded), Ok(actual)) if recorded != actual => return false,
            (_, Err(_)) => return false,
            _ => {}
        }
    }
    true
}

/// True when every file the map records for `(dataset, rank)` is good and
/// the count matches the expected number. An unknown expected count is a
/// failure: it means the entry was never fully written.
#[must_use]
pub fn have_files(
    map: &Filemap,
    dataset: u64,
    rank: usize,
    ranks_world: usize,
    check_crc: bool,
) -> bool {
    let Some(expected) = map.expected_files(dataset, rank) else {
        return false;
    };
    let files = map.files(dataset, rank);
    if files.len() != expected {
        return false;
    }
    files
        .iter()
        .all(|file| file_is_good(file, dataset, rank, ranks_world, check_crc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_list_remove_files() {
        let mut map = Filemap::new();
        map.add_file(1, 0, Path::new("/cache/ckpt.1/a"));
        map.add_file(1, 0, Path::new("/cache/ckpt.1/b"));
        map.add_file(1, 2, Path::new("/cache/ckpt.1/c"));

        assert_eq!(map.num_files(1, 0), 2);
        assert_eq!(map.ranks(1), vec![0, 2]);

        map.remove_file(1, 0, Path::new("/cache/ckpt.1/a"));
        assert_eq!(
            map.files(1, 0),
            vec![PathBuf::from("/cache/ckpt.1/b")]
        );
    }

    #[test]
    fn dataset_ordering_is_numeric() {
        let mut map = Filemap::new();
        for id in [3, 10, 1] {
            map.add_file(id, 0, Path::new("/f"));
        }
        assert_eq!(map.datasets(), vec![1, 3, 10]);
        assert_eq!(map.latest_dataset(), Some(10));
        assert_eq!(map.oldest_dataset(), Some(1));
    }

    #[test]
    fn extract_rank_moves_entries() {
        let mut map = Filemap::new();
        map.add_file(1, 0, Path::new("/a"));
        map.add_file(1, 5, Path::new("/b"));
        map.add_file(2, 5, Path::new("/c"));
        map.set_expected_files(1, 5, 1);

        let extracted = map.extract_rank(5);
        assert!(!map.has_rank(1, 5));
        assert!(!map.has_rank(2, 5));
        assert!(map.has_rank(1, 0));
        assert_eq!(extracted.files(1, 5), vec![PathBuf::from("/b")]);
        assert_eq!(extracted.expected_files(1, 5), Some(1));
        assert_eq!(extracted.files(2, 5), vec![PathBuf::from("/c")]);
    }

    #[test]
    fn extract_last_rank_prunes_dataset() {
        let mut map = Filemap::new();
        map.add_file(7, 4, Path::new("/only"));
        let _ = map.extract_rank(4);
        assert_eq!(map.num_datasets(), 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filemap_0.scr");

        let mut map = Filemap::new();
        map.add_file(1, 0, Path::new("/cache/ckpt.1/a"));
        map.set_expected_files(1, 0, 1);
        let mut desc = KvTree::new();
        desc.set_str("TYPE", "XOR");
        map.set_desc(1, 0, desc);
        map.set_tag(1, 0, "PARTNER", "node7");
        map.write(&path).unwrap();

        let back = Filemap::read(&path).unwrap();
        assert_eq!(back, map);
        assert_eq!(back.tag(1, 0, "PARTNER"), Some("node7"));
        assert_eq!(back.desc(1, 0).unwrap().get_str("TYPE"), Some("XOR"));
    }
}
