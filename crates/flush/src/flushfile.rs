//! The node-local flush file: which datasets live where.
//!
//! One file per node, maintained by the node master and shared with the
//! `scr_flush_file` tool, so every access runs under the advisory lock.
//! Shape: `CKPT → <id> → LOCATION → {CACHE | FLUSHING | PFS}`.

use std::path::Path;

use group::{Communicator, ReduceOp};
use kvtree::KvTree;

use crate::FlushError;

/// Where a dataset currently lives, from this node's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    /// Present in node-local cache.
    Cache,
    /// A flush to the PFS is in flight.
    Flushing,
    /// Safely on the PFS.
    Pfs,
}

impl Location {
    /// Key string used in the flush file.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "CACHE",
            Self::Flushing => "FLUSHING",
            Self::Pfs => "PFS",
        }
    }
}

const KEY_CKPT: &str = "CKPT";
const KEY_LOCATION: &str = "LOCATION";

/// Adds `location` for `dataset`; node master only, others no-op.
pub fn location_set(
    path: &Path,
    dataset: u64,
    location: Location,
    local: &dyn Communicator,
) -> Result<(), FlushError> {
    if local.rank() == 0 {
        let (lock, mut tree) = kvtree::file::lock_open_read(path)?;
        tree.ensure(KEY_CKPT)
            .ensure_int(dataset as i64)
            .set_kv(KEY_LOCATION, location.as_str());
        kvtree::file::write_close_unlock(lock, &tree)?;
    }
    Ok(())
}

/// Removes `location` for `dataset`; node master only.
pub fn location_unset(
    path: &Path,
    dataset: u64,
    location: Location,
    local: &dyn Communicator,
) -> Result<(), FlushError> {
    if local.rank() == 0 {
        let (lock, mut tree) = kvtree::file::lock_open_read(path)?;
        if let Some(ckpt) = tree
            .get_mut(KEY_CKPT)
            .and_then(|c| c.get_mut(&dataset.to_string()))
        {
            ckpt.unset_kv(KEY_LOCATION, location.as_str());
        }
        kvtree::file::write_close_unlock(lock, &tree)?;
    }
    Ok(())
}

/// Drops every record of `dataset`; node master only.
pub fn unset_dataset(
    path: &Path,
    dataset: u64,
    local: &dyn Communicator,
) -> Result<(), FlushError> {
    if local.rank() == 0 {
        let (lock, mut tree) = kvtree::file::lock_open_read(path)?;
        if let Some(ckpts) = tree.get_mut(KEY_CKPT) {
            ckpts.unset_int(dataset as i64);
            if ckpts.is_empty() {
                tree.unset(KEY_CKPT);
            }
        }
        kvtree::file::write_close_unlock(lock, &tree)?;
    }
    Ok(())
}

fn read_flag(path: &Path, dataset: u64, location: Location) -> Result<bool, FlushError> {
    let tree = KvTree::read_file_if_exists(path)?.unwrap_or_default();
    Ok(tree
        .get(KEY_CKPT)
        .and_then(|c| c.get_int(dataset as i64))
        .and_then(|c| c.get_kv(KEY_LOCATION, location.as_str()))
        .is_some())
}

/// True on every rank of the node when the master sees `dataset` at
/// `location`.
pub fn location_test(
    path: &Path,
    dataset: u64,
    location: Location,
    local: &dyn Communicator,
) -> Result<bool, FlushError> {
    let flag = if local.rank() == 0 {
        i64::from(read_flag(path, dataset, location)?)
    } else {
        0
    };
    Ok(local.allreduce_i64(flag, ReduceOp::Max)? != 0)
}

/// True when `dataset` sits in cache without a PFS copy.
pub fn need_flush(
    path: &Path,
    dataset: u64,
    local: &dyn Communicator,
) -> Result<bool, FlushError> {
    let flag = if local.rank() == 0 {
        let in_cache = read_flag(path, dataset, Location::Cache)?;
        let in_pfs = read_flag(path, dataset, Location::Pfs)?;
        i64::from(in_cache && !in_pfs)
    } else {
        0
    };
    Ok(local.allreduce_i64(flag, ReduceOp::Max)? != 0)
}

/// True when any node still marks `dataset` as `FLUSHING`; agreed by
/// every rank of the job.
pub fn is_flushing(
    path: &Path,
    dataset: u64,
    local: &dyn Communicator,
    world: &dyn Communicator,
) -> Result<bool, FlushError> {
    let flag = if local.rank() == 0 {
        read_flag(path, dataset, Location::Flushing)?
    } else {
        false
    };
    Ok(!world.alltrue(!flag)?)
}

/// Reads the raw flush file, for the CLI.
pub fn read(path: &Path) -> Result<KvTree, FlushError> {
    Ok(KvTree::read_file_if_exists(path)?.unwrap_or_default())
}

/// Dataset ids present in the flush file, ascending.
#[must_use]
pub fn datasets(tree: &KvTree) -> Vec<u64> {
    tree.get(KEY_CKPT)
        .map(|c| c.int_keys().into_iter().map(|id| id as u64).collect())
        .unwrap_or_default()
}

/// Location keys recorded for `dataset` in an already-read flush file.
#[must_use]
pub fn locations(tree: &KvTree, dataset: u64) -> Vec<String> {
    tree.get(KEY_CKPT)
        .and_then(|c| c.get_int(dataset as i64))
        .and_then(|c| c.get(KEY_LOCATION))
        .map(|locs| locs.keys().map(str::to_owned).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use group::LocalWorld;

    #[test]
    fn set_test_unset_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flush.scr");
        let comm = LocalWorld::new(1).into_comms().pop().unwrap();

        location_set(&path, 3, Location::Cache, &comm).unwrap();
        assert!(location_test(&path, 3, Location::Cache, &comm).unwrap());
        assert!(need_flush(&path, 3, &comm).unwrap());

        location_set(&path, 3, Location::Pfs, &comm).unwrap();
        assert!(!need_flush(&path, 3, &comm).unwrap());

        location_unset(&path, 3, Location::Pfs, &comm).unwrap();
        assert!(need_flush(&path, 3, &comm).unwrap());

        unset_dataset(&path, 3, &comm).unwrap();
        assert!(datasets(&read(&path).unwrap()).is_empty());
    }
}
