#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `cache` owns the lifecycle of datasets in node-local storage: creating
//! and deleting dataset directories, evicting old datasets when a storage
//! base fills its quota, and the two restart protocols that make a cache
//! useful after ranks remap — the per-node filemap gather/scatter and the
//! job-wide redistribute that moves files to wherever their owning rank
//! now runs.
//!
//! # Invariants
//!
//! - A file is unlinked before its filemap entry disappears; a filemap
//!   entry exists before its file does. Either way a crash leaves the map
//!   conservative, and [`clean_files`] sweeps the remainder.
//! - Deletion order per dataset: payloads and sidecars, then the dataset
//!   directory, then the flush-file entry, then the filemap entry.

use std::path::Path;

use group::Topology;
use thiserror::Error;

mod delete;
mod distribute;
mod gather;

pub use delete::{clean_files, dataset_dir_create, delete_dataset, evict, unlink_all, unlink_rank};
pub use distribute::{distribute_descriptors, distribute_files};
pub use gather::gather_scatter;

/// Error raised by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// File-level failure.
    #[error(transparent)]
    Io(#[from] fileio::FileIoError),

    /// Tree-store failure.
    #[error(transparent)]
    Tree(#[from] kvtree::KvTreeError),

    /// Group communication failure.
    #[error(transparent)]
    Group(#[from] group::GroupError),

    /// Metadata failure.
    #[error(transparent)]
    Meta(#[from] meta::MetaError),

    /// Filemap failure.
    #[error(transparent)]
    Filemap(#[from] filemap::FilemapError),

    /// Flush-file failure.
    #[error(transparent)]
    Flush(#[from] flush::FlushError),

    /// Redundancy failure during redistribute.
    #[error(transparent)]
    Redundancy(#[from] redundancy::RedundancyError),

    /// No surviving copy of this rank's files or descriptor exists.
    #[error("dataset {dataset}: no source holds this rank's data")]
    NoSource {
        /// Affected dataset.
        dataset: u64,
    },
}

/// Everything the cache controller needs to know about its surroundings.
pub struct CacheCtx<'a> {
    /// Job topology.
    pub topo: &'a Topology,
    /// This rank's filemap.
    pub map: &'a mut filemap::Filemap,
    /// Where this rank's filemap persists.
    pub map_file: &'a Path,
    /// The node's master filemap listing.
    pub master_map_file: &'a Path,
    /// The node's control directory.
    pub cntl_dir: &'a Path,
    /// The node's flush file.
    pub flush_file: &'a Path,
    /// Buffer size for streaming transfers.
    pub buf_size: usize,
    /// Whether to verify CRCs while deleting, surfacing silent
    /// corruption.
    pub crc_on_delete: bool,
    /// Whether redistribute transfers verify CRCs.
    pub crc_on_copy: bool,
    /// Diagnostics sink.
    pub diag: &'a logging::Diag,
}

impl CacheCtx<'_> {
    /// Rewrites this rank's filemap on disk.
    pub fn persist_map(&self) -> Result<(), CacheError> {
        self.map.write(self.map_file)?;
        Ok(())
    }

    /// Path of the per-rank filemap for local rank `i` in the control
    /// directory.
    #[must_use]
    pub fn rank_map_file(&self, local_rank: usize) -> std::path::PathBuf {
        self.cntl_dir.join(format!("filemap_{local_rank}.scr"))
    }
}
