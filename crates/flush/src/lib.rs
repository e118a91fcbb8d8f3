#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `flush` moves completed datasets from node-local cache to the parallel
//! file system and keeps the PFS-side bookkeeping honest: the summary
//! file describing each flushed dataset, the index file listing every
//! dataset under a prefix, the `current` link a restart reads first, and
//! the per-node flush file tracking where each dataset currently lives
//! (`CACHE`, `FLUSHING`, `PFS`).
//!
//! Two flush paths share all of that bookkeeping. The synchronous path
//! copies files inline, flow-controlled by a sliding window of at most
//! `flush_width` ranks writing at once. The asynchronous path enqueues
//! work into the node-local transfer file and leaves the byte movement to
//! an external data-mover process, polling `WRITTEN == SIZE` for
//! completion.
//!
//! # Ordering guarantees
//!
//! - The summary file is written before the index records completeness.
//! - The `current` link moves only after the index records completeness.
//! - The flush file says `FLUSHING` for the whole transfer and flips to
//!   `PFS` only after summary and index are safely down.

use std::path::{Path, PathBuf};
use std::time::Duration;

use group::Topology;
use thiserror::Error;

pub mod dataset;
pub mod flushfile;
pub mod index;
pub mod nonblocking;
pub mod summary;
pub mod sync;
pub mod transfer;

pub use dataset::Dataset;

/// Error raised by the flush pipeline.
#[derive(Debug, Error)]
pub enum FlushError {
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

    /// Raw stream I/O failure.
    #[error("stream I/O failed: {0}")]
    Stream(#[from] std::io::Error),

    /// One or more ranks is missing files for the dataset.
    #[error("dataset {dataset}: files missing from cache")]
    MissingFiles {
        /// Affected dataset.
        dataset: u64,
    },

    /// The target directory could not be created.
    #[error("failed to create flush directory under '{prefix}'")]
    DirFailed {
        /// PFS prefix.
        prefix: PathBuf,
    },

    /// The flush completed with failures on one or more ranks.
    #[error("dataset {dataset}: flush failed on one or more ranks")]
    Failed {
        /// Affected dataset.
        dataset: u64,
    },

    /// A summary or index file carried an unknown version.
    #[error("unknown {what} version {found}")]
    VersionMismatch {
        /// Which file kind.
        what: &'static str,
        /// Version found.
        found: u64,
    },

    /// A summary or index file is missing required content.
    #[error("malformed {what}: {detail}")]
    Malformed {
        /// Which file kind.
        what: &'static str,
        /// What was wrong.
        detail: String,
    },
}

/// Everything the flush paths need to know about their surroundings.
pub struct FlushCtx<'a> {
    /// Job topology.
    pub topo: &'a Topology,
    /// PFS prefix directory.
    pub prefix: &'a Path,
    /// Node-local flush file in the control directory.
    pub flush_file: &'a Path,
    /// Node-local transfer file in the control directory.
    pub transfer_file: &'a Path,
    /// Max ranks copying at once during sync flush and async finalize.
    pub flush_width: usize,
    /// Buffer size for file copies.
    pub file_buf_size: usize,
    /// Whether to CRC32 data as it is copied and verify against meta.
    pub crc_on_flush: bool,
    /// Aggregate bandwidth budget for the async mover, bytes/sec.
    pub flush_async_bw: f64,
    /// CPU-percent budget for the async mover.
    pub flush_async_percent: f64,
    /// Job id string, used in PFS directory names.
    pub jobid: &'a str,
    /// Sleep between async completion polls.
    pub poll_interval: Duration,
    /// Diagnostics sink.
    pub diag: &'a logging::Diag,
}

/// The `.scr` metadata directory under a prefix.
#[must_use]
pub fn scr_dir(prefix: &Path) -> PathBuf {
    prefix.join(".scr")
}

/// Name of the `current` link under a prefix.
pub const CURRENT_LINK: &str = "current";

/// Path of the `current` link.
#[must_use]
pub fn current_link(prefix: &Path) -> PathBuf {
    prefix.join(CURRENT_LINK)
}
