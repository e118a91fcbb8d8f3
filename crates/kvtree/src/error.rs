use std::path::PathBuf;

use thiserror::Error;

/// Error raised by tree-store operations.
#[derive(Debug, Error)]
pub enum KvTreeError {
    /// File-level failure from the I/O layer.
    #[error(transparent)]
    Io(#[from] fileio::FileIoError),

    /// Group communication failure.
    #[error(transparent)]
    Group(#[from] group::GroupError),

    /// A packed buffer or file did not decode to a tree.
    #[error("corrupt tree data in {context}")]
    Corrupt {
        /// Where the bad bytes came from.
        context: String,
    },

    /// A tree file carried an unknown format version.
    #[error("unknown tree file version in '{path}': {found}")]
    VersionMismatch {
        /// Offending file.
        path: PathBuf,
        /// The magic/version line found.
        found: String,
    },

    /// Two entries of a sparse exchange named the same destination rank.
    #[error("destination rank {rank} specified multiple times in sparse exchange")]
    DuplicateDestination {
        /// Offending rank.
        rank: usize,
    },
}

impl KvTreeError {
    pub(crate) fn corrupt(context: impl Into<String>) -> Self {
        Self::Corrupt {
            context: context.into(),
        }
    }
}
