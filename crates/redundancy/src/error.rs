use thiserror::Error;

/// Error raised by descriptor construction and the redundancy codecs.
#[derive(Debug, Error)]
pub enum RedundancyError {
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

    /// Raw I/O from the streaming loops.
    #[error("stream I/O failed: {0}")]
    Stream(#[from] std::io::Error),

    /// More ranks lost their files than the scheme tolerates.
    #[error("dataset {dataset}: more failures than the redundancy scheme tolerates")]
    Exceeded {
        /// Affected dataset.
        dataset: u64,
    },

    /// A rank failed during the collective encode.
    #[error("dataset {dataset}: redundancy encode failed on one or more ranks")]
    EncodeFailed {
        /// Affected dataset.
        dataset: u64,
    },

    /// A rank failed during the collective rebuild.
    #[error("dataset {dataset}: redundancy rebuild failed on one or more ranks")]
    RebuildFailed {
        /// Affected dataset.
        dataset: u64,
    },

    /// A rank that should hold an XOR chunk has none.
    #[error("dataset {dataset}: rank {rank} has no XOR chunk file")]
    MissingChunk {
        /// Affected dataset.
        dataset: u64,
        /// Rank with the missing chunk.
        rank: usize,
    },

    /// A stored descriptor is unusable.
    #[error("invalid redundancy descriptor: {0}")]
    Config(String),
}
