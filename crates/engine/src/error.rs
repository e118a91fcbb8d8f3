use thiserror::Error;

/// Error raised by the orchestrator.
#[derive(Debug, Error)]
pub enum ScrError {
    /// The library is disabled by configuration.
    #[error("SCR is disabled")]
    Disabled,

    /// A required parameter is missing or nonsensical.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The public API was called out of sequence.
    #[error("invalid call sequence: {0}")]
    InvalidCall(String),

    /// A halt condition fired and the caller asked not to exit the
    /// process.
    #[error("job must halt: {0}")]
    Halted(String),

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

    /// Halt-file failure.
    #[error(transparent)]
    Halt(#[from] halt::HaltError),

    /// Redundancy failure.
    #[error(transparent)]
    Redundancy(#[from] redundancy::RedundancyError),

    /// Cache failure.
    #[error(transparent)]
    Cache(#[from] cache::CacheError),

    /// Flush failure.
    #[error(transparent)]
    Flush(#[from] flush::FlushError),

    /// Fetch failure.
    #[error(transparent)]
    Fetch(#[from] fetch::FetchError),
}
