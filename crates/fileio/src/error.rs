use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error raised by low-level file operations.
#[derive(Debug, Error)]
pub enum FileIoError {
    /// An underlying I/O operation failed.
    #[error("failed to {action} '{path}': {source}")]
    Io {
        /// Action that failed, e.g. `open` or `fsync`.
        action: &'static str,
        /// Path the action was applied to.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// Acquiring or releasing an advisory lock failed.
    #[error("failed to lock '{path}': {source}")]
    Lock {
        /// Path of the lock file.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The supplied path has no usable file name or parent component.
    #[error("path '{path}' has no usable name component")]
    InvalidPath {
        /// Offending path.
        path: PathBuf,
    },
}

impl FileIoError {
    pub(crate) fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn invalid_path(path: &Path) -> Self {
        Self::InvalidPath {
            path: path.to_path_buf(),
        }
    }
}
