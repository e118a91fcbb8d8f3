use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use rustix::fs::{FlockOperation, flock};

use crate::FileIoError;

/// Exclusive advisory lock over a file, held for the guard's lifetime.
///
/// The halt, transfer, and index files are shared between ranks on a node
/// and with external tools, so every read-modify-write cycle runs under one
/// of these guards. Closing the file descriptor releases the lock, so drop
/// is sufficient cleanup even on error paths.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Opens `path` (creating it if missing) and blocks until an exclusive
    /// advisory lock is held.
    pub fn acquire(path: &Path) -> Result<Self, FileIoError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| FileIoError::Lock {
                path: path.to_path_buf(),
                source,
            })?;
        flock(&file, FlockOperation::LockExclusive).map_err(|errno| FileIoError::Lock {
            path: path.to_path_buf(),
            source: io::Error::from(errno),
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the locked file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The locked file handle.
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    /// Reads the entire locked file.
    pub fn read_all(&mut self) -> Result<Vec<u8>, FileIoError> {
        use std::io::{Read, Seek, SeekFrom};
        let mut bytes = Vec::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_end(&mut bytes))
            .map_err(|source| FileIoError::io("read", &self.path, source))?;
        Ok(bytes)
    }

    /// Replaces the locked file's contents with `bytes` and fsyncs.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), FileIoError> {
        use std::io::{Seek, SeekFrom, Write};
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.set_len(0))
            .and_then(|()| self.file.write_all(bytes))
            .and_then(|()| self.file.sync_all())
            .map_err(|source| FileIoError::io("write", &self.path, source))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Unlock explicitly so the guard can outlive pathological fd
        // duplication; errors here leave the lock to die with the fd.
        let _ = flock(&self.file, FlockOperation::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_modify_write_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("halt.scr");

        let mut lock = FileLock::acquire(&path).unwrap();
        assert!(lock.read_all().unwrap().is_empty());
        lock.write_all(b"CHECKPOINTS 3").unwrap();
        drop(lock);

        let mut lock = FileLock::acquire(&path).unwrap();
        assert_eq!(lock.read_all().unwrap(), b"CHECKPOINTS 3");
    }
}
