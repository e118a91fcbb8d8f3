//! The transfer file: the contract between the library and the external
//! data-mover process during an asynchronous flush.
//!
//! One file per node, always accessed under the advisory lock by both
//! sides. The library enqueues work and writes `COMMAND`; the mover
//! copies bytes, updates `WRITTEN`, and reports `STATE`.
//!
//! ```text
//! FILES → <src> → DESTINATION → <dst>
//!                 SIZE → <bytes>
//!                 WRITTEN → <bytes>
//! BW → <bytes/sec>    PERCENT → <cpu %>
//! COMMAND → RUN | STOP | EXIT
//! STATE → RUNNING | STOPPED | EXITING
//! FLAG → DONE
//! ```
//!
//! Completion is `WRITTEN == SIZE` for every queued file; the legacy
//! `DONE` flag is still written for mover compatibility but never read.

use std::path::Path;
use std::time::Duration;

use group::{Communicator, ReduceOp};
use kvtree::KvTree;

use crate::FlushError;

/// Commands the library writes for the mover.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Process the queued files.
    Run,
    /// Stop copying and acknowledge with `STATE → STOPPED`.
    Stop,
    /// Shut down entirely.
    Exit,
}

impl Command {
    /// Key string used in the transfer file.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "RUN",
            Self::Stop => "STOP",
            Self::Exit => "EXIT",
        }
    }
}

/// States the mover reports back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Copying.
    Running,
    /// Idle after a STOP.
    Stopped,
    /// Shutting down.
    Exiting,
}

impl State {
    /// Key string used in the transfer file.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Exiting => "EXITING",
        }
    }
}

/// Builds one queue entry for `src` heading to `dest`.
#[must_use]
pub fn file_entry(dest: &Path, size: u64) -> KvTree {
    let mut entry = KvTree::new();
    entry.set_str("DESTINATION", dest.to_string_lossy());
    entry.set_u64("SIZE", size);
    entry
}

/// Merges `files` (a `FILES`-shaped subtree) into the node's queue, sets
/// the bandwidth and CPU budgets when unset, switches the command to RUN,
/// and clears the legacy DONE flag.
pub fn enqueue(
    path: &Path,
    files: &KvTree,
    bw: f64,
    percent: f64,
) -> Result<(), FlushError> {
    let (lock, mut tree) = kvtree::file::lock_open_read(path)?;
    tree.ensure("FILES").merge(files.clone());
    if tree.get_f64("BW").is_none() {
        tree.set_str("BW", format!("{bw:.6}"));
    }
    if tree.get_f64("PERCENT").is_none() {
        tree.set_str("PERCENT", format!("{percent:.6}"));
    }
    tree.set_str("COMMAND", Command::Run.as_str());
    tree.unset_kv("FLAG", "DONE");
    kvtree::file::write_close_unlock(lock, &tree)?;
    Ok(())
}

/// Writes `command`; node master only.
pub fn command_set(
    path: &Path,
    command: Command,
    local: &dyn Communicator,
) -> Result<(), FlushError> {
    if local.rank() == 0 {
        let (lock, mut tree) = kvtree::file::lock_open_read(path)?;
        tree.set_str("COMMAND", command.as_str());
        kvtree::file::write_close_unlock(lock, &tree)?;
    }
    Ok(())
}

/// Progress of the queued transfer on this node.
#[derive(Clone, Copy, Debug, Default)]
pub struct Progress {
    /// All queued files fully written.
    pub complete: bool,
    /// Bytes written so far.
    pub bytes_written: u64,
}

/// Reads progress from the node's transfer file.
pub fn test(path: &Path) -> Result<Progress, FlushError> {
    let tree = kvtree::file::read_with_lock(path)?;
    let mut progress = Progress {
        complete: true,
        bytes_written: 0,
    };
    if let Some(files) = tree.get("FILES") {
        for (_, entry) in files.iter() {
            let size = entry.get_u64("SIZE").unwrap_or(0);
            let written = entry.get_u64("WRITTEN").unwrap_or(0);
            progress.bytes_written += written.min(size);
            if written != size {
                progress.complete = false;
            }
        }
    }
    Ok(progress)
}

/// Collective progress across the whole job: every node's master reads
/// its file; completion requires every node, bytes sum across nodes.
pub fn test_collective(
    path: &Path,
    local: &dyn Communicator,
    world: &dyn Communicator,
) -> Result<Progress, FlushError> {
    let mine = if local.rank() == 0 {
        test(path)?
    } else {
        Progress {
            complete: true,
            bytes_written: 0,
        }
    };
    let complete = world.alltrue(mine.complete)?;
    let bytes = world.allreduce_i64(mine.bytes_written as i64, ReduceOp::Sum)? as u64;
    Ok(Progress {
        complete,
        bytes_written: bytes,
    })
}

/// Removes the given source entries from the queue; node master only.
pub fn dequeue(
    path: &Path,
    sources: &[std::path::PathBuf],
    local: &dyn Communicator,
) -> Result<(), FlushError> {
    if local.rank() == 0 {
        let (lock, mut tree) = kvtree::file::lock_open_read(path)?;
        if let Some(files) = tree.get_mut("FILES") {
            for src in sources {
                files.unset(&src.to_string_lossy());
            }
            if files.is_empty() {
                tree.unset("FILES");
            }
        }
        kvtree::file::write_close_unlock(lock, &tree)?;
    }
    Ok(())
}

/// Empties the queue entirely; node master only.
pub fn clear_files(path: &Path, local: &dyn Communicator) -> Result<(), FlushError> {
    if local.rank() == 0 {
        let (lock, mut tree) = kvtree::file::lock_open_read(path)?;
        tree.unset("FILES");
        kvtree::file::write_close_unlock(lock, &tree)?;
    }
    Ok(())
}

/// Blocks until every node's mover reports `state`.
///
/// A transfer file with no `STATE` key counts as matching: it means no
/// mover ever picked up work on that node, so there is nothing to wait
/// out.
pub fn state_wait(
    path: &Path,
    state: State,
    local: &dyn Communicator,
    world: &dyn Communicator,
    interval: Duration,
) -> Result<(), FlushError> {
    loop {
        let matched = if local.rank() == 0 {
            let tree = kvtree::file::read_with_lock(path)?;
            match tree.get("STATE") {
                Some(current) => current.get(state.as_str()).is_some(),
                None => true,
            }
        } else {
            true
        };
        if world.alltrue(matched)? {
            return Ok(());
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use group::LocalWorld;
    use std::path::PathBuf;

    #[test]
    fn enqueue_test_dequeue_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.scr");
        let comm = LocalWorld::new(1).into_comms().pop().unwrap();

        let mut files = KvTree::new();
        files.set("/cache/a", file_entry(Path::new("/pfs/a"), 10));
        files.set("/cache/b", file_entry(Path::new("/pfs/b"), 4));
        enqueue(&path, &files, 1000.0, 0.0).unwrap();

        let progress = test(&path).unwrap();
        assert!(!progress.complete);
        assert_eq!(progress.bytes_written, 0);

        // play the mover: finish one file, half of the other
        let (lock, mut tree) = kvtree::file::lock_open_read(&path).unwrap();
        tree.get_mut("FILES")
            .unwrap()
            .get_mut("/cache/a")
            .unwrap()
            .set_u64("WRITTEN", 10);
        tree.get_mut("FILES")
            .unwrap()
            .get_mut("/cache/b")
            .unwrap()
            .set_u64("WRITTEN", 2);
        kvtree::file::write_close_unlock(lock, &tree).unwrap();

        let progress = test(&path).unwrap();
        assert!(!progress.complete);
        assert_eq!(progress.bytes_written, 12);

        dequeue(&path, &[PathBuf::from("/cache/b")], &comm).unwrap();
        assert!(test(&path).unwrap().complete);

        clear_files(&path, &comm).unwrap();
        command_set(&path, Command::Stop, &comm).unwrap();
        let tree = kvtree::file::read_with_lock(&path).unwrap();
        assert_eq!(tree.get_str("COMMAND"), Some("STOP"));
        assert!(tree.get("FILES").is_none());
    }
}
