#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! The halt file tells a running job to exit at its next opportunity. It
//! lives in the control directory, is shared between the library and the
//! `scr_halt_cntl` tool (possibly run by an operator mid-job), and is
//! always accessed as a locked read-modify-write so concurrent edits
//! merge instead of clobbering each other.
//!
//! Five fields drive the decision: an explicit `EXIT_REASON`, a countdown
//! of `CHECKPOINTS` left, a time window (`EXIT_BEFORE` / `EXIT_AFTER`),
//! and `SECS`, the margin to leave before the allocation ends when a
//! remaining-seconds oracle is available.

use std::path::Path;

use kvtree::KvTree;
use thiserror::Error;

/// Key for the operator-supplied exit reason.
pub const KEY_EXIT_REASON: &str = "EXIT_REASON";
/// Key for the halt-seconds margin.
pub const KEY_SECONDS: &str = "SECS";
/// Key for the exit-before epoch time.
pub const KEY_EXIT_BEFORE: &str = "EXIT_BEFORE";
/// Key for the exit-after epoch time.
pub const KEY_EXIT_AFTER: &str = "EXIT_AFTER";
/// Key for the checkpoints-left countdown.
pub const KEY_CHECKPOINTS: &str = "CHECKPOINTS";

/// Error raised by halt file operations.
#[derive(Debug, Error)]
pub enum HaltError {
    /// Tree-store failure underneath.
    #[error(transparent)]
    Tree(#[from] kvtree::KvTreeError),
}

/// Why the job must halt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HaltReason {
    /// The remaining-seconds oracle dipped below the halt margin.
    TimeLimit,
    /// An explicit reason was planted in the halt file.
    Reason(String),
    /// The checkpoints-left countdown reached zero.
    NoCheckpointsLeft,
    /// Wall clock passed `EXIT_BEFORE - SECS`.
    ExitBefore,
    /// Wall clock passed `EXIT_AFTER`.
    ExitAfter,
}

impl HaltReason {
    /// Canonical string recorded back into the halt file.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::TimeLimit => "TIME_LIMIT",
            Self::Reason(reason) => reason,
            Self::NoCheckpointsLeft => "NO_CHECKPOINTS_LEFT",
            Self::ExitBefore => "EXIT_BEFORE_TIME",
            Self::ExitAfter => "EXIT_AFTER_TIME",
        }
    }
}

/// In-memory halt values, kept in sync with the halt file.
#[derive(Clone, Debug, Default)]
pub struct HaltState {
    values: KvTree,
}

impl HaltState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps already-read halt values, e.g. for the CLI tools.
    #[must_use]
    pub fn from_values(values: KvTree) -> Self {
        Self { values }
    }

    /// Seeds the halt-seconds margin before the first sync.
    pub fn set_halt_seconds(&mut self, secs: u64) {
        self.values.set_u64(KEY_SECONDS, secs);
    }

    /// Plants an exit reason, as [`sync_and_decrement`](Self::sync_and_decrement)
    /// will write it out.
    pub fn set_reason(&mut self, reason: &str) {
        self.values.set_str(KEY_EXIT_REASON, reason);
    }

    /// Current values.
    #[must_use]
    pub fn values(&self) -> &KvTree {
        &self.values
    }

    /// Locked read-modify-write against the halt file.
    ///
    /// File values win over in-memory values (an operator's edits take
    /// effect), except that an in-memory exit reason survives when the
    /// file has none, since the library itself plants reasons that must
    /// not be lost. `CHECKPOINTS`, when present, is decremented by
    /// `decrement`.
    pub fn sync_and_decrement(&mut self, path: &Path, decrement: u64) -> Result<(), HaltError> {
        let (lock, file_tree) = kvtree::file::lock_open_read(path)?;

        let my_reason = self.values.get_str(KEY_EXIT_REASON).map(str::to_owned);
        if !file_tree.is_empty() {
            let file_reason = file_tree.get_str(KEY_EXIT_REASON).map(str::to_owned);
            self.values = file_tree;
            if let (Some(reason), None) = (my_reason, file_reason) {
                self.values.set_str(KEY_EXIT_REASON, reason);
            }
        }

        if let Some(left) = self.values.get_i64(KEY_CHECKPOINTS) {
            self.values
                .set_i64(KEY_CHECKPOINTS, left - decrement as i64);
        }

        kvtree::file::write_close_unlock(lock, &self.values)?;
        Ok(())
    }

    /// Evaluates the halt conditions.
    ///
    /// `now` is epoch seconds; `secs_remaining` comes from the optional
    /// oracle (`None` when no oracle is wired in).
    #[must_use]
    pub fn check(&self, now: u64, secs_remaining: Option<u64>) -> Option<HaltReason> {
        let halt_seconds = self.values.get_u64(KEY_SECONDS).unwrap_or(0);

        if halt_seconds > 0 {
            if let Some(remaining) = secs_remaining {
                if remaining <= halt_seconds {
                    return Some(HaltReason::TimeLimit);
                }
            }
        }

        if let Some(reason) = self.values.get_str(KEY_EXIT_REASON) {
            if !reason.is_empty() {
                return Some(HaltReason::Reason(reason.to_owned()));
            }
        }

        if self.values.get_i64(KEY_CHECKPOINTS) == Some(0) {
            return Some(HaltReason::NoCheckpointsLeft);
        }

        if let Some(before) = self.values.get_u64(KEY_EXIT_BEFORE) {
            if now >= before.saturating_sub(halt_seconds) {
                return Some(HaltReason::ExitBefore);
            }
        }

        if let Some(after) = self.values.get_u64(KEY_EXIT_AFTER) {
            if now >= after {
                return Some(HaltReason::ExitAfter);
            }
        }

        None
    }
}

/// Reads the halt file under lock; missing file reads as empty.
pub fn read(path: &Path) -> Result<KvTree, HaltError> {
    if !path.exists() {
        return Ok(KvTree::new());
    }
    Ok(kvtree::file::read_with_lock(path)?)
}

/// Applies `edit` to the halt file under lock.
pub fn update(path: &Path, edit: impl FnOnce(&mut KvTree)) -> Result<(), HaltError> {
    let (lock, mut tree) = kvtree::file::lock_open_read(path)?;
    edit(&mut tree);
    kvtree::file::write_close_unlock(lock, &tree)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("halt.scr");

        // operator plants a countdown
        update(&path, |tree| tree.set_i64(KEY_CHECKPOINTS, 2)).unwrap();

        let mut state = HaltState::new();
        state.set_halt_seconds(600);
        state.sync_and_decrement(&path, 1).unwrap();

        // file won: the countdown exists and was decremented; our local
        // halt-seconds value was replaced by the file contents
        assert_eq!(state.values().get_i64(KEY_CHECKPOINTS), Some(1));
        assert_eq!(state.check(0, None), None);

        state.sync_and_decrement(&path, 1).unwrap();
        assert_eq!(state.check(0, None), Some(HaltReason::NoCheckpointsLeft));
    }

    #[test]
    fn memory_reason_survives_when_file_has_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("halt.scr");

        update(&path, |tree| tree.set_u64(KEY_SECONDS, 30)).unwrap();

        let mut state = HaltState::new();
        state.set_reason("SCR_FINALIZE_CALLED");
        state.sync_and_decrement(&path, 0).unwrap();

        assert_eq!(
            state.check(0, None),
            Some(HaltReason::Reason("SCR_FINALIZE_CALLED".into()))
        );
        let on_disk = read(&path).unwrap();
        assert_eq!(on_disk.get_str(KEY_EXIT_REASON), Some("SCR_FINALIZE_CALLED"));
    }

    #[test]
    fn time_window_conditions() {
        let mut state = HaltState::new();
        state.set_halt_seconds(60);

        let mut tree = KvTree::new();
        tree.set_u64(KEY_SECONDS, 60);
        tree.set_u64(KEY_EXIT_BEFORE, 1000);
        state.values = tree;

        assert_eq!(state.check(900, None), None);
        assert_eq!(state.check(940, None), Some(HaltReason::ExitBefore));

        // oracle says only 45 seconds left, inside the 60 second margin
        assert_eq!(state.check(0, Some(45)), Some(HaltReason::TimeLimit));
    }
}
