#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! Two logging surfaces share this crate:
//!
//! - **Diagnostics**: rank/host-prefixed messages on stderr, with debug
//!   output gated by a verbosity level (0 silences everything but
//!   errors). Messages are mirrored into `tracing` so embedding
//!   applications with a subscriber installed see structured events.
//! - **Records**: durable event and transfer rows appended to
//!   `<prefix>/.scr/log.scr` under the advisory lock. These are what the
//!   `scr_log_event` / `scr_log_transfer` tools write and what an external
//!   SQL shipper would drain; the SQL backend itself is out of scope.

use std::path::{Path, PathBuf};

use kvtree::KvTree;
use thiserror::Error;

mod record;

pub use record::{EventRecord, TransferRecord, log_event, log_transfer, read_log};

/// Error raised when appending log records.
#[derive(Debug, Error)]
pub enum LogError {
    /// Tree-store failure underneath.
    #[error(transparent)]
    Tree(#[from] kvtree::KvTreeError),

    /// File-level failure.
    #[error(transparent)]
    Io(#[from] fileio::FileIoError),
}

/// Installs a `tracing` subscriber suitable for the CLI tools.
///
/// `RUST_LOG` wins when set; otherwise `debug_level` maps to `error`,
/// `info`, `debug`, or `trace`.
pub fn init(debug_level: u8) {
    let default = match debug_level {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Per-process diagnostic context: who is speaking and how loudly.
#[derive(Clone, Debug)]
pub struct Diag {
    rank: usize,
    host: String,
    level: u8,
}

impl Diag {
    /// Creates a context for `rank` on `host` with verbosity `level`.
    #[must_use]
    pub fn new(rank: usize, host: impl Into<String>, level: u8) -> Self {
        Self {
            rank,
            host: host.into(),
            level,
        }
    }

    /// A silent context for places that need one before init completes.
    #[must_use]
    pub fn quiet() -> Self {
        Self::new(0, "", 0)
    }

    /// Configured verbosity level.
    #[must_use]
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Prints an error with the rank/host prefix; never filtered.
    pub fn err(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::error!(rank = self.rank, host = %self.host, "{msg}");
        eprintln!("SCR ERROR on {} rank {}: {msg}", self.host, self.rank);
    }

    /// Prints a debug message when `level` is within the configured
    /// verbosity.
    pub fn dbg(&self, level: u8, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::debug!(rank = self.rank, host = %self.host, "{msg}");
        if level <= self.level {
            eprintln!("SCR on {} rank {}: {msg}", self.host, self.rank);
        }
    }
}

/// Epoch seconds right now.
#[must_use]
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Renders epoch seconds as `YYYY-MM-DDTHH:MM:SS` for index records.
#[must_use]
pub fn format_timestamp(epoch_secs: u64) -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second]"
    );
    time::OffsetDateTime::from_unix_timestamp(epoch_secs as i64)
        .ok()
        .and_then(|t| t.format(format).ok())
        .unwrap_or_else(|| epoch_secs.to_string())
}

/// Renders epoch seconds as `YYYY-MM-DD_HH:MM:SS` for dataset directory
/// names.
#[must_use]
pub fn format_dirstamp(epoch_secs: u64) -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]_[hour]:[minute]:[second]"
    );
    time::OffsetDateTime::from_unix_timestamp(epoch_secs as i64)
        .ok()
        .and_then(|t| t.format(format).ok())
        .unwrap_or_else(|| epoch_secs.to_string())
}

/// Path of the record log under a PFS prefix.
#[must_use]
pub fn log_path(prefix: &Path) -> PathBuf {
    prefix.join(".scr").join("log.scr")
}

pub(crate) fn append_record(
    prefix: &Path,
    section: &str,
    record: KvTree,
) -> Result<(), LogError> {
    let path = log_path(prefix);
    if let Some(parent) = path.parent() {
        fileio::mkdir_p(parent)?;
    }
    let (lock, mut tree) = kvtree::file::lock_open_read(&path)?;
    let rows = tree.ensure(section);
    let next = rows.int_keys().last().map_or(0, |n| n + 1);
    rows.set(next.to_string(), record);
    kvtree::file::write_close_unlock(lock, &tree)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_format() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00");
        assert_eq!(format_dirstamp(86461), "1970-01-02_00:01:01");
    }
}
