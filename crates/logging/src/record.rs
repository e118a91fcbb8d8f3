use std::path::Path;

use kvtree::KvTree;

use crate::LogError;

/// One event row: something notable happened at a point in time.
#[derive(Clone, Debug, Default)]
pub struct EventRecord {
    /// Event type, e.g. `CHECKPOINT COMPLETED` or `FLUSH FAILED`.
    pub kind: String,
    /// Free-form note, often a directory or base path.
    pub note: Option<String>,
    /// Dataset the event concerns.
    pub dataset: Option<u64>,
    /// Epoch seconds when the event started.
    pub start: Option<u64>,
    /// Duration in seconds.
    pub secs: Option<f64>,
}

/// One transfer row: bytes moved between two locations.
#[derive(Clone, Debug, Default)]
pub struct TransferRecord {
    /// Transfer type, e.g. `FLUSH`, `FETCH`, `CHECKPOINT`.
    pub kind: String,
    /// Source path or base.
    pub from: Option<String>,
    /// Destination path or base.
    pub to: Option<String>,
    /// Dataset the transfer concerns.
    pub dataset: Option<u64>,
    /// Epoch seconds when the transfer started.
    pub start: Option<u64>,
    /// Duration in seconds.
    pub secs: Option<f64>,
    /// Bytes moved.
    pub bytes: Option<u64>,
}

impl EventRecord {
    fn to_tree(&self) -> KvTree {
        let mut tree = KvTree::new();
        tree.set_str("TYPE", &self.kind);
        if let Some(note) = &self.note {
            tree.set_str("NOTE", note);
        }
        if let Some(dataset) = self.dataset {
            tree.set_u64("DSET", dataset);
        }
        if let Some(start) = self.start {
            tree.set_u64("START", start);
        }
        if let Some(secs) = self.secs {
            tree.set_str("SECS", format!("{secs:.6}"));
        }
        tree
    }
}

impl TransferRecord {
    fn to_tree(&self) -> KvTree {
        let mut tree = KvTree::new();
        tree.set_str("TYPE", &self.kind);
        if let Some(from) = &self.from {
            tree.set_str("FROM", from);
        }
        if let Some(to) = &self.to {
            tree.set_str("TO", to);
        }
        if let Some(dataset) = self.dataset {
            tree.set_u64("DSET", dataset);
        }
        if let Some(start) = self.start {
            tree.set_u64("START", start);
        }
        if let Some(secs) = self.secs {
            tree.set_str("SECS", format!("{secs:.6}"));
        }
        if let Some(bytes) = self.bytes {
            tree.set_u64("BYTES", bytes);
        }
        tree
    }
}

/// Appends an event row to the record log under `prefix`.
pub fn log_event(prefix: &Path, record: &EventRecord) -> Result<(), LogError> {
    crate::append_record(prefix, "EVENT", record.to_tree())
}

/// Appends a transfer row to the record log under `prefix`.
pub fn log_transfer(prefix: &Path, record: &TransferRecord) -> Result<(), LogError> {
    crate::append_record(prefix, "TRANSFER", record.to_tree())
}

/// Reads the whole record log; missing log reads as empty.
pub fn read_log(prefix: &Path) -> Result<KvTree, LogError> {
    let path = crate::log_path(prefix);
    Ok(KvTree::read_file_if_exists(&path)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path();

        log_event(
            prefix,
            &EventRecord {
                kind: "FLUSH STARTED".into(),
                dataset: Some(4),
                ..EventRecord::default()
            },
        )
        .unwrap();
        log_event(
            prefix,
            &EventRecord {
                kind: "FLUSH SUCCEEDED".into(),
                dataset: Some(4),
                secs: Some(1.5),
                ..EventRecord::default()
            },
        )
        .unwrap();
        log_transfer(
            prefix,
            &TransferRecord {
                kind: "FLUSH".into(),
                bytes: Some(4096),
                ..TransferRecord::default()
            },
        )
        .unwrap();

        let log = read_log(prefix).unwrap();
        let events = log.get("EVENT").unwrap();
        assert_eq!(events.int_keys(), vec![0, 1]);
        assert_eq!(
            events.get_int(1).unwrap().get_str("TYPE"),
            Some("FLUSH SUCCEEDED")
        );
        assert_eq!(
            log.get("TRANSFER").unwrap().get_int(0).unwrap().get_u64("BYTES"),
            Some(4096)
        );
    }
}
