//! Dataset descriptor: the job-level identity of one checkpoint or
//! output set, carried in the summary and index files.

use kvtree::KvTree;

/// Identity and attributes of one dataset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dataset {
    /// Monotonically increasing id within the job.
    pub id: u64,
    /// Name, conventionally the PFS directory name once flushed.
    pub name: String,
    /// Epoch seconds when the dataset was created.
    pub created: u64,
    /// Owning user.
    pub user: Option<String>,
    /// Job id the dataset was written under.
    pub jobid: Option<String>,
    /// Job name, tying runs of the same campaign together.
    pub jobname: Option<String>,
    /// Total bytes across all ranks (informational).
    pub size: u64,
    /// Total file count across all ranks (informational).
    pub files: usize,
    /// Whether the dataset is a checkpoint (restartable).
    pub is_checkpoint: bool,
    /// Whether the dataset is user-visible output.
    pub is_output: bool,
}

impl Dataset {
    /// Serializes the descriptor.
    #[must_use]
    pub fn to_tree(&self) -> KvTree {
        let mut tree = KvTree::new();
        tree.set_u64("ID", self.id);
        tree.set_str("NAME", &self.name);
        tree.set_u64("CREATED", self.created);
        if let Some(user) = &self.user {
            tree.set_str("USER", user);
        }
        if let Some(jobid) = &self.jobid {
            tree.set_str("JOBID", jobid);
        }
        if let Some(jobname) = &self.jobname {
            tree.set_str("JOBNAME", jobname);
        }
        tree.set_u64("SIZE", self.size);
        tree.set_u64("FILES", self.files as u64);
        tree.set_u64("CKPT", u64::from(self.is_checkpoint));
        tree.set_u64("OUTPUT", u64::from(self.is_output));
        tree
    }

    /// Rebuilds a descriptor from its tree; unknown fields default.
    #[must_use]
    pub fn from_tree(tree: &KvTree) -> Self {
        Self {
            id: tree.get_u64("ID").unwrap_or(0),
            name: tree.get_str("NAME").unwrap_or_default().to_owned(),
            created: tree.get_u64("CREATED").unwrap_or(0),
            user: tree.get_str("USER").map(str::to_owned),
            jobid: tree.get_str("JOBID").map(str::to_owned),
            jobname: tree.get_str("JOBNAME").map(str::to_owned),
            size: tree.get_u64("SIZE").unwrap_or(0),
            files: tree.get_u64("FILES").unwrap_or(0) as usize,
            is_checkpoint: tree.get_u64("CKPT").unwrap_or(0) != 0,
            is_output: tree.get_u64("OUTPUT").unwrap_or(0) != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_round_trip() {
        let dataset = Dataset {
            id: 7,
            name: "scr.1970-01-01_00:00:00.job42.7".into(),
            created: 1234,
            user: Some("alice".into()),
            jobid: Some("job42".into()),
            jobname: None,
            size: 1 << 20,
            files: 16,
            is_checkpoint: true,
            is_output: false,
        };
        assert_eq!(Dataset::from_tree(&dataset.to_tree()), dataset);
    }
}
