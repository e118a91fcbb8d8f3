//! Shared harness for multi-rank integration tests: each rank runs on
//! its own thread over an in-process communicator, with per-node control
//! and cache directories standing in for node-local storage.

use std::path::{Path, PathBuf};
use std::time::Duration;

use engine::InitOptions;
use group::{LocalComm, LocalWorld};

pub const USER: &str = "tester";
pub const JOBID: &str = "job1";

/// A pretend cluster laid out under one scratch directory.
pub struct Cluster {
    pub base: PathBuf,
    pub ranks: usize,
    pub ranks_per_node: usize,
}

impl Cluster {
    pub fn new(base: &Path, ranks: usize, ranks_per_node: usize) -> Self {
        assert_eq!(ranks % ranks_per_node, 0, "uneven node layout");
        Self {
            base: base.to_path_buf(),
            ranks,
            ranks_per_node,
        }
    }

    pub fn node_of(&self, rank: usize) -> usize {
        rank / self.ranks_per_node
    }

    pub fn hostname(&self, rank: usize) -> String {
        format!("node{}", self.node_of(rank))
    }

    pub fn node_dir(&self, node: usize) -> PathBuf {
        self.base.join(format!("node{node}"))
    }

    pub fn prefix(&self) -> PathBuf {
        self.base.join("pfs")
    }

    /// Control directory of `node`, as the engine lays it out.
    pub fn cntl_dir(&self, node: usize) -> PathBuf {
        self.node_dir(node)
            .join("cntl")
            .join(USER)
            .join(format!("scr.{JOBID}"))
    }

    /// Cache directory of `node` for `dataset` under descriptor 0.
    pub fn dataset_dir(&self, node: usize, dataset: u64) -> PathBuf {
        self.node_dir(node)
            .join("cache")
            .join(USER)
            .join(format!("scr.{JOBID}"))
            .join("index.0")
            .join(format!("checkpoint.{dataset}"))
    }

    /// Init options for `rank` with the given extra parameter settings.
    pub fn options(&self, rank: usize, extra: &[(&str, &str)]) -> InitOptions {
        let node = self.node_of(rank);
        let mut overrides = vec![
            ("SCR_USER_NAME".to_owned(), USER.to_owned()),
            ("SCR_JOB_ID".to_owned(), JOBID.to_owned()),
            (
                "SCR_CNTL_BASE".to_owned(),
                self.node_dir(node).join("cntl").display().to_string(),
            ),
            (
                "SCR_CACHE_BASE".to_owned(),
                self.node_dir(node).join("cache").display().to_string(),
            ),
            ("SCR_PREFIX".to_owned(), self.prefix().display().to_string()),
            ("SCR_FLUSH".to_owned(), "0".to_owned()),
            ("SCR_LOG_ENABLE".to_owned(), "0".to_owned()),
        ];
        for (key, value) in extra {
            overrides.push(((*key).to_owned(), (*value).to_owned()));
        }
        InitOptions {
            hostname: Some(self.hostname(rank)),
            overrides,
            halt_exits: false,
            poll_interval: Duration::from_millis(50),
            ..InitOptions::default()
        }
    }

    /// Removes the halt files a graceful finalize left behind, the way
    /// an operator resets a completed allocation before rerunning it.
    pub fn clear_halt_files(&self) {
        for node in 0..(self.ranks / self.ranks_per_node) {
            let _ = std::fs::remove_file(self.cntl_dir(node).join("halt.scr"));
        }
    }

    /// Deletes every cached file belonging to `rank` in `dataset`,
    /// payloads, chunks, and sidecars alike — the wipeout a node failure
    /// would cause for that rank.
    pub fn kill_rank_files(&self, rank: usize, dataset: u64) {
        let dir = self.dataset_dir(self.node_of(rank), dataset);
        let entries = std::fs::read_dir(&dir).expect("dataset dir readable");
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "scr") {
                continue;
            }
            if meta::read(&path).is_ok_and(|m| m.rank == rank) {
                std::fs::remove_file(&path).expect("remove payload");
                meta::incomplete(&path);
            }
        }
    }
}

/// Runs one closure per rank, each on its own thread.
pub fn run_ranks<F>(ranks: usize, f: F)
where
    F: Fn(usize, LocalComm) + Send + Sync,
{
    let comms = LocalWorld::new(ranks).into_comms();
    std::thread::scope(|scope| {
        for comm in comms {
            let f = &f;
            scope.spawn(move || {
                let rank = group::Communicator::rank(&comm);
                f(rank, comm);
            });
        }
    });
}

/// Deterministic payload for `rank`, `len` bytes.
pub fn pattern(rank: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((rank * 31 + i) % 251) as u8).collect()
}
