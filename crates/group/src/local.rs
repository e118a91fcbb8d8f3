use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::{Communicator, GroupError};

/// Message queues and split bookkeeping shared by every communicator that
/// descends from one [`LocalWorld`].
#[derive(Debug)]
struct Hub {
    /// One FIFO per (communicator, sender, receiver) triple.
    channels: Mutex<ChannelMap>,
    /// Pending split rendezvous, keyed by (communicator, split sequence).
    splits: Mutex<HashMap<(u64, u64), SplitState>>,
    split_done: Condvar,
    next_comm: AtomicU64,
}

type ChannelMap = HashMap<(u64, usize, usize), (Sender<Vec<u8>>, Receiver<Vec<u8>>)>;

#[derive(Debug, Default)]
struct SplitState {
    entries: Vec<(usize, i64, i64)>,
    expected: usize,
    /// comm rank -> (new comm id, member world ranks, rank within new comm)
    results: Option<HashMap<usize, (u64, Vec<usize>, usize)>>,
    consumed: usize,
}

impl Hub {
    fn endpoint(&self, key: (u64, usize, usize)) -> (Sender<Vec<u8>>, Receiver<Vec<u8>>) {
        let mut map = self.channels.lock().expect("hub poisoned");
        map.entry(key).or_insert_with(unbounded).clone()
    }
}

/// An in-process job: `n` ranks wired together through shared queues.
///
/// Each rank runs on its own thread and drives its [`LocalComm`] exactly as
/// it would drive a binding to a real runtime. Used by the test suite and
/// by single-process tools.
#[derive(Debug)]
pub struct LocalWorld {
    comms: Vec<LocalComm>,
}

impl LocalWorld {
    /// Creates a world of `n` ranks.
    #[must_use]
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "world must hold at least one rank");
        let hub = Arc::new(Hub {
            channels: Mutex::new(HashMap::new()),
            splits: Mutex::new(HashMap::new()),
            split_done: Condvar::new(),
            next_comm: AtomicU64::new(1),
        });
        let members: Vec<usize> = (0..n).collect();
        let comms = (0..n)
            .map(|rank| LocalComm {
                hub: Arc::clone(&hub),
                comm_id: 0,
                members: members.clone(),
                my_rank: rank,
                split_seq: AtomicU64::new(0),
            })
            .collect();
        Self { comms }
    }

    /// Hands out the per-rank communicators, one per thread.
    #[must_use]
    pub fn into_comms(self) -> Vec<LocalComm> {
        self.comms
    }
}

/// One rank's endpoint of an in-process communicator.
#[derive(Debug)]
pub struct LocalComm {
    hub: Arc<Hub>,
    comm_id: u64,
    members: Vec<usize>,
    my_rank: usize,
    split_seq: AtomicU64,
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.my_rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn send(&self, dest: usize, bytes: &[u8]) -> Result<(), GroupError> {
        if dest >= self.members.len() {
            return Err(GroupError::RankOutOfRange {
                rank: dest,
                size: self.members.len(),
            });
        }
        let (tx, _rx) = self.hub.endpoint((self.comm_id, self.my_rank, dest));
        tx.send(bytes.to_vec())
            .map_err(|_| GroupError::PeerUnavailable(format!("rank {dest} hung up")))
    }

    fn recv(&self, src: usize) -> Result<Vec<u8>, GroupError> {
        if src >= self.members.len() {
            return Err(GroupError::RankOutOfRange {
                rank: src,
                size: self.members.len(),
            });
        }
        let (_tx, rx) = self.hub.endpoint((self.comm_id, src, self.my_rank));
        rx.recv()
            .map_err(|_| GroupError::PeerUnavailable(format!("rank {src} hung up")))
    }

    fn split(&self, color: i64, key: i64) -> Result<Box<dyn Communicator>, GroupError> {
        let seq = self.split_seq.fetch_add(1, Ordering::SeqCst);
        let split_key = (self.comm_id, seq);

        let mut splits = self.hub.splits.lock().expect("hub poisoned");
        let state = splits.entry(split_key).or_insert_with(|| SplitState {
            expected: self.members.len(),
            ..SplitState::default()
        });
        state.entries.push((self.my_rank, color, key));

        if state.entries.len() == state.expected {
            // last arrival computes every sub-communicator
            let mut by_color: BTreeMap<i64, Vec<(i64, usize, usize)>> = BTreeMap::new();
            for &(comm_rank, c, k) in &state.entries {
                by_color
                    .entry(c)
                    .or_default()
                    .push((k, self.members[comm_rank], comm_rank));
            }
            let mut results = HashMap::new();
            for group in by_color.values_mut() {
                group.sort_unstable();
                let new_id = self.hub.next_comm.fetch_add(1, Ordering::SeqCst);
                let world_ranks: Vec<usize> = group.iter().map(|&(_, w, _)| w).collect();
                for (idx, &(_, _, comm_rank)) in group.iter().enumerate() {
                    results.insert(comm_rank, (new_id, world_ranks.clone(), idx));
                }
            }
            state.results = Some(results);
            self.hub.split_done.notify_all();
        }

        let (new_id, members, my_rank) = loop {
            if let Some(results) = splits
                .get_mut(&split_key)
                .and_then(|state| state.results.as_mut())
            {
                let mine = results
                    .remove(&self.my_rank)
                    .expect("split result missing for rank");
                let state = splits.get_mut(&split_key).expect("split state vanished");
                state.consumed += 1;
                if state.consumed == state.expected {
                    splits.remove(&split_key);
                }
                break mine;
            }
            splits = self
                .hub
                .split_done
                .wait(splits)
                .expect("hub poisoned");
        };

        Ok(Box::new(LocalComm {
            hub: Arc::clone(&self.hub),
            comm_id: new_id,
            members,
            my_rank,
            split_seq: AtomicU64::new(0),
        }))
    }

    fn member_world_ranks(&self) -> Vec<usize> {
        self.members.clone()
    }

    fn abort(&self, code: i32, msg: &str) -> ! {
        // In-process stand-in for a job-wide abort: bring down this test
        // harness loudly rather than killing the whole process.
        panic!("abort (code {code}) from rank {}: {msg}", self.my_rank);
    }
}
