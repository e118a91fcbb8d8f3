//! Redundancy descriptors.
//!
//! A descriptor fixes, for one cadence of datasets, which scheme protects
//! them, which storage base they land in, and the group of ranks that
//! cooperate. Groups derive from the level communicator so that ring
//! neighbours sit on different nodes; when they do not (too few nodes),
//! the descriptor disables itself, and disablement is collective.

use std::path::{Path, PathBuf};

use group::{Communicator, ReduceOp, Topology};
use kvtree::KvTree;

use crate::RedundancyError;

/// Redundancy scheme applied within a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    /// Files stay on the writing node only.
    Local,
    /// Full copy mirrored to a peer node.
    Partner,
    /// One parity chunk per rank across an XOR set.
    Xor,
}

impl Scheme {
    /// Parses the configuration spelling (case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "LOCAL" => Some(Self::Local),
            "PARTNER" => Some(Self::Partner),
            "XOR" => Some(Self::Xor),
            _ => None,
        }
    }

    /// Canonical spelling used in persisted trees.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::Partner => "PARTNER",
            Self::Xor => "XOR",
        }
    }
}

/// Configuration for one descriptor, before group construction.
#[derive(Clone, Debug)]
pub struct DescriptorConfig {
    /// Whether the descriptor participates at all.
    pub enabled: bool,
    /// Position in the descriptor table.
    pub index: usize,
    /// Apply this descriptor to datasets whose id it divides.
    pub interval: u64,
    /// Storage base the cache directory lives under.
    pub base: PathBuf,
    /// Cache directory for this descriptor.
    pub directory: PathBuf,
    /// Scheme to apply.
    pub scheme: Scheme,
    /// Node distance to partners.
    pub hop_distance: usize,
    /// Ranks per XOR set.
    pub set_size: usize,
}

/// A ring neighbour within a redundancy group.
#[derive(Clone, Debug)]
pub struct Peer {
    /// Rank within the group communicator.
    pub rank: usize,
    /// World rank.
    pub world_rank: usize,
    /// Hostname of the peer's node.
    pub hostname: String,
}

/// A fully constructed redundancy descriptor.
#[derive(Debug)]
pub struct Descriptor {
    /// Whether the descriptor survived construction checks everywhere.
    pub enabled: bool,
    /// Position in the descriptor table.
    pub index: usize,
    /// Dataset cadence.
    pub interval: u64,
    /// Storage base.
    pub base: PathBuf,
    /// Cache directory.
    pub directory: PathBuf,
    /// Scheme in force.
    pub scheme: Scheme,
    /// Node distance to partners.
    pub hop_distance: usize,
    /// Ranks per XOR set.
    pub set_size: usize,
    /// The redundancy group.
    pub comm: Box<dyn Communicator>,
    /// World rank of the group's rank 0, used as a stable group id.
    pub group_id: usize,
    /// Number of groups across the job.
    pub groups: usize,
    /// Left ring neighbour.
    pub lhs: Option<Peer>,
    /// Right ring neighbour.
    pub rhs: Option<Peer>,
}

impl Descriptor {
    /// Builds the descriptor's group from configuration, exchanging
    /// hostnames with ring neighbours and collectively disabling when a
    /// neighbour lands on this node.
    pub fn create(config: &DescriptorConfig, topo: &Topology) -> Result<Self, RedundancyError> {
        let mut scheme = config.scheme;

        // all ranks on one node: inter-node schemes cannot help
        if topo.ranks_local() == topo.ranks_world() && scheme != Scheme::Local {
            scheme = Scheme::Local;
        }

        let comm = match scheme {
            Scheme::Local => topo
                .world()
                .split(topo.rank_world() as i64, 0)?,
            Scheme::Partner => topo.level().split(0, topo.rank_level() as i64)?,
            Scheme::Xor => {
                let hop = config.hop_distance.max(1);
                let set = config.set_size.max(2);
                let rel_rank = topo.rank_level() / hop;
                let mod_rank = topo.rank_level() % hop;
                let split_id = (rel_rank / set) * hop + mod_rank;
                topo.level()
                    .split(split_id as i64, topo.rank_world() as i64)?
            }
        };

        Self::finish(config, scheme, comm, topo, config.enabled)
    }

    /// Rebuilds a descriptor from the tree a filemap stored, reusing the
    /// recorded group membership instead of re-deriving the split.
    pub fn from_stored(tree: &KvTree, topo: &Topology) -> Result<Self, RedundancyError> {
        let missing = |key: &str| RedundancyError::Config(format!("stored descriptor lacks {key}"));
        let scheme = tree
            .get_str("TYPE")
            .and_then(Scheme::parse)
            .ok_or_else(|| missing("TYPE"))?;
        let group_id = tree.get_u64("GROUP_ID").ok_or_else(|| missing("GROUP_ID"))?;
        let group_rank = tree
            .get_u64("GROUP_RANK")
            .ok_or_else(|| missing("GROUP_RANK"))?;

        let config = DescriptorConfig {
            enabled: tree.get_u64("ENABLED").is_none_or(|v| v != 0),
            index: tree.get_u64("INDEX").unwrap_or(0) as usize,
            interval: tree.get_u64("INTERVAL").unwrap_or(1),
            base: PathBuf::from(tree.get_str("BASE").ok_or_else(|| missing("BASE"))?),
            directory: PathBuf::from(tree.get_str("DIR").ok_or_else(|| missing("DIR"))?),
            scheme,
            hop_distance: tree.get_u64("HOP").unwrap_or(1) as usize,
            set_size: tree.get_u64("SET_SIZE").unwrap_or(2) as usize,
        };

        let comm = topo.world().split(group_id as i64, group_rank as i64)?;
        Self::finish(&config, scheme, comm, topo, config.enabled)
    }

    fn finish(
        config: &DescriptorConfig,
        scheme: Scheme,
        comm: Box<dyn Communicator>,
        topo: &Topology,
        enabled_in: bool,
    ) -> Result<Self, RedundancyError> {
        let group_id = comm.world_rank_of(0)?;
        let group_master = i64::from(comm.rank() == 0);
        let groups = topo.world().allreduce_i64(group_master, ReduceOp::Sum)? as usize;

        let mut enabled = enabled_in;
        let (lhs, rhs) = match scheme {
            Scheme::Local => {
                let me = Peer {
                    rank: comm.rank(),
                    world_rank: topo.rank_world(),
                    hostname: topo.hostname().to_owned(),
                };
                (Some(me.clone()), Some(me))
            }
            Scheme::Partner => set_partners(comm.as_ref(), config.hop_distance, topo.hostname())?,
            Scheme::Xor => set_partners(comm.as_ref(), 1, topo.hostname())?,
        };

        if scheme != Scheme::Local {
            let bad = |peer: &Option<Peer>| {
                peer.as_ref()
                    .is_none_or(|p| p.hostname.is_empty() || p.hostname == topo.hostname())
            };
            if bad(&lhs) || bad(&rhs) {
                enabled = false;
            }
        }

        // disabling is collective: one rank without a safe partner
        // disables the descriptor for everyone
        enabled = topo.world().alltrue(enabled)?;

        Ok(Self {
            enabled,
            index: config.index,
            interval: config.interval.max(1),
            base: config.base.clone(),
            directory: config.directory.clone(),
            scheme,
            hop_distance: config.hop_distance,
            set_size: config.set_size,
            comm,
            group_id,
            groups,
            lhs,
            rhs,
        })
    }

    /// Serializes everything a restart needs to reconstitute the group.
    #[must_use]
    pub fn to_tree(&self) -> KvTree {
        let mut tree = KvTree::new();
        tree.set_u64("ENABLED", u64::from(self.enabled));
        tree.set_u64("INDEX", self.index as u64);
        tree.set_u64("INTERVAL", self.interval);
        tree.set_str("BASE", self.base.to_string_lossy());
        tree.set_str("DIR", self.directory.to_string_lossy());
        tree.set_str("TYPE", self.scheme.as_str());
        tree.set_u64("HOP", self.hop_distance as u64);
        tree.set_u64("SET_SIZE", self.set_size as u64);
        tree.set_u64("GROUPS", self.groups as u64);
        tree.set_u64("GROUP_ID", self.group_id as u64);
        tree.set_u64("GROUP_SIZE", self.comm.size() as u64);
        tree.set_u64("GROUP_RANK", self.comm.rank() as u64);
        tree
    }

    /// Cache directory for `dataset` under this descriptor.
    #[must_use]
    pub fn dataset_dir(&self, dataset: u64) -> PathBuf {
        self.directory.join(format!("checkpoint.{dataset}"))
    }

    /// Name of this rank's XOR chunk file for `dataset`.
    #[must_use]
    pub fn chunk_file(&self, dataset: u64) -> PathBuf {
        self.dataset_dir(dataset).join(format!(
            "{}_of_{}_in_{}.xor",
            self.comm.rank() + 1,
            self.comm.size(),
            self.group_id
        ))
    }
}

/// Computes ring neighbours at `dist` within `comm` and exchanges
/// hostnames with them.
fn set_partners(
    comm: &dyn Communicator,
    dist: usize,
    hostname: &str,
) -> Result<(Option<Peer>, Option<Peer>), RedundancyError> {
    let n = comm.size();
    let me = comm.rank();
    let dist = dist % n.max(1);
    let lhs = (me + n - dist) % n;
    let rhs = (me + dist) % n;

    // shift hostnames right, then left
    let lhs_host = comm
        .sendrecv(Some((rhs, hostname.as_bytes())), Some(lhs))?
        .unwrap_or_default();
    let rhs_host = comm
        .sendrecv(Some((lhs, hostname.as_bytes())), Some(rhs))?
        .unwrap_or_default();

    let peer = |rank: usize, host: Vec<u8>| -> Result<Peer, RedundancyError> {
        Ok(Peer {
            rank,
            world_rank: comm.world_rank_of(rank)?,
            hostname: String::from_utf8_lossy(&host).into_owned(),
        })
    };
    Ok((Some(peer(lhs, lhs_host)?), Some(peer(rhs, rhs_host)?)))
}

/// Picks the descriptor protecting `dataset`: the enabled entry with the
/// largest interval dividing the id.
#[must_use]
pub fn select_for_dataset(descriptors: &[Descriptor], dataset: u64) -> Option<&Descriptor> {
    descriptors
        .iter()
        .filter(|d| d.enabled && dataset % d.interval == 0)
        .max_by_key(|d| d.interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use group::LocalWorld;

    fn config(index: usize, interval: u64, scheme: Scheme) -> DescriptorConfig {
        DescriptorConfig {
            enabled: true,
            index,
            interval,
            base: PathBuf::from("/tmp"),
            directory: PathBuf::from("/tmp/cache"),
            scheme,
            hop_distance: 1,
            set_size: 8,
        }
    }

    fn single_rank_descriptors(intervals: &[u64], scheme: Scheme) -> Vec<Descriptor> {
        let comm = LocalWorld::new(1).into_comms().pop().unwrap();
        let topo = Topology::build(Box::new(comm), "node0").unwrap();
        intervals
            .iter()
            .enumerate()
            .map(|(i, &interval)| Descriptor::create(&config(i, interval, scheme), &topo).unwrap())
            .collect()
    }

    #[test]
    fn single_node_demotes_to_local() {
        let descs = single_rank_descriptors(&[1], Scheme::Xor);
        assert_eq!(descs[0].scheme, Scheme::Local);
        assert!(descs[0].enabled);
        // LOCAL rings point at self
        assert_eq!(descs[0].lhs.as_ref().unwrap().world_rank, 0);
        assert_eq!(descs[0].rhs.as_ref().unwrap().world_rank, 0);
    }

    #[test]
    fn interval_selection_prefers_largest_divisor() {
        let descs = single_rank_descriptors(&[1, 10], Scheme::Local);
        for id in 1..=100u64 {
            let picked = select_for_dataset(&descs, id).unwrap();
            if id % 10 == 0 {
                assert_eq!(picked.interval, 10, "dataset {id}");
            } else {
                assert_eq!(picked.interval, 1, "dataset {id}");
            }
        }
    }

    #[test]
    fn stored_descriptor_round_trips() {
        let comm = LocalWorld::new(1).into_comms().pop().unwrap();
        let topo = Topology::build(Box::new(comm), "node0").unwrap();
        let desc = Descriptor::create(&config(0, 5, Scheme::Local), &topo).unwrap();

        let stored = desc.to_tree();
        let back = Descriptor::from_stored(&stored, &topo).unwrap();
        assert_eq!(back.scheme, Scheme::Local);
        assert_eq!(back.interval, 5);
        assert_eq!(back.group_id, desc.group_id);
        assert_eq!(back.base, desc.base);
    }
}
