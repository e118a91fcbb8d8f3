use crate::{Communicator, GroupError};

/// The three communicators SCR derives once per run: the world, the ranks
/// sharing this node, and the ranks sharing this node-local position
/// across nodes (the "level" group).
///
/// Node membership is decided by hostname: every rank ships its hostname
/// to rank 0, the full list comes back by broadcast, and ranks with equal
/// hostnames share a node. The level group is what redundancy descriptors
/// split further into partner pairs and XOR sets, so that peers always
/// land on different nodes when enough nodes exist.
#[derive(Debug)]
pub struct Topology {
    world: Box<dyn Communicator>,
    local: Box<dyn Communicator>,
    level: Box<dyn Communicator>,
    hostname: String,
}

impl Topology {
    /// Builds the node-local and level groups from `world`.
    ///
    /// `hostname` identifies this node; tests pass synthetic names to lay
    /// ranks out across pretend nodes.
    pub fn build(
        world: Box<dyn Communicator>,
        hostname: impl Into<String>,
    ) -> Result<Self, GroupError> {
        let hostname = hostname.into();
        let rank = world.rank();
        let size = world.size();

        let mut packed = if rank == 0 {
            let mut names = vec![hostname.clone()];
            for peer in 1..size {
                let bytes = world.recv(peer)?;
                names.push(String::from_utf8_lossy(&bytes).into_owned());
            }
            names.join("\n").into_bytes()
        } else {
            world.send(0, hostname.as_bytes())?;
            Vec::new()
        };
        world.bcast(0, &mut packed)?;
        let names: Vec<&str> = std::str::from_utf8(&packed)
            .map_err(|_| GroupError::Inconsistent("hostname list not UTF-8".into()))?
            .split('\n')
            .collect();
        if names.len() != size {
            return Err(GroupError::Inconsistent(format!(
                "gathered {} hostnames for {size} ranks",
                names.len()
            )));
        }

        // same hostname, same node: color by the first rank on the node
        let color = names
            .iter()
            .position(|&name| name == hostname)
            .expect("own hostname in gathered list") as i64;
        let local = world.split(color, rank as i64)?;
        let level = world.split(local.rank() as i64, rank as i64)?;

        Ok(Self {
            world,
            local,
            level,
            hostname,
        })
    }

    /// The job-wide communicator.
    #[must_use]
    pub fn world(&self) -> &dyn Communicator {
        self.world.as_ref()
    }

    /// Ranks on this node.
    #[must_use]
    pub fn local(&self) -> &dyn Communicator {
        self.local.as_ref()
    }

    /// Ranks sharing this node-local position across nodes.
    #[must_use]
    pub fn level(&self) -> &dyn Communicator {
        self.level.as_ref()
    }

    /// This node's hostname.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Rank within the world.
    #[must_use]
    pub fn rank_world(&self) -> usize {
        self.world.rank()
    }

    /// World size.
    #[must_use]
    pub fn ranks_world(&self) -> usize {
        self.world.size()
    }

    /// Rank on this node.
    #[must_use]
    pub fn rank_local(&self) -> usize {
        self.local.rank()
    }

    /// Ranks on this node.
    #[must_use]
    pub fn ranks_local(&self) -> usize {
        self.local.size()
    }

    /// Rank within the level group.
    #[must_use]
    pub fn rank_level(&self) -> usize {
        self.level.rank()
    }

    /// Size of the level group.
    #[must_use]
    pub fn ranks_level(&self) -> usize {
        self.level.size()
    }

    /// Number of nodes in the job: the widest level group.
    pub fn num_nodes(&self) -> Result<usize, GroupError> {
        let max = self
            .world
            .allreduce_i64(self.ranks_level() as i64, crate::ReduceOp::Max)?;
        Ok(max as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalWorld;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn two_nodes_of_two_ranks() {
        let world = LocalWorld::new(4);
        let hosts = Arc::new(["node0", "node0", "node1", "node1"]);

        let handles: Vec<_> = world
            .into_comms()
            .into_iter()
            .map(|comm| {
                let hosts = Arc::clone(&hosts);
                thread::spawn(move || {
                    let rank = comm.rank();
                    let topo = Topology::build(Box::new(comm), hosts[rank]).unwrap();
                    assert_eq!(topo.ranks_local(), 2);
                    assert_eq!(topo.ranks_level(), 2);
                    assert_eq!(topo.rank_local(), rank % 2);
                    assert_eq!(topo.rank_level(), rank / 2);
                    assert_eq!(topo.num_nodes().unwrap(), 2);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
