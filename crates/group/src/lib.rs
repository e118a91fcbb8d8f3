#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `group` defines the contract SCR expects from its SPMD runtime: an
//! ordered collection of cooperating ranks with point-to-point messaging
//! and collectives. The library never talks to a message-passing runtime
//! directly; everything above this crate is written against the
//! [`Communicator`] trait, so an MPI binding, a PMIx binding, or the
//! in-process [`LocalComm`] used by the test suite are interchangeable.
//!
//! # Design
//!
//! Only five operations are primitive: `send`, `recv`, `split`,
//! `member_world_ranks`, and `abort`. Every collective (barrier,
//! broadcast, all-reduce, all-gather, all-to-all, sendrecv) has a default
//! implementation in terms of the primitives, funneling through rank 0 of
//! the communicator. A native binding is expected to override these with
//! the runtime's own collectives; the defaults exist so that a minimal
//! binding is correct before it is fast.
//!
//! # Invariants
//!
//! - All ranks of a communicator execute the same sequence of collective
//!   calls (SPMD discipline); the library upholds this for its own calls
//!   and assumes it of the embedding application.
//! - Messages between a fixed (sender, receiver) pair are delivered in
//!   order.
//! - `abort` does not return; it must bring down every rank of the job.

use std::fmt;

mod local;
mod topology;

pub use local::{LocalComm, LocalWorld};
pub use topology::Topology;

/// Reduction operators for [`Communicator::allreduce_i64`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    /// Arithmetic sum.
    Sum,
    /// Maximum.
    Max,
    /// Minimum.
    Min,
    /// Logical AND of nonzero-ness.
    LogicalAnd,
}

impl ReduceOp {
    fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            Self::Sum => a + b,
            Self::Max => a.max(b),
            Self::Min => a.min(b),
            Self::LogicalAnd => i64::from(a != 0 && b != 0),
        }
    }
}

/// Error raised by group operations.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// A peer rank is gone or the runtime link is down.
    #[error("group peer unavailable: {0}")]
    PeerUnavailable(String),

    /// A rank argument is outside the communicator.
    #[error("rank {rank} out of range for communicator of size {size}")]
    RankOutOfRange {
        /// Offending rank.
        rank: usize,
        /// Communicator size.
        size: usize,
    },

    /// A collective was called with inconsistent arguments across ranks.
    #[error("inconsistent collective: {0}")]
    Inconsistent(String),
}

/// One ordered collection of cooperating ranks.
///
/// `rank()` is this process's position within the communicator; world-rank
/// translation goes through [`Communicator::member_world_ranks`].
pub trait Communicator: Send + fmt::Debug {
    /// This process's rank within the communicator.
    fn rank(&self) -> usize;

    /// Number of ranks in the communicator.
    fn size(&self) -> usize;

    /// Sends `bytes` to `dest` (rank within this communicator).
    fn send(&self, dest: usize, bytes: &[u8]) -> Result<(), GroupError>;

    /// Receives the next message from `src`.
    fn recv(&self, src: usize) -> Result<Vec<u8>, GroupError>;

    /// Splits the communicator; ranks supplying the same `color` land in
    /// the same sub-communicator, ordered by `key` (ties by world rank).
    fn split(&self, color: i64, key: i64) -> Result<Box<dyn Communicator>, GroupError>;

    /// World ranks of every member, indexed by communicator rank.
    fn member_world_ranks(&self) -> Vec<usize>;

    /// Terminates every rank of the job.
    fn abort(&self, code: i32, msg: &str) -> !;

    /// World rank of `rank` within this communicator.
    fn world_rank_of(&self, rank: usize) -> Result<usize, GroupError> {
        self.member_world_ranks()
            .get(rank)
            .copied()
            .ok_or(GroupError::RankOutOfRange {
                rank,
                size: self.size(),
            })
    }

    /// Simultaneously sends to one optional peer and receives from another.
    ///
    /// Matches the paired nonblocking send/receive the codecs use for ring
    /// traffic; with either side absent it degenerates to a plain send or
    /// receive.
    fn sendrecv(
        &self,
        send: Option<(usize, &[u8])>,
        recv_from: Option<usize>,
    ) -> Result<Option<Vec<u8>>, GroupError> {
        if let Some((dest, bytes)) = send {
            self.send(dest, bytes)?;
        }
        recv_from.map(|src| self.recv(src)).transpose()
    }

    /// Blocks until every rank has entered the barrier.
    fn barrier(&self) -> Result<(), GroupError> {
        let size = self.size();
        if size <= 1 {
            return Ok(());
        }
        if self.rank() == 0 {
            for peer in 1..size {
                self.recv(peer)?;
            }
            for peer in 1..size {
                self.send(peer, &[])?;
            }
        } else {
            self.send(0, &[])?;
            self.recv(0)?;
        }
        Ok(())
    }

    /// Broadcasts `bytes` from `root` to every rank.
    fn bcast(&self, root: usize, bytes: &mut Vec<u8>) -> Result<(), GroupError> {
        if root >= self.size() {
            return Err(GroupError::RankOutOfRange {
                rank: root,
                size: self.size(),
            });
        }
        if self.rank() == root {
            for peer in 0..self.size() {
                if peer != root {
                    self.send(peer, bytes)?;
                }
            }
        } else {
            *bytes = self.recv(root)?;
        }
        Ok(())
    }

    /// Reduces one `i64` per rank with `op`; every rank gets the result.
    fn allreduce_i64(&self, value: i64, op: ReduceOp) -> Result<i64, GroupError> {
        let mut acc = value;
        if self.rank() == 0 {
            for peer in 1..self.size() {
                acc = op.apply(acc, i64_from_bytes(&self.recv(peer)?)?);
            }
        } else {
            self.send(0, &value.to_le_bytes())?;
        }
        let mut bytes = acc.to_le_bytes().to_vec();
        self.bcast(0, &mut bytes)?;
        i64_from_bytes(&bytes)
    }

    /// Gathers one `i64` per rank; every rank gets the full vector.
    fn allgather_i64(&self, value: i64) -> Result<Vec<i64>, GroupError> {
        let size = self.size();
        let mut packed = vec![0u8; size * 8];
        if self.rank() == 0 {
            packed[..8].copy_from_slice(&value.to_le_bytes());
            for peer in 1..size {
                let bytes = self.recv(peer)?;
                i64_from_bytes(&bytes)?;
                packed[peer * 8..peer * 8 + 8].copy_from_slice(&bytes);
            }
        } else {
            self.send(0, &value.to_le_bytes())?;
        }
        self.bcast(0, &mut packed)?;
        packed
            .chunks_exact(8)
            .map(i64_from_bytes)
            .collect::<Result<Vec<_>, _>>()
    }

    /// Personalized exchange: element `i` of `values` goes to rank `i`;
    /// the result holds one element from every rank.
    fn alltoall_i64(&self, values: &[i64]) -> Result<Vec<i64>, GroupError> {
        let size = self.size();
        if values.len() != size {
            return Err(GroupError::Inconsistent(format!(
                "alltoall with {} values on communicator of size {size}",
                values.len()
            )));
        }
        let me = self.rank();
        for (peer, value) in values.iter().enumerate() {
            if peer != me {
                self.send(peer, &value.to_le_bytes())?;
            }
        }
        let mut out = vec![0i64; size];
        out[me] = values[me];
        for peer in 0..size {
            if peer != me {
                out[peer] = i64_from_bytes(&self.recv(peer)?)?;
            }
        }
        Ok(out)
    }

    /// All-reduce AND over a per-rank flag: the collective consensus every
    /// multi-rank operation forms before acting on its outcome.
    fn alltrue(&self, flag: bool) -> Result<bool, GroupError> {
        Ok(self.allreduce_i64(i64::from(flag), ReduceOp::LogicalAnd)? != 0)
    }
}

fn i64_from_bytes(bytes: &[u8]) -> Result<i64, GroupError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| GroupError::Inconsistent(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(i64::from_le_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_ranks<F>(n: usize, f: F)
    where
        F: Fn(LocalComm) + Send + Sync + 'static,
    {
        let world = LocalWorld::new(n);
        let f = std::sync::Arc::new(f);
        let handles: Vec<_> = world
            .into_comms()
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                thread::spawn(move || f(comm))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn allreduce_ops() {
        run_ranks(4, |comm| {
            let rank = comm.rank() as i64;
            assert_eq!(comm.allreduce_i64(rank, ReduceOp::Sum).unwrap(), 6);
            assert_eq!(comm.allreduce_i64(rank, ReduceOp::Max).unwrap(), 3);
            assert_eq!(comm.allreduce_i64(rank, ReduceOp::Min).unwrap(), 0);
            assert_eq!(comm.allreduce_i64(rank, ReduceOp::LogicalAnd).unwrap(), 0);
            assert!(comm.alltrue(true).unwrap());
            assert!(!comm.alltrue(comm.rank() != 2).unwrap());
        });
    }

    #[test]
    fn alltoall_transposes() {
        run_ranks(3, |comm| {
            let me = comm.rank() as i64;
            let send: Vec<i64> = (0..3).map(|dst| me * 10 + dst).collect();
            let recv = comm.alltoall_i64(&send).unwrap();
            let expect: Vec<i64> = (0..3).map(|src| src * 10 + me).collect();
            assert_eq!(recv, expect);
        });
    }

    #[test]
    fn split_groups_by_color() {
        run_ranks(4, |comm| {
            let color = (comm.rank() % 2) as i64;
            let sub = comm.split(color, comm.rank() as i64).unwrap();
            assert_eq!(sub.size(), 2);
            let world_ranks = sub.member_world_ranks();
            let expect: Vec<usize> = if color == 0 { vec![0, 2] } else { vec![1, 3] };
            assert_eq!(world_ranks, expect);
            sub.barrier().unwrap();
        });
    }
}
