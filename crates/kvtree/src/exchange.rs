//! Tree exchange over a [`Communicator`].
//!
//! Point-to-point transfers ship the packed tree in one message. The
//! sparse all-to-all ([`exchange`]) runs Bruck's index algorithm: log2(n)
//! rounds, where round `k` forwards every queued packet whose relative
//! destination has bit `k` set to the rank `2^k` to the right. Each rank
//! sends to only a handful of destinations, so forwarding beats posting
//! n-squared point-to-point messages.

use group::{Communicator, GroupError};

use crate::{KvTree, KvTreeError};

/// Sends `tree` to `dest`.
pub fn send(tree: &KvTree, dest: usize, comm: &dyn Communicator) -> Result<(), KvTreeError> {
    comm.send(dest, &tree.pack())?;
    Ok(())
}

/// Receives a tree from `src`.
pub fn recv(src: usize, comm: &dyn Communicator) -> Result<KvTree, KvTreeError> {
    let bytes = comm.recv(src)?;
    KvTree::unpack(&bytes)
}

/// Sends to one optional peer while receiving from another.
pub fn sendrecv(
    tree_send: Option<(&KvTree, usize)>,
    recv_from: Option<usize>,
    comm: &dyn Communicator,
) -> Result<Option<KvTree>, KvTreeError> {
    let packed = tree_send.map(|(tree, dest)| (dest, tree.pack()));
    let incoming = comm.sendrecv(
        packed.as_ref().map(|(dest, bytes)| (*dest, bytes.as_slice())),
        recv_from,
    )?;
    incoming.map(|bytes| KvTree::unpack(&bytes)).transpose()
}

/// Broadcasts `tree` from `root`; other ranks' trees are replaced.
pub fn bcast(tree: &mut KvTree, root: usize, comm: &dyn Communicator) -> Result<(), KvTreeError> {
    let mut bytes = if comm.rank() == root {
        tree.pack()
    } else {
        Vec::new()
    };
    comm.bcast(root, &mut bytes)?;
    if comm.rank() != root {
        *tree = KvTree::unpack(&bytes)?;
    }
    Ok(())
}

/// One in-flight bundle of messages bound for a single destination rank.
struct Packet {
    dest: usize,
    /// (original sender, packed tree) pairs accumulated while forwarding.
    elems: Vec<(usize, Vec<u8>)>,
}

/// Sparse all-to-all: the top-level integer keys of `tree_send` name
/// destination ranks, each holding the tree bound for that rank. The
/// result's top-level keys name source ranks.
///
/// Duplicate destinations cannot arise from a tree (keys are unique), but
/// merged forwarding is checked anyway; a duplicate is an internal
/// invariant breach.
pub fn exchange(tree_send: &KvTree, comm: &dyn Communicator) -> Result<KvTree, KvTreeError> {
    let rank = comm.rank();
    let size = comm.size();

    let mut packets: Vec<Packet> = Vec::with_capacity(tree_send.len());
    for (key, sub) in tree_send.iter() {
        let dest: usize = key
            .parse()
            .map_err(|_| KvTreeError::corrupt(format!("exchange destination key '{key}'")))?;
        if dest >= size {
            return Err(GroupError::RankOutOfRange { rank: dest, size }.into());
        }
        if packets.iter().any(|p| p.dest == dest) {
            return Err(KvTreeError::DuplicateDestination { rank: dest });
        }
        packets.push(Packet {
            dest,
            elems: vec![(rank, sub.pack())],
        });
    }

    let mut factor = 1;
    while factor < size {
        let dst = (rank + factor) % size;
        let src = (rank + size - factor) % size;

        // keep packets whose relative destination has this round's bit
        // clear, forward the rest
        let (forward, keep): (Vec<Packet>, Vec<Packet>) = packets
            .into_iter()
            .partition(|p| ((p.dest + size - rank) % size / factor) % 2 == 1);

        let outgoing = serialize_packets(&forward);
        let incoming = comm
            .sendrecv(Some((dst, &outgoing)), Some(src))?
            .unwrap_or_default();
        packets = keep;
        for packet in deserialize_packets(&incoming)? {
            match packets.iter_mut().find(|p| p.dest == packet.dest) {
                Some(existing) => existing.elems.extend(packet.elems),
                None => packets.push(packet),
            }
        }

        factor *= 2;
    }

    let mut tree_recv = KvTree::new();
    for packet in packets {
        if packet.dest != rank {
            return Err(KvTreeError::corrupt(format!(
                "exchange delivered rank {} data to rank {rank}",
                packet.dest
            )));
        }
        for (src_rank, bytes) in packet.elems {
            let sub = KvTree::unpack(&bytes)?;
            tree_recv.set(src_rank.to_string(), sub);
        }
    }
    Ok(tree_recv)
}

fn serialize_packets(packets: &[Packet]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(packets.len() as u32).to_le_bytes());
    for packet in packets {
        buf.extend_from_slice(&(packet.dest as u32).to_le_bytes());
        buf.extend_from_slice(&(packet.elems.len() as u32).to_le_bytes());
        for (src, bytes) in &packet.elems {
            buf.extend_from_slice(&(*src as u32).to_le_bytes());
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
    }
    buf
}

fn deserialize_packets(buf: &[u8]) -> Result<Vec<Packet>, KvTreeError> {
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    let mut offset = 0;
    let mut next_u32 = |offset: &mut usize| -> Result<u32, KvTreeError> {
        let bytes: [u8; 4] = buf
            .get(*offset..*offset + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| KvTreeError::corrupt("exchange packet header"))?;
        *offset += 4;
        Ok(u32::from_le_bytes(bytes))
    };

    let npackets = next_u32(&mut offset)?;
    let mut packets = Vec::with_capacity(npackets as usize);
    for _ in 0..npackets {
        let dest = next_u32(&mut offset)? as usize;
        let nelems = next_u32(&mut offset)?;
        let mut elems = Vec::with_capacity(nelems as usize);
        for _ in 0..nelems {
            let src = next_u32(&mut offset)? as usize;
            let len = next_u32(&mut offset)? as usize;
            let bytes = buf
                .get(offset..offset + len)
                .ok_or_else(|| KvTreeError::corrupt("exchange packet payload"))?
                .to_vec();
            offset += len;
            elems.push((src, bytes));
        }
        packets.push(Packet { dest, elems });
    }
    if offset != buf.len() {
        return Err(KvTreeError::corrupt("exchange packet trailing bytes"));
    }
    Ok(packets)
}
