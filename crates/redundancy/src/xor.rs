//! XOR codec: reduce-scatter encode and pipelined rebuild.
//!
//! Each rank in a set of `k` owns one chunk file holding the XOR of every
//! other rank's slice at that chunk's offset. Any single rank's files can
//! then be reconstructed by XOR-ing the surviving ranks' data and parity
//! along the ring. Chunk files start with a length-prefixed tree header
//! carrying the dataset id, the set membership, the chunk size, and the
//! meta records of both this rank and its left neighbour, so a rebuilt
//! rank can relearn what it is supposed to hold from its right neighbour.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use group::{Communicator, ReduceOp};
use kvtree::KvTree;
use meta::{FileKind, FileMeta};

use crate::partner::sendrecv_count;
use crate::{CodecCtx, Descriptor, RedundancyError};

/// Header written ahead of the parity bytes in every chunk file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XorHeader {
    /// World size when the dataset was encoded.
    pub ranks_world: usize,
    /// World ranks of the set members, in ring order.
    pub group_ranks: Vec<usize>,
    /// This rank's position in the ring.
    pub group_rank: usize,
    /// Dataset the chunk belongs to.
    pub dataset: u64,
    /// Bytes of parity following the header.
    pub chunk_size: u64,
    /// World rank owning this chunk.
    pub current_rank: usize,
    /// Meta records of this rank's files.
    pub current: Vec<FileMeta>,
    /// World rank of the left neighbour.
    pub partner_rank: usize,
    /// Meta records of the left neighbour's files.
    pub partner: Vec<FileMeta>,
}

pub(crate) fn metas_to_tree(rank: usize, metas: &[FileMeta]) -> KvTree {
    let mut tree = KvTree::new();
    tree.set_u64("RANK", rank as u64);
    tree.set_u64("FILES", metas.len() as u64);
    let files = tree.ensure("FILE");
    for (i, meta) in metas.iter().enumerate() {
        files.set(i.to_string(), meta.to_tree());
    }
    tree
}

pub(crate) fn metas_from_tree(
    tree: &KvTree,
    origin: &Path,
) -> Result<(usize, Vec<FileMeta>), RedundancyError> {
    let bad = || RedundancyError::Config(format!("bad meta list in '{}'", origin.display()));
    let rank = tree.get_u64("RANK").ok_or_else(bad)? as usize;
    let count = tree.get_u64("FILES").ok_or_else(bad)? as usize;
    let mut metas = Vec::with_capacity(count);
    for i in 0..count {
        let sub = tree
            .get("FILE")
            .and_then(|f| f.get_int(i as i64))
            .ok_or_else(bad)?;
        metas.push(FileMeta::from_tree(sub, origin)?);
    }
    Ok((rank, metas))
}

impl XorHeader {
    fn to_tree(&self) -> KvTree {
        let mut tree = KvTree::new();
        tree.set_u64("RANKS", self.ranks_world as u64);
        tree.set_u64("DSET", self.dataset);
        tree.set_u64("CHUNK", self.chunk_size);
        let group = tree.ensure("GROUP");
        group.set_u64("RANK", self.group_rank as u64);
        let members = group.ensure("RANKS");
        for (i, world_rank) in self.group_ranks.iter().enumerate() {
            members.set_str(i.to_string(), world_rank.to_string());
        }
        tree.set(
            "CURRENT",
            metas_to_tree(self.current_rank, &self.current),
        );
        tree.set(
            "PARTNER",
            metas_to_tree(self.partner_rank, &self.partner),
        );
        tree
    }

    fn from_tree(tree: &KvTree, origin: &Path) -> Result<Self, RedundancyError> {
        let bad = |what: &str| {
            RedundancyError::Config(format!("chunk header '{}' lacks {what}", origin.display()))
        };
        let group = tree.get("GROUP").ok_or_else(|| bad("GROUP"))?;
        let members = group.get("RANKS").ok_or_else(|| bad("GROUP RANKS"))?;
        let mut group_ranks = Vec::with_capacity(members.len());
        for i in 0..members.len() {
            group_ranks.push(
                members
                    .get_u64(&i.to_string())
                    .ok_or_else(|| bad("group member"))? as usize,
            );
        }
        let (current_rank, current) =
            metas_from_tree(tree.get("CURRENT").ok_or_else(|| bad("CURRENT"))?, origin)?;
        let (partner_rank, partner) =
            metas_from_tree(tree.get("PARTNER").ok_or_else(|| bad("PARTNER"))?, origin)?;
        Ok(Self {
            ranks_world: tree.get_u64("RANKS").ok_or_else(|| bad("RANKS"))? as usize,
            group_ranks,
            group_rank: group.get_u64("RANK").ok_or_else(|| bad("GROUP RANK"))? as usize,
            dataset: tree.get_u64("DSET").ok_or_else(|| bad("DSET"))?,
            chunk_size: tree.get_u64("CHUNK").ok_or_else(|| bad("CHUNK"))?,
            current_rank,
            current,
            partner_rank,
            partner,
        })
    }

    /// Writes the length-prefixed header at the file's current position.
    pub fn write_to(&self, file: &mut File) -> Result<(), RedundancyError> {
        let packed = self.to_tree().pack();
        file.write_all(&(packed.len() as u64).to_le_bytes())?;
        file.write_all(&packed)?;
        Ok(())
    }

    /// Reads a header from the file's current position, leaving the
    /// position at the first parity byte.
    pub fn read_from(file: &mut File, origin: &Path) -> Result<Self, RedundancyError> {
        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;
        let mut packed = vec![0u8; len];
        file.read_exact(&mut packed)?;
        let tree = KvTree::unpack(&packed)?;
        Self::from_tree(&tree, origin)
    }
}

/// Finds this rank's chunk file for `dataset` by inspecting sidecars.
#[must_use]
pub fn find_chunk_file(map: &filemap::Filemap, dataset: u64, rank: usize) -> Option<PathBuf> {
    map.files(dataset, rank)
        .into_iter()
        .find(|file| meta::read(file).is_ok_and(|m| m.kind == FileKind::XorChunk))
}

fn open_error(action: &'static str, path: &Path, source: std::io::Error) -> RedundancyError {
    fileio::FileIoError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
    .into()
}

fn xor_into(acc: &mut [u8], incoming: &[u8]) {
    for (a, b) in acc.iter_mut().zip(incoming) {
        *a ^= *b;
    }
}

/// Reduce-scatter encode: after this call, this rank's chunk file holds
/// the parity of its slice across the whole set.
pub fn encode_xor(
    ctx: &mut CodecCtx<'_>,
    desc: &Descriptor,
    dataset: u64,
) -> Result<(), RedundancyError> {
    let me_world = ctx.world.rank();
    let ranks_world = ctx.world.size();
    let comm = desc.comm.as_ref();
    let k = comm.size();
    let my_rank = comm.rank();
    if k < 2 {
        return Err(RedundancyError::Config(
            "XOR set smaller than two ranks".into(),
        ));
    }
    let lhs = desc.lhs.as_ref().expect("xor descriptor has lhs");
    let rhs = desc.rhs.as_ref().expect("xor descriptor has rhs");

    // open my files and collect their meta for the chunk header
    let files = ctx.map.files(dataset, me_world);
    let mut metas = Vec::with_capacity(files.len());
    let mut sizes = Vec::with_capacity(files.len());
    let mut fds = Vec::with_capacity(files.len());
    let mut my_bytes = 0u64;
    for file in &files {
        let m = meta::read(file)?;
        let size = fileio::file_size(file)?;
        my_bytes += size;
        sizes.push(size);
        metas.push(m);
        fds.push(File::open(file).map_err(|e| open_error("open", file, e))?);
    }

    // remember the left neighbour's descriptor so a restart can
    // reconstitute its group even if that node is the one that died
    let lhs_desc =
        kvtree::exchange::sendrecv(Some((&desc.to_tree(), rhs.rank)), Some(lhs.rank), comm)?
            .expect("descriptor from lhs");
    ctx.map.set_desc(dataset, lhs.world_rank, lhs_desc);
    ctx.persist_map()?;

    let max_bytes = comm.allreduce_i64(my_bytes as i64, ReduceOp::Max)? as u64;
    let chunk_size = max_bytes.div_ceil(k as u64 - 1).max(1);

    let chunk_path = desc.chunk_file(dataset);
    ctx.map.add_file(dataset, me_world, &chunk_path);
    ctx.persist_map()?;
    let mut chunk = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&chunk_path)
        .map_err(|e| open_error("create", &chunk_path, e))?;

    // swap file counts and meta records with ring neighbours
    let _num_lhs = sendrecv_count(comm, (rhs.rank, files.len()), lhs.rank)?;
    let partner_tree = kvtree::exchange::sendrecv(
        Some((&metas_to_tree(me_world, &metas), rhs.rank)),
        Some(lhs.rank),
        comm,
    )?
    .expect("meta records from lhs");
    let (partner_rank, partner) = metas_from_tree(&partner_tree, &chunk_path)?;

    let header = XorHeader {
        ranks_world,
        group_ranks: comm.member_world_ranks(),
        group_rank: my_rank,
        dataset,
        chunk_size,
        current_rank: me_world,
        current: metas,
        partner_rank,
        partner,
    };
    header.write_to(&mut chunk)?;

    // reduce-scatter: rotate slices rightward, each rank keeps the parity
    // of the slice it owns
    let mut send_buf = vec![0u8; ctx.buf_size.max(1)];
    let mut recv_buf = vec![0u8; ctx.buf_size.max(1)];
    let mut nread = 0u64;
    while nread < chunk_size {
        let count = ((chunk_size - nread) as usize).min(ctx.buf_size.max(1));
        for chunk_id in (0..k).rev() {
            if chunk_id > 0 {
                // slice of the logical file this chunk_id covers from my
                // point of view (my own slice is skipped)
                let mut rel = (my_rank + chunk_id) % k;
                if rel > my_rank {
                    rel -= 1;
                }
                let offset = chunk_size * rel as u64 + nread;
                fileio::read_pad_n(&mut fds, &sizes, offset, &mut send_buf[..count])?;
            } else {
                send_buf[..count].fill(0);
            }

            if chunk_id < k - 1 {
                xor_into(&mut send_buf[..count], &recv_buf[..count]);
            }

            if chunk_id > 0 {
                let incoming = comm
                    .sendrecv(Some((rhs.rank, &send_buf[..count])), Some(lhs.rank))?
                    .expect("ring data from lhs");
                recv_buf[..incoming.len()].copy_from_slice(&incoming);
            } else {
                chunk.write_all(&send_buf[..count])?;
            }
        }
        nread += count as u64;
    }
    chunk.sync_all()?;
    drop(chunk);
    drop(fds);

    let chunk_meta = FileMeta::for_file(
        &chunk_path,
        me_world,
        ranks_world,
        dataset,
        FileKind::XorChunk,
        true,
    )?;
    meta::complete(&chunk_path, &chunk_meta)?;
    if ctx.crc_on_copy {
        meta::compute_crc(&chunk_path)?;
    }

    Ok(())
}

/// Checks whether the set can absorb its losses and runs the rebuild if
/// exactly one rank is missing.
pub fn attempt_rebuild_xor(
    ctx: &mut CodecCtx<'_>,
    desc: &Descriptor,
    dataset: u64,
) -> Result<(), RedundancyError> {
    let me = ctx.world.rank();
    let ranks = ctx.world.size();
    let comm = desc.comm.as_ref();

    let mut have = filemap::have_files(ctx.map, dataset, me, ranks, false);
    if find_chunk_file(ctx.map, dataset, me).is_none() {
        have = false;
    }
    let need_rebuild = !have;

    let total = comm.allreduce_i64(i64::from(need_rebuild), ReduceOp::Sum)?;
    if !ctx.world.alltrue(total <= 1)? {
        ctx.diag.dbg(
            1,
            format!("dataset {dataset}: more than one failure in an XOR set"),
        );
        return Err(RedundancyError::Exceeded { dataset });
    }

    let mut ok = true;
    if total > 0 {
        let root = comm.allreduce_i64(
            if need_rebuild { comm.rank() as i64 } else { -1 },
            ReduceOp::Max,
        )? as usize;
        if need_rebuild {
            ctx.diag.dbg(1, "rebuilding files from XOR segments");
        }
        if let Err(err) = rebuild_xor(ctx, desc, dataset, root) {
            ctx.diag.err(format!("XOR rebuild failed: {err}"));
            ok = false;
        }
    }

    if !ctx.world.alltrue(ok)? {
        return Err(RedundancyError::RebuildFailed { dataset });
    }
    Ok(())
}

/// Pipelined XOR reduction along the ring: `root` is the rank being
/// reconstructed; every other rank feeds data or parity into the stream.
fn rebuild_xor(
    ctx: &mut CodecCtx<'_>,
    desc: &Descriptor,
    dataset: u64,
    root: usize,
) -> Result<(), RedundancyError> {
    let me_world = ctx.world.rank();
    let ranks_world = ctx.world.size();
    let comm = desc.comm.as_ref();
    let k = comm.size();
    let my_rank = comm.rank();
    let lhs = desc.lhs.as_ref().expect("xor descriptor has lhs");
    let rhs = desc.rhs.as_ref().expect("xor descriptor has rhs");
    let dir = desc.dataset_dir(dataset);

    let mut chunk: File;
    let chunk_path: PathBuf;
    let mut filenames: Vec<PathBuf>;
    let mut sizes: Vec<u64>;
    let mut fds: Vec<File>;
    let metas: Vec<FileMeta>;
    let chunk_size: u64;

    if my_rank != root {
        chunk_path = find_chunk_file(ctx.map, dataset, me_world).ok_or(
            RedundancyError::MissingChunk {
                dataset,
                rank: me_world,
            },
        )?;
        chunk = File::open(&chunk_path).map_err(|e| open_error("open", &chunk_path, e))?;
        let header = XorHeader::read_from(&mut chunk, &chunk_path)?;
        chunk_size = header.chunk_size;
        metas = header.current.clone();

        filenames = Vec::with_capacity(metas.len());
        sizes = Vec::with_capacity(metas.len());
        fds = Vec::with_capacity(metas.len());
        for m in &metas {
            let path = dir.join(&m.filename);
            sizes.push(m.size);
            fds.push(File::open(&path).map_err(|e| open_error("open", &path, e))?);
            filenames.push(path);
        }

        // the failed rank's right neighbour holds its meta as partner
        // records; ship them over along with the chunk geometry
        if lhs.rank == root {
            let mut tree = metas_to_tree(header.partner_rank, &header.partner);
            tree.set_u64("DSET", dataset);
            tree.set_u64("CHUNK", chunk_size);
            kvtree::exchange::send(&tree, root, comm)?;
        }
        // the failed rank's left neighbour tells it what to put in the
        // PARTNER section of its new chunk header
        if rhs.rank == root {
            kvtree::exchange::send(&metas_to_tree(me_world, &metas), root, comm)?;
        }
    } else {
        // learn what I am supposed to hold from my right neighbour
        let tree = kvtree::exchange::recv(rhs.rank, comm)?;
        let origin = dir.join("rebuild");
        let (_, my_metas) = metas_from_tree(&tree, &origin)?;
        chunk_size = tree
            .get_u64("CHUNK")
            .ok_or_else(|| RedundancyError::Config("rebuild message lacks CHUNK".into()))?;
        metas = my_metas;

        chunk_path = desc.chunk_file(dataset);
        ctx.map.add_file(dataset, me_world, &chunk_path);
        filenames = Vec::with_capacity(metas.len());
        for m in &metas {
            let path = dir.join(&m.filename);
            ctx.map.add_file(dataset, me_world, &path);
            filenames.push(path);
        }
        ctx.map
            .set_expected_files(dataset, me_world, metas.len() + 1);
        ctx.persist_map()?;

        chunk = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&chunk_path)
            .map_err(|e| open_error("create", &chunk_path, e))?;
        sizes = metas.iter().map(|m| m.size).collect();
        fds = Vec::with_capacity(filenames.len());
        for path in &filenames {
            fds.push(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| open_error("create", path, e))?,
            );
        }

        let partner_tree = kvtree::exchange::recv(lhs.rank, comm)?;
        let (partner_rank, partner) = metas_from_tree(&partner_tree, &chunk_path)?;

        let header = XorHeader {
            ranks_world,
            group_ranks: comm.member_world_ranks(),
            group_rank: my_rank,
            dataset,
            chunk_size,
            current_rank: me_world,
            current: metas.clone(),
            partner_rank,
            partner,
        };
        header.write_to(&mut chunk)?;
    }

    // pipelined reduction: data flows from the rank right of root all the
    // way around to root
    let buf_size = ctx.buf_size.max(1);
    let mut send_buf = vec![0u8; buf_size];
    let mut offset = 0u64;
    for chunk_id in 0..k {
        let mut nread = 0u64;
        while nread < chunk_size {
            let count = ((chunk_size - nread) as usize).min(buf_size);
            if my_rank != root {
                if chunk_id == my_rank {
                    // my parity slice comes from the chunk file
                    let n = {
                        let buf = &mut send_buf[..count];
                        let mut filled = 0;
                        while filled < buf.len() {
                            let n = chunk.read(&mut buf[filled..])?;
                            if n == 0 {
                                break;
                            }
                            filled += n;
                        }
                        filled
                    };
                    send_buf[n..count].fill(0);
                } else {
                    fileio::read_pad_n(&mut fds, &sizes, offset, &mut send_buf[..count])?;
                    offset += count as u64;
                }

                if lhs.rank != root {
                    let incoming = comm.recv(lhs.rank)?;
                    xor_into(&mut send_buf[..count], &incoming);
                }
                comm.send(rhs.rank, &send_buf[..count])?;
            } else {
                let incoming = comm.recv(lhs.rank)?;
                if chunk_id == my_rank {
                    chunk.write_all(&incoming)?;
                } else {
                    fileio::write_pad_n(&mut fds, &sizes, offset, &incoming)?;
                    offset += count as u64;
                }
            }
            nread += count as u64;
        }
    }
    chunk.sync_all()?;
    for fd in &fds {
        fd.sync_all()?;
    }
    drop(chunk);
    drop(fds);

    if my_rank == root {
        for (path, m) in filenames.iter().zip(&metas) {
            meta::complete(path, m)?;
            if ctx.crc_on_copy {
                meta::compute_crc(path)?;
            }
        }
        let chunk_meta = FileMeta::for_file(
            &chunk_path,
            me_world,
            ranks_world,
            dataset,
            FileKind::XorChunk,
            true,
        )?;
        meta::complete(&chunk_path, &chunk_meta)?;
        if ctx.crc_on_copy {
            meta::compute_crc(&chunk_path)?;
        }
    }

    Ok(())
}
