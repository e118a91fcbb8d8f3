#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `redundancy` turns a cache full of per-rank checkpoint files into
//! something that survives node loss. Three schemes are available, in
//! increasing cost and strength:
//!
//! - **LOCAL** — no copy; files survive only as long as their node does.
//! - **PARTNER** — every rank mirrors its full file set to a ring
//!   neighbour on another node; one node per pair may fail.
//! - **XOR** — ranks form sets and hold one parity chunk each; any one
//!   node per set may fail, at a storage cost of roughly `1/(k-1)` of the
//!   data instead of a full copy.
//!
//! The crate owns redundancy descriptors (which ranks cooperate, at what
//! dataset cadence), the encode applied at checkpoint time, and the
//! decode/rebuild applied on restart.
//!
//! # Invariants
//!
//! - Every collective operation agrees on its outcome via an all-reduce
//!   AND before any rank acts on it.
//! - The filemap on disk always names a file before the file exists and
//!   keeps naming it until after it is unlinked.
//! - XOR chunk traffic travels strictly rightward around the ring; the
//!   slice at offset `o` is fully reduced before offset `o + buf` starts.

use std::path::Path;

use group::Communicator;

mod descriptor;
mod error;
mod partner;
mod swap;
mod xor;

pub use descriptor::{Descriptor, DescriptorConfig, Peer, Scheme, select_for_dataset};
pub use error::RedundancyError;
pub use partner::encode_partner;
pub use swap::{SwapMode, swap_file_names, swap_files};
pub use xor::{XorHeader, attempt_rebuild_xor, encode_xor, find_chunk_file};

/// Default message chunk size for codec streaming (128 KiB).
pub const MPI_BUF_SIZE: usize = 128 * 1024;

/// Shared state the codecs thread through an encode or rebuild.
pub struct CodecCtx<'a> {
    /// The job-wide communicator, used for consensus.
    pub world: &'a dyn Communicator,
    /// This node's filemap.
    pub map: &'a mut filemap::Filemap,
    /// Where the filemap persists.
    pub map_file: &'a Path,
    /// Chunk size for streaming transfers.
    pub buf_size: usize,
    /// Whether to compute and verify CRC32 on copied data.
    pub crc_on_copy: bool,
    /// Diagnostics sink.
    pub diag: &'a logging::Diag,
}

impl CodecCtx<'_> {
    fn persist_map(&self) -> Result<(), RedundancyError> {
        self.map.write(self.map_file)?;
        Ok(())
    }
}

/// Applies `desc`'s scheme to `dataset`: verifies local files, encodes,
/// and forms the collective verdict. Returns the total bytes of
/// application data protected.
pub fn apply(
    ctx: &mut CodecCtx<'_>,
    desc: &Descriptor,
    dataset: u64,
) -> Result<u64, RedundancyError> {
    let me = ctx.world.rank();
    let ranks = ctx.world.size();

    // scan for incomplete files before spending any bandwidth
    let mut valid = true;
    let mut my_bytes = 0u64;
    for file in ctx.map.files(dataset, me) {
        if filemap::file_is_good(&file, dataset, me, ranks, false) {
            my_bytes += fileio::file_size(&file).unwrap_or(0);
        } else {
            ctx.diag
                .dbg(2, format!("incomplete file before encode: {}", file.display()));
            valid = false;
        }
    }
    if !ctx.world.alltrue(valid)? {
        return Err(RedundancyError::EncodeFailed { dataset });
    }

    let result = match desc.scheme {
        Scheme::Local => Ok(()),
        Scheme::Partner => encode_partner(ctx, desc, dataset),
        Scheme::Xor => encode_xor(ctx, desc, dataset),
    };
    if let Err(err) = &result {
        ctx.diag.err(format!("redundancy encode failed: {err}"));
    }

    if !ctx.world.alltrue(result.is_ok())? {
        return Err(RedundancyError::EncodeFailed { dataset });
    }

    // the encode may have added a chunk file; pin the final count
    let num = ctx.map.num_files(dataset, me);
    ctx.map.set_expected_files(dataset, me, num);
    ctx.persist_map()?;

    let total = ctx
        .world
        .allreduce_i64(my_bytes as i64, group::ReduceOp::Sum)?;
    Ok(total as u64)
}

/// Rebuilds `dataset` after a restart: XOR sets reconstruct missing
/// ranks, then LOCAL and PARTNER re-verify and re-encode so the
/// protection holds for the next failure.
pub fn rebuild(
    ctx: &mut CodecCtx<'_>,
    desc: &Descriptor,
    dataset: u64,
) -> Result<(), RedundancyError> {
    if desc.scheme == Scheme::Xor {
        attempt_rebuild_xor(ctx, desc, dataset)?;
    }

    let me = ctx.world.rank();
    let ranks = ctx.world.size();
    let have = filemap::have_files(ctx.map, dataset, me, ranks, false);
    if !ctx.world.alltrue(have)? {
        return Err(RedundancyError::RebuildFailed { dataset });
    }

    if matches!(desc.scheme, Scheme::Local | Scheme::Partner) {
        apply(ctx, desc, dataset)?;
    }
    Ok(())
}
