//! PARTNER encode: mirror this rank's files to its right-hand neighbour
//! while accepting the left-hand neighbour's files.

use group::Communicator;

use crate::{CodecCtx, Descriptor, RedundancyError, SwapMode, swap_file_names, swap_files};

/// Tag under which the partner's hostname is remembered, so a post-job
/// scavenge knows which node held whose shards.
pub const PARTNER_TAG: &str = "PARTNER";

pub(crate) fn sendrecv_count(
    comm: &dyn Communicator,
    send: (usize, usize),
    recv_from: usize,
) -> Result<usize, RedundancyError> {
    let (dest, count) = send;
    let bytes = (count as u64).to_le_bytes();
    let incoming = comm
        .sendrecv(Some((dest, &bytes)), Some(recv_from))?
        .expect("recv side requested");
    let arr: [u8; 8] = incoming
        .try_into()
        .map_err(|_| group::GroupError::Inconsistent("bad count message".into()))?;
    Ok(u64::from_le_bytes(arr) as usize)
}

/// Copies every file this rank owns for `dataset` to `rhs` and stores the
/// incoming set from `lhs` in the dataset's cache directory.
pub fn encode_partner(
    ctx: &mut CodecCtx<'_>,
    desc: &Descriptor,
    dataset: u64,
) -> Result<(), RedundancyError> {
    let me = ctx.world.rank();
    let lhs = desc.lhs.as_ref().expect("partner descriptor has lhs");
    let rhs = desc.rhs.as_ref().expect("partner descriptor has rhs");
    let comm = desc.comm.as_ref();

    let files = ctx.map.files(dataset, me);
    let mut send_num = files.len();
    let mut recv_num = sendrecv_count(comm, (rhs.rank, send_num), lhs.rank)?;

    // record what we are about to receive before any bytes land
    ctx.map
        .set_expected_files(dataset, lhs.world_rank, recv_num);
    ctx.map
        .set_tag(dataset, lhs.world_rank, PARTNER_TAG, &lhs.hostname);
    let lhs_desc = kvtree::exchange::sendrecv(
        Some((&desc.to_tree(), rhs.rank)),
        Some(lhs.rank),
        comm,
    )?
    .expect("descriptor from lhs");
    ctx.map.set_desc(dataset, lhs.world_rank, lhs_desc);
    ctx.persist_map()?;

    let dir = desc.dataset_dir(dataset);
    let mut files_iter = files.iter();
    let mut ok = true;
    while send_num > 0 || recv_num > 0 {
        let file = if send_num > 0 {
            send_num -= 1;
            files_iter.next().map(std::path::PathBuf::as_path)
        } else {
            None
        };
        let send_rank = file.is_some().then_some(rhs.rank);
        let recv_rank = if recv_num > 0 {
            recv_num -= 1;
            Some(lhs.rank)
        } else {
            None
        };

        let file_partner = swap_file_names(file, send_rank, recv_rank, &dir, comm)?;
        if let Some(partner) = &file_partner {
            ctx.map.add_file(dataset, lhs.world_rank, partner);
            ctx.persist_map()?;
        }

        if !swap_files(
            SwapMode::Copy,
            file,
            send_rank,
            file_partner.as_deref(),
            recv_rank,
            comm,
            ctx.buf_size,
            ctx.crc_on_copy,
        )? {
            ok = false;
        }
    }

    if ok {
        Ok(())
    } else {
        Err(RedundancyError::EncodeFailed { dataset })
    }
}
