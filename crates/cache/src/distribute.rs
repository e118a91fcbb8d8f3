//! The restart redistribute: move cached files to whichever rank now
//! owns them.
//!
//! Two phases. First the stored redundancy descriptors are routed back to
//! their ranks so groups can be reconstituted without re-running the
//! split. Then the files themselves move in rounds: every rank announces
//! which ranks' files it holds, each rank picks the earliest round it can
//! be served in, and pairs exchange with MOVE semantics so cache usage
//! stays flat.

use group::Communicator;
use kvtree::KvTree;
use redundancy::{Descriptor, Scheme, SwapMode, swap_file_names, swap_files};

use crate::{CacheCtx, CacheError, clean_files, unlink_rank};

fn count_sendrecv(
    world: &dyn group::Communicator,
    send: Option<(usize, usize)>,
    recv_from: Option<usize>,
) -> Result<Option<usize>, CacheError> {
    let bytes = send.map(|(_, count)| (count as u64).to_le_bytes());
    let send_arg = match (&bytes, send) {
        (Some(b), Some((dest, _))) => Some((dest, b.as_slice())),
        _ => None,
    };
    let incoming = world.sendrecv(send_arg, recv_from)?;
    Ok(incoming.map(|b| {
        let arr: [u8; 8] = b.try_into().unwrap_or([0; 8]);
        u64::from_le_bytes(arr) as usize
    }))
}

/// Scan ranks in relative order and record, per rank, the round in which
/// this process could serve its data. Returns the serve order and the
/// per-rank round table.
fn survey(
    ctx: &CacheCtx<'_>,
    dataset: u64,
    mut holds: impl FnMut(&CacheCtx<'_>, usize) -> bool,
) -> (Vec<usize>, Vec<i64>) {
    let me = ctx.topo.rank_world();
    let n = ctx.topo.ranks_world();
    let mut send_ranks = Vec::new();
    let mut found = vec![0i64; n];
    let mut round = 1;
    for i in 0..n {
        let rel = (me + i) % n;
        if ctx.map.has_rank(dataset, rel) && holds(ctx, rel) {
            send_ranks.push(rel);
            found[rel] = round;
            round += 1;
        }
    }
    (send_ranks, found)
}

/// Picks the earliest round this rank can fetch its own data in,
/// preferring nearby ranks on ties.
fn pick_source(ctx: &CacheCtx<'_>, has_my: &[i64]) -> Option<(usize, i64)> {
    let me = ctx.topo.rank_world();
    let n = ctx.topo.ranks_world();
    let mut best: Option<(usize, i64)> = None;
    for i in 0..n {
        let rel = (me + i) % n;
        if has_my[rel] > 0 && best.is_none_or(|(_, round)| has_my[rel] < round) {
            best = Some((rel, has_my[rel]));
        }
    }
    best
}

/// Routes stored redundancy descriptors back to their owning ranks and
/// returns this rank's descriptor tree.
pub fn distribute_descriptors(
    ctx: &mut CacheCtx<'_>,
    dataset: u64,
) -> Result<KvTree, CacheError> {
    let world = ctx.topo.world();
    let me = ctx.topo.rank_world();

    let (send_ranks, found) = survey(ctx, dataset, |ctx, rank| {
        ctx.map.desc(dataset, rank).is_some()
    });

    let has_my = world.alltoall_i64(&found)?;
    let source = pick_source(ctx, &has_my);
    if !world.alltrue(source.is_some())? {
        if source.is_none() {
            ctx.diag.dbg(
                2,
                format!("dataset {dataset}: no process holds my descriptor"),
            );
        }
        return Err(CacheError::NoSource { dataset });
    }
    let (retrieve_rank, retrieve_round) = source.expect("checked above");

    let max_rounds = world.allreduce_i64(retrieve_round, group::ReduceOp::Max)?;
    let retrieve_ranks = world.allgather_i64(retrieve_rank as i64)?;

    let mut mine: Option<KvTree> = None;
    for round in 1..=max_rounds {
        let mut send_to = None;
        if let Some(&dst) = send_ranks.get(round as usize - 1) {
            if retrieve_ranks[dst] == me as i64 {
                send_to = Some(dst);
            }
        }
        let recv_from = (retrieve_round == round).then_some(retrieve_rank);

        let send_tree =
            send_to.and_then(|dst| ctx.map.desc(dataset, dst).cloned().map(|t| (t, dst)));
        let incoming = kvtree::exchange::sendrecv(
            send_tree.as_ref().map(|(tree, dst)| (tree, *dst)),
            recv_from,
            world,
        )?;
        if let Some(tree) = incoming {
            ctx.map.set_desc(dataset, me, tree.clone());
            mine = Some(tree);
        }
    }
    ctx.persist_map()?;

    mine.ok_or(CacheError::NoSource { dataset })
}

/// Moves cached files to their owning ranks. XOR datasets tolerate ranks
/// with no source here (the rebuild runs next); other schemes fail fast.
pub fn distribute_files(
    ctx: &mut CacheCtx<'_>,
    desc: &Descriptor,
    dataset: u64,
) -> Result<(), CacheError> {
    let me = ctx.topo.rank_world();
    let n = ctx.topo.ranks_world();

    clean_files(ctx)?;

    let (send_ranks, found) = survey(ctx, dataset, |ctx, rank| {
        filemap::have_files(ctx.map, dataset, rank, n, false)
    });

    let world = ctx.topo.world();
    let has_my = world.alltoall_i64(&found)?;
    let source = pick_source(ctx, &has_my);
    if desc.scheme != Scheme::Xor && !world.alltrue(source.is_some())? {
        if source.is_none() {
            ctx.diag.dbg(
                2,
                format!("dataset {dataset}: no process holds my files"),
            );
        }
        return Err(CacheError::NoSource { dataset });
    }
    let (retrieve_rank, retrieve_round) = source.unwrap_or((0, -1));

    let max_rounds = world.allreduce_i64(retrieve_round, group::ReduceOp::Max)?;
    let retrieve_ranks = world.allgather_i64(if source.is_some() {
        retrieve_rank as i64
    } else {
        -1
    })?;

    let dir = desc.dataset_dir(dataset);

    for round in 1..=max_rounds {
        let mut send_rank = None;
        if let Some(&dst) = send_ranks.get(round as usize - 1) {
            if retrieve_ranks[dst] == me as i64 {
                send_rank = Some(dst);
            }
        }
        let recv_rank = (retrieve_round == round).then_some(retrieve_rank);

        if send_rank == Some(me) {
            // my own files just need to land in this run's directory
            for file in ctx.map.files(dataset, me) {
                let name = file.file_name().map(ToOwned::to_owned).unwrap_or_default();
                let newfile = dir.join(name);
                if newfile == file {
                    continue;
                }
                ctx.map.add_file(dataset, me, &newfile);
                ctx.persist_map()?;
                ctx.diag.dbg(
                    2,
                    format!("round {round}: rename {} -> {}", file.display(), newfile.display()),
                );
                std::fs::rename(&file, &newfile).map_err(|source| fileio::FileIoError::Io {
                    action: "rename",
                    path: file.clone(),
                    source,
                })?;
                let _ = std::fs::rename(meta::sidecar_path(&file), meta::sidecar_path(&newfile));
                ctx.map.remove_file(dataset, me, &file);
                ctx.persist_map()?;
            }
            continue;
        }

        // files queued for this round whose owner fetches from someone
        // else are garbage
        if send_rank.is_none() {
            if let Some(&dst) = send_ranks.get(round as usize - 1) {
                unlink_rank(ctx, dataset, dst)?;
            }
        }
        if send_rank.is_none() && recv_rank.is_none() {
            continue;
        }

        // exchange file counts
        let send_num = send_rank.map(|dst| (dst, ctx.map.num_files(dataset, dst)));
        let recv_num = count_sendrecv(world, send_num, recv_rank)?;
        if let Some(num) = recv_num {
            ctx.map.set_expected_files(dataset, me, num);
            ctx.persist_map()?;
        }

        let mut to_send = send_num.map_or(0, |(_, n)| n);
        let mut to_recv = recv_num.unwrap_or(0);
        let send_files = send_rank.map(|dst| ctx.map.files(dataset, dst)).unwrap_or_default();
        let mut send_iter = send_files.iter();
        let filemap_send_rank = send_rank;

        while to_send > 0 || to_recv > 0 {
            let file = if to_send > 0 {
                send_iter.next().map(std::path::PathBuf::as_path)
            } else {
                None
            };
            let this_send = file.and(send_rank);
            let this_recv = (to_recv > 0).then_some(recv_rank).flatten();

            let file_partner = swap_file_names(file, this_send, this_recv, &dir, world)?;
            if let Some(partner) = &file_partner {
                ctx.map.add_file(dataset, me, partner);
                ctx.persist_map()?;
            }

            swap_files(
                SwapMode::Move,
                file,
                this_send,
                file_partner.as_deref(),
                this_recv,
                world,
                ctx.buf_size,
                ctx.crc_on_copy,
            )?;

            if let (Some(file), Some(dst)) = (file, send_rank) {
                ctx.map.remove_file(dataset, dst, file);
                ctx.persist_map()?;
            }
            if to_recv > 0 {
                to_recv -= 1;
            }
            if to_send > 0 {
                to_send -= 1;
            }
        }

        if let Some(dst) = filemap_send_rank {
            ctx.map.remove_rank(dataset, dst);
            ctx.persist_map()?;
        }
    }

    // rounds beyond the last requested one hold files nobody wants
    for round in (max_rounds as usize + 1)..=send_ranks.len() {
        let dst = send_ranks[round - 1];
        if dst != me {
            unlink_rank(ctx, dataset, dst)?;
        }
    }

    ctx.persist_map()?;
    clean_files(ctx)?;
    Ok(())
}
