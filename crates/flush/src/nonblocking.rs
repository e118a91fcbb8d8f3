//! Asynchronous flush: enqueue work for the external data-mover and poll
//! for completion, finalizing through the same summary/index path as the
//! synchronous flush.

use std::collections::BTreeMap;
use std::path::PathBuf;

use filemap::Filemap;
use group::Communicator;
use kvtree::KvTree;

use crate::flushfile::{self, Location};
use crate::sync::{finalize_pfs, flush_dir_create, flushable, metas_from_tree, metas_to_tree, window_collect};
use crate::transfer::{self, Command, State};
use crate::{Dataset, FlushCtx, FlushError};

/// State of one in-flight asynchronous flush.
#[derive(Clone, Debug)]
pub struct AsyncFlush {
    /// Dataset being flushed.
    pub dataset: u64,
    /// PFS target directory.
    pub dir: PathBuf,
    /// Target directory basename, the dataset's index name.
    pub name: String,
    /// Files this rank queued.
    pub my_files: Vec<PathBuf>,
    /// Total bytes queued across the job.
    pub bytes_total: u64,
}

/// Enqueues `dataset` into the transfer file and hands it to the mover.
pub fn start(
    ctx: &FlushCtx<'_>,
    map: &Filemap,
    dataset: u64,
) -> Result<AsyncFlush, FlushError> {
    let world = ctx.topo.world();
    let local = ctx.topo.local();
    let me = world.rank();
    let now = logging::now_secs();

    world.barrier()?;
    if me == 0 {
        ctx.diag
            .dbg(1, format!("initiating async flush of dataset {dataset}"));
        let _ = logging::log_event(
            ctx.prefix,
            &logging::EventRecord {
                kind: "ASYNC FLUSH STARTED".into(),
                dataset: Some(dataset),
                start: Some(now),
                ..logging::EventRecord::default()
            },
        );
    }

    let have = filemap::have_files(map, dataset, me, world.size(), false);
    if !world.alltrue(have)? {
        if me == 0 {
            ctx.diag.err("one or more processes are missing their files");
        }
        return Err(FlushError::MissingFiles { dataset });
    }

    flushfile::location_set(ctx.flush_file, dataset, Location::Flushing, local)?;

    let dir = flush_dir_create(ctx, dataset, now)?;
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    // queue my files
    let mut my_files = Vec::new();
    let mut my_bytes = 0u64;
    let mut entries = KvTree::new();
    for file in map.files(dataset, me) {
        if !flushable(&file) {
            continue;
        }
        let size = fileio::file_size(&file)?;
        let dest = dir.join(file.file_name().unwrap_or_default());
        entries.set(
            file.to_string_lossy().into_owned(),
            transfer::file_entry(&dest, size),
        );
        my_bytes += size;
        my_files.push(file);
    }

    // node master merges every local rank's queue into the transfer file
    if local.rank() == 0 {
        let mut merged = entries;
        for peer in 1..local.size() {
            merged.merge(kvtree::exchange::recv(peer, local)?);
        }
        let bw = ctx.flush_async_bw / ctx.topo.num_nodes()? as f64;
        transfer::enqueue(ctx.transfer_file, &merged, bw, ctx.flush_async_percent)?;
    } else {
        kvtree::exchange::send(&entries, 0, local)?;
    }

    let bytes_total =
        world.allreduce_i64(my_bytes as i64, group::ReduceOp::Sum)? as u64;
    world.barrier()?;

    Ok(AsyncFlush {
        dataset,
        dir,
        name,
        my_files,
        bytes_total,
    })
}

/// Polls the transfer file once. Returns the bytes written so far and
/// whether every node's queue has drained.
pub fn test(ctx: &FlushCtx<'_>, state: &AsyncFlush) -> Result<(bool, u64), FlushError> {
    let progress =
        transfer::test_collective(ctx.transfer_file, ctx.topo.local(), ctx.topo.world())?;
    Ok((
        progress.complete,
        progress.bytes_written.min(state.bytes_total),
    ))
}

/// Finalizes a drained transfer: gathers meta to rank 0, writes summary
/// and index, repoints `current`, flips the flush file to `PFS`, and
/// removes the queue entries.
pub fn complete(
    ctx: &FlushCtx<'_>,
    map: &Filemap,
    state: &AsyncFlush,
    dataset_info: &Dataset,
) -> Result<(), FlushError> {
    let world = ctx.topo.world();
    let local = ctx.topo.local();
    let me = world.rank();
    let n = world.size();
    let now = logging::now_secs();

    let have = filemap::have_files(map, state.dataset, me, n, false);
    if !world.alltrue(have)? {
        return Err(FlushError::MissingFiles {
            dataset: state.dataset,
        });
    }

    // collect every flushed file's meta; the bytes are already on the PFS
    let mut ok = true;
    let mut metas = Vec::with_capacity(state.my_files.len());
    for file in &state.my_files {
        let m = meta::read(file)?;
        if !m.complete {
            ok = false;
        }
        metas.push(m);
    }

    let mut all_ok = true;
    let flushed = if me == 0 {
        let mut rank_files = BTreeMap::new();
        all_ok = ok;
        rank_files.insert(0, metas);
        window_collect(world, ctx.flush_width, |rank, tree| {
            let (metas, rank_ok) = metas_from_tree(&tree, &state.dir)?;
            if !rank_ok {
                all_ok = false;
            }
            rank_files.insert(rank, metas);
            Ok(())
        })?;
        finalize_pfs(ctx, dataset_info, &state.name, rank_files, all_ok, now)?
    } else {
        world.recv(0)?;
        kvtree::exchange::send(&metas_to_tree(&metas, ok), 0, world)?;
        false
    };

    let verdict = world.allreduce_i64(i64::from(flushed), group::ReduceOp::Max)? != 0;

    if verdict {
        flushfile::location_set(ctx.flush_file, state.dataset, Location::Pfs, local)?;
    }
    flushfile::location_unset(ctx.flush_file, state.dataset, Location::Flushing, local)?;

    // drain our queue entries and idle the mover
    transfer::dequeue(ctx.transfer_file, &state.my_files, local)?;
    transfer::command_set(ctx.transfer_file, Command::Stop, local)?;

    if me == 0 {
        let record = logging::EventRecord {
            kind: if verdict {
                "ASYNC FLUSH SUCCEEDED".into()
            } else {
                "ASYNC FLUSH FAILED".into()
            },
            note: Some(state.dir.display().to_string()),
            dataset: Some(state.dataset),
            start: Some(now),
            ..logging::EventRecord::default()
        };
        let _ = logging::log_event(ctx.prefix, &record);
    }

    if verdict {
        Ok(())
    } else {
        Err(FlushError::Failed {
            dataset: state.dataset,
        })
    }
}

/// Blocks until the in-flight flush drains, then finalizes it.
pub fn wait(
    ctx: &FlushCtx<'_>,
    map: &Filemap,
    state: &AsyncFlush,
    dataset_info: &Dataset,
) -> Result<(), FlushError> {
    loop {
        if !flushfile::is_flushing(
            ctx.flush_file,
            state.dataset,
            ctx.topo.local(),
            ctx.topo.world(),
        )? {
            return Ok(());
        }
        let (done, bytes) = test(ctx, state)?;
        if done {
            return complete(ctx, map, state, dataset_info);
        }
        if ctx.topo.rank_world() == 0 && state.bytes_total > 0 {
            ctx.diag.dbg(
                1,
                format!(
                    "flush of dataset {} is {}% complete",
                    state.dataset,
                    bytes * 100 / state.bytes_total
                ),
            );
        }
        std::thread::sleep(ctx.poll_interval);
    }
}

/// Cancels the in-flight flush: commands the mover to STOP, waits until
/// every node's mover acknowledges, and clears the queue. The dataset
/// stays in cache; the index never learns it was on its way out.
pub fn stop(ctx: &FlushCtx<'_>, state: &AsyncFlush) -> Result<(), FlushError> {
    let world = ctx.topo.world();
    let local = ctx.topo.local();

    transfer::command_set(ctx.transfer_file, Command::Stop, local)?;
    transfer::state_wait(
        ctx.transfer_file,
        State::Stopped,
        local,
        world,
        ctx.poll_interval,
    )?;
    transfer::clear_files(ctx.transfer_file, local)?;
    flushfile::location_unset(ctx.flush_file, state.dataset, Location::Flushing, local)?;
    world.barrier()?;
    Ok(())
}
