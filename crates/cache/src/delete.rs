//! Dataset deletion, eviction, and incomplete-file cleanup.

use std::path::{Path, PathBuf};

use group::Communicator;
use redundancy::Descriptor;

use crate::{CacheCtx, CacheError};

/// Creates the cache directory for `dataset`: the node master makes it,
/// everyone on the node waits for it to exist.
pub fn dataset_dir_create(
    ctx: &CacheCtx<'_>,
    desc: &Descriptor,
    dataset: u64,
) -> Result<(), CacheError> {
    if ctx.topo.rank_local() == 0 {
        let dir = desc.dataset_dir(dataset);
        ctx.diag
            .dbg(2, format!("creating cache directory {}", dir.display()));
        fileio::mkdir_p(&dir)?;
    }
    ctx.topo.local().barrier()?;
    Ok(())
}

fn dataset_dir_from_map(ctx: &CacheCtx<'_>, dataset: u64) -> Option<PathBuf> {
    // any rank's stored descriptor names the directory
    ctx.map.ranks(dataset).into_iter().find_map(|rank| {
        let dir = ctx.map.desc(dataset, rank)?.get_str("DIR")?;
        Some(Path::new(dir).join(format!("checkpoint.{dataset}")))
    })
}

/// Deletes every trace of `dataset` this rank holds: payloads, sidecars,
/// the dataset directory, the flush-file entry, and the filemap entry.
pub fn delete_dataset(ctx: &mut CacheCtx<'_>, dataset: u64) -> Result<(), CacheError> {
    let dir = dataset_dir_from_map(ctx, dataset);

    for rank in ctx.map.ranks(dataset) {
        for file in ctx.map.files(dataset, rank) {
            if ctx.crc_on_delete && meta::compute_crc(&file).is_err() {
                ctx.diag.err(format!(
                    "CRC mismatch found while deleting {}",
                    file.display()
                ));
            }
            ctx.diag
                .dbg(2, format!("deleting file {}", file.display()));
            let _ = std::fs::remove_file(&file);
            meta::incomplete(&file);
        }
    }

    if let Some(dir) = dir {
        // other local ranks may still hold files here; only an empty
        // directory actually goes away
        let _ = std::fs::remove_dir(&dir);
    }

    flush::flushfile::unset_dataset(ctx.flush_file, dataset, ctx.topo.local())?;

    ctx.map.remove_dataset(dataset);
    ctx.persist_map()?;
    Ok(())
}

/// Deletes every dataset this rank knows about.
pub fn unlink_all(ctx: &mut CacheCtx<'_>) -> Result<(), CacheError> {
    for dataset in ctx.map.datasets() {
        delete_dataset(ctx, dataset)?;
    }
    Ok(())
}

/// Unlinks the files this node holds for `(dataset, rank)` and forgets
/// them, used when redistribute learns nobody wants them.
pub fn unlink_rank(
    ctx: &mut CacheCtx<'_>,
    dataset: u64,
    rank: usize,
) -> Result<(), CacheError> {
    for file in ctx.map.files(dataset, rank) {
        ctx.diag.dbg(
            2,
            format!("dataset {dataset} rank {rank}: deleting {}", file.display()),
        );
        let _ = std::fs::remove_file(&file);
        meta::incomplete(&file);
        ctx.map.remove_file(dataset, rank, &file);
    }
    ctx.map.unset_expected_files(dataset, rank);
    ctx.map.remove_rank(dataset, rank);
    ctx.persist_map()?;
    Ok(())
}

/// Sweeps every recorded file and drops the ones that are missing,
/// incomplete, or stamped for a different dataset or world size.
pub fn clean_files(ctx: &mut CacheCtx<'_>) -> Result<(), CacheError> {
    let ranks_world = ctx.topo.ranks_world();
    let mut dirty = false;
    for dataset in ctx.map.datasets() {
        for rank in ctx.map.ranks(dataset) {
            for file in ctx.map.files(dataset, rank) {
                if filemap::file_is_good(&file, dataset, rank, ranks_world, false) {
                    continue;
                }
                ctx.diag.dbg(
                    2,
                    format!("cleaning incomplete file {}", file.display()),
                );
                let _ = std::fs::remove_file(&file);
                meta::incomplete(&file);
                ctx.map.remove_file(dataset, rank, &file);
                dirty = true;
            }
        }
    }
    if dirty {
        ctx.persist_map()?;
    }
    Ok(())
}

/// Makes room in `base` for one more dataset: datasets in the base are
/// deleted oldest-first until fewer than `size` remain. A dataset being
/// flushed is skipped; when only flushing datasets stand in the way, its
/// id comes back so the caller can wait out the flush and retry.
pub fn evict(
    ctx: &mut CacheCtx<'_>,
    base: &Path,
    size: usize,
    mut is_flushing: impl FnMut(u64) -> Result<bool, CacheError>,
) -> Result<Option<u64>, CacheError> {
    let me = ctx.topo.rank_world();
    let in_base: Vec<u64> = ctx
        .map
        .datasets()
        .into_iter()
        .filter(|&id| {
            ctx.map
                .desc(id, me)
                .and_then(|d| d.get_str("BASE"))
                .is_some_and(|b| Path::new(b) == base)
        })
        .collect();

    let mut count = in_base.len();
    let mut blocked = None;
    for id in in_base {
        if count < size {
            break;
        }
        if is_flushing(id)? {
            if blocked.is_none() {
                blocked = Some(id);
            }
        } else {
            delete_dataset(ctx, id)?;
            count -= 1;
        }
    }

    if count >= size { Ok(blocked) } else { Ok(None) }
}
