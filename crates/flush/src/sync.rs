//! Synchronous flush: copy a dataset from cache to the PFS inline,
//! flow-controlled by a sliding window of writers.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use filemap::Filemap;
use group::Communicator;
use kvtree::KvTree;
use meta::{FileKind, FileMeta};

use crate::flushfile::{self, Location};
use crate::summary::Summary;
use crate::{Dataset, FlushCtx, FlushError, index::Index};

/// True when `file` is application data that belongs on the PFS.
/// Redundancy chunks stay in cache; the PFS copy is its own protection.
#[must_use]
pub fn flushable(file: &Path) -> bool {
    match meta::read(file) {
        Ok(m) => m.kind == FileKind::Full,
        Err(_) => true,
    }
}

/// Creates the dataset's PFS directory, named
/// `scr.<timestamp>.<jobid>.<id>`, registering the name in the index
/// before the directory exists so a crash leaves a traceable stub.
/// Returns the directory path on every rank.
pub fn flush_dir_create(
    ctx: &FlushCtx<'_>,
    dataset: u64,
    now: u64,
) -> Result<PathBuf, FlushError> {
    let world = ctx.topo.world();
    let mut name_bytes = if world.rank() == 0 {
        let name = format!(
            "scr.{}.{}.{}",
            logging::format_dirstamp(now),
            ctx.jobid,
            dataset
        );

        let mut index = Index::read(ctx.prefix)?;
        index.add_name(dataset, &name);
        index.write(ctx.prefix)?;

        let dir = ctx.prefix.join(&name);
        match fileio::mkdir_p(&dir) {
            Ok(()) => name.into_bytes(),
            Err(err) => {
                ctx.diag
                    .err(format!("failed to create flush directory: {err}"));
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };
    world.bcast(0, &mut name_bytes)?;

    if name_bytes.is_empty() {
        return Err(FlushError::DirFailed {
            prefix: ctx.prefix.to_path_buf(),
        });
    }
    Ok(ctx
        .prefix
        .join(String::from_utf8_lossy(&name_bytes).into_owned()))
}

/// Copies one file and its sidecar into `dst_dir`, verifying or
/// recording the CRC as configured. Returns the file's meta with
/// `complete` reflecting the copy's success.
pub fn flush_a_file(
    src: &Path,
    dst_dir: &Path,
    buf_size: usize,
    crc_on_flush: bool,
) -> Result<FileMeta, FlushError> {
    let mut meta = meta::read(src)?;
    let mut ok = true;

    let (_, _, crc) = fileio::copy_to(src, dst_dir, buf_size, crc_on_flush)?;
    if let Some(crc) = crc {
        match meta.crc32 {
            Some(expected) if expected != crc => {
                // cache copy is corrupt; revoke its completeness
                meta.complete = false;
                meta::write(src, &meta)?;
                ok = false;
            }
            Some(_) => {}
            None => {
                meta.crc32 = Some(crc);
                meta::write(src, &meta)?;
            }
        }
    }

    fileio::copy_to(&meta::sidecar_path(src), dst_dir, buf_size, false)?;

    meta.complete = ok;
    Ok(meta)
}

pub(crate) fn metas_to_tree(metas: &[FileMeta], ok: bool) -> KvTree {
    let mut tree = KvTree::new();
    tree.set_u64("OK", u64::from(ok));
    let files = tree.ensure("FILE");
    for m in metas {
        files.set(m.filename.clone(), m.to_tree());
    }
    tree
}

pub(crate) fn metas_from_tree(
    tree: &KvTree,
    dir: &Path,
) -> Result<(Vec<FileMeta>, bool), FlushError> {
    let ok = tree.get_u64("OK").unwrap_or(0) != 0;
    let mut metas = Vec::new();
    if let Some(files) = tree.get("FILE") {
        for (name, sub) in files.iter() {
            metas.push(
                FileMeta::from_tree(sub, &dir.join(name)).map_err(|_| FlushError::Malformed {
                    what: "flush meta",
                    detail: format!("bad record for '{name}'"),
                })?,
            );
        }
    }
    Ok((metas, ok))
}

/// Rank 0 side of the flow-controlled gather: admits ranks into the
/// window, collecting each one's result tree as it finishes. The window
/// keeps at most `width` ranks writing at once.
pub(crate) fn window_collect(
    world: &dyn Communicator,
    width: usize,
    mut on_result: impl FnMut(usize, KvTree) -> Result<(), FlushError>,
) -> Result<(), FlushError> {
    let n = world.size();
    let width = width.max(1);
    let mut outstanding: VecDeque<usize> = VecDeque::new();
    let mut next = 1;
    while next < n || !outstanding.is_empty() {
        while next < n && outstanding.len() < width {
            world.send(next, &[])?;
            outstanding.push_back(next);
            next += 1;
        }
        let rank = outstanding.pop_front().expect("outstanding rank");
        let tree = kvtree::exchange::recv(rank, world)?;
        on_result(rank, tree)?;
    }
    Ok(())
}

/// Rank 0 bookkeeping after all ranks have copied: write the summary,
/// mark the index, and repoint `current`. Returns overall success.
pub(crate) fn finalize_pfs(
    ctx: &FlushCtx<'_>,
    dataset_info: &Dataset,
    name: &str,
    rank_files: BTreeMap<usize, Vec<FileMeta>>,
    all_ok: bool,
    now: u64,
) -> Result<bool, FlushError> {
    let mut dataset_info = dataset_info.clone();
    dataset_info.name = name.to_owned();
    dataset_info.files = rank_files.values().map(Vec::len).sum();
    dataset_info.size = rank_files
        .values()
        .flatten()
        .map(|m| m.size)
        .sum();

    let summary = Summary {
        complete: all_ok,
        dataset: dataset_info.clone(),
        ranks: ctx.topo.ranks_world(),
        rank_files,
    };
    summary.write(ctx.prefix)?;

    // summary is down; only now may the index claim completeness
    let mut index = Index::read(ctx.prefix)?;
    index.set_dataset(dataset_info.id, name, &dataset_info, all_ok);
    index.mark_flushed(dataset_info.id, name, now);
    if all_ok && dataset_info.is_checkpoint {
        index.set_current(name)?;
    }
    index.write(ctx.prefix)?;

    // and only after the index is down may current move
    if all_ok && dataset_info.is_checkpoint {
        let link = crate::current_link(ctx.prefix);
        let _ = std::fs::remove_file(&link);
        std::os::unix::fs::symlink(name, &link)?;
    }

    Ok(all_ok)
}

/// Flushes `dataset` synchronously. On success the dataset is marked
/// `PFS` in the flush file and `current` points at it.
pub fn flush_sync(
    ctx: &FlushCtx<'_>,
    map: &Filemap,
    dataset: u64,
    dataset_info: &Dataset,
) -> Result<PathBuf, FlushError> {
    let world = ctx.topo.world();
    let me = world.rank();
    let n = world.size();
    let now = logging::now_secs();

    world.barrier()?;
    if me == 0 {
        ctx.diag.dbg(1, format!("initiating flush of dataset {dataset}"));
        let _ = logging::log_event(
            ctx.prefix,
            &logging::EventRecord {
                kind: "FLUSH STARTED".into(),
                dataset: Some(dataset),
                start: Some(now),
                ..logging::EventRecord::default()
            },
        );
    }

    // everyone must still hold a complete set before bytes move
    let have = filemap::have_files(map, dataset, me, n, false);
    if !world.alltrue(have)? {
        if me == 0 {
            ctx.diag.err("one or more processes are missing their files");
        }
        return Err(FlushError::MissingFiles { dataset });
    }

    let dir = flush_dir_create(ctx, dataset, now)?;
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if me == 0 {
        ctx.diag.dbg(1, format!("flushing to {}", dir.display()));
    }

    let my_files: Vec<PathBuf> = map
        .files(dataset, me)
        .into_iter()
        .filter(|f| flushable(f))
        .collect();

    let flush_mine = |ok: &mut bool| -> Result<Vec<FileMeta>, FlushError> {
        let mut metas = Vec::with_capacity(my_files.len());
        for file in &my_files {
            let m = flush_a_file(file, &dir, ctx.file_buf_size, ctx.crc_on_flush)?;
            if !m.complete {
                *ok = false;
            }
            metas.push(m);
        }
        Ok(metas)
    };

    let mut all_ok = true;
    let flushed = if me == 0 {
        let mut rank_files = BTreeMap::new();
        let mut ok0 = true;
        rank_files.insert(0, flush_mine(&mut ok0)?);
        all_ok = ok0;

        window_collect(world, ctx.flush_width, |rank, tree| {
            let (metas, ok) = metas_from_tree(&tree, &dir)?;
            if !ok {
                all_ok = false;
            }
            rank_files.insert(rank, metas);
            Ok(())
        })?;

        finalize_pfs(ctx, dataset_info, &name, rank_files, all_ok, now)?
    } else {
        world.recv(0)?; // wait for our window slot
        let mut ok = true;
        let metas = flush_mine(&mut ok)?;
        kvtree::exchange::send(&metas_to_tree(&metas, ok), 0, world)?;
        false
    };

    // rank 0 announces the verdict
    let verdict = world.allreduce_i64(i64::from(flushed), group::ReduceOp::Max)? != 0;

    if verdict {
        flushfile::location_set(ctx.flush_file, dataset, Location::Pfs, ctx.topo.local())?;
    }

    if me == 0 {
        let record = logging::EventRecord {
            kind: if verdict {
                "FLUSH SUCCEEDED".into()
            } else {
                "FLUSH FAILED".into()
            },
            note: Some(dir.display().to_string()),
            dataset: Some(dataset),
            start: Some(now),
            secs: Some(logging::now_secs().saturating_sub(now) as f64),
        };
        let _ = logging::log_event(ctx.prefix, &record);
        if verdict {
            ctx.diag.dbg(1, format!("flush of dataset {dataset} succeeded"));
        } else {
            ctx.diag.err(format!("flush of dataset {dataset} failed"));
        }
    }

    if verdict {
        Ok(dir)
    } else {
        Err(FlushError::Failed { dataset })
    }
}
