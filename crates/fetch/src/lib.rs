#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `fetch` reverses the flush: when a restart cannot recover a dataset
//! from cache, rank 0 resolves a candidate through the `current` link and
//! the index, scatters each rank's file list from the summary, and every
//! rank copies its files from the PFS back into cache — flow-controlled
//! by a `fetch_width` window and CRC-checked against the summary. The
//! fetched dataset is then re-encoded with its redundancy scheme so it is
//! protected again.
//!
//! A failed attempt deletes the partial dataset everywhere (cache
//! cleanup is a postcondition of the failure, not of the next attempt),
//! marks the candidate `FAILED` in the index, and moves on to the next
//! most recent complete checkpoint until candidates run out.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use cache::CacheCtx;
use flush::flushfile::{self, Location};
use flush::index::Index;
use flush::summary::Summary;
use group::Communicator;
use kvtree::KvTree;
use meta::FileMeta;
use redundancy::{CodecCtx, Descriptor};
use thiserror::Error;

/// Error raised by the fetch pipeline.
#[derive(Debug, Error)]
pub enum FetchError {
    /// File-level failure.
    #[error(transparent)]
    Io(#[from] fileio::FileIoError),

    /// Tree-store failure.
    #[error(transparent)]
    Tree(#[from] kvtree::KvTreeError),

    /// Group communication failure.
    #[error(transparent)]
    Group(#[from] group::GroupError),

    /// Metadata failure.
    #[error(transparent)]
    Meta(#[from] meta::MetaError),

    /// Cache failure.
    #[error(transparent)]
    Cache(#[from] cache::CacheError),

    /// Summary or index failure.
    #[error(transparent)]
    Flush(#[from] flush::FlushError),

    /// Redundancy failure while re-protecting the fetched dataset.
    #[error(transparent)]
    Redundancy(#[from] redundancy::RedundancyError),

    /// The candidate's summary does not match this job.
    #[error("summary for '{name}' expects {expected} ranks, job has {actual}")]
    RanksMismatch {
        /// Candidate name.
        name: String,
        /// Ranks recorded in the summary.
        expected: usize,
        /// Current world size.
        actual: usize,
    },

    /// A rank failed to copy its files.
    #[error("fetch of '{name}' failed on one or more ranks")]
    Failed {
        /// Candidate name.
        name: String,
    },

    /// No complete checkpoint is left to try.
    #[error("no fetchable checkpoint remains under the prefix")]
    Exhausted,

    /// No descriptor covers the fetched dataset.
    #[error("no enabled redundancy descriptor covers dataset {dataset}")]
    NoDescriptor {
        /// Affected dataset.
        dataset: u64,
    },
}

/// Tuning and environment for the fetch pipeline.
pub struct FetchCtx<'a> {
    /// PFS prefix.
    pub prefix: &'a Path,
    /// Max ranks reading from the PFS at once.
    pub fetch_width: usize,
    /// Buffer size for file copies.
    pub file_buf_size: usize,
    /// Whether to verify CRCs against the summary.
    pub crc_on_flush: bool,
}

/// Copies one file from the dataset's PFS directory into `dst_dir`,
/// verifying the CRC recorded in `meta` when enabled.
fn fetch_a_file(
    src_dir: &Path,
    meta_rec: &FileMeta,
    dst_dir: &Path,
    buf_size: usize,
    check_crc: bool,
) -> Result<PathBuf, FetchError> {
    let src = src_dir.join(&meta_rec.filename);
    let (dst, _, crc) = fileio::copy_to(&src, dst_dir, buf_size, check_crc)?;
    if let (Some(actual), Some(expected)) = (crc, meta_rec.crc32) {
        if actual != expected {
            let _ = std::fs::remove_file(&dst);
            return Err(FetchError::Failed {
                name: src.display().to_string(),
            });
        }
    }
    Ok(dst)
}

fn metas_to_tree(metas: &[FileMeta]) -> KvTree {
    let mut tree = KvTree::new();
    let files = tree.ensure("FILE");
    for (i, m) in metas.iter().enumerate() {
        files.set(i.to_string(), m.to_tree());
    }
    tree
}

fn metas_from_tree(tree: &KvTree, origin: &Path) -> Result<Vec<FileMeta>, FetchError> {
    let mut metas = Vec::new();
    if let Some(files) = tree.get("FILE") {
        for i in files.int_keys() {
            let sub = files.get_int(i).expect("listed key");
            metas.push(FileMeta::from_tree(sub, origin)?);
        }
    }
    Ok(metas)
}

/// Copies my share of the dataset into cache, recording each file in the
/// filemap before it exists.
fn fetch_my_files(
    fctx: &FetchCtx<'_>,
    cctx: &mut CacheCtx<'_>,
    metas: &[FileMeta],
    fetch_dir: &Path,
    dataset_dir: &Path,
    dataset: u64,
) -> bool {
    let me = cctx.topo.rank_world();
    let mut success = true;
    for m in metas {
        let dst = dataset_dir.join(&m.filename);
        cctx.map.add_file(dataset, me, &dst);
        if cctx.persist_map().is_err() {
            return false;
        }
        match fetch_a_file(fetch_dir, m, dataset_dir, fctx.file_buf_size, fctx.crc_on_flush) {
            Ok(fetched) => {
                let mut rec = m.clone();
                rec.rank = me;
                if meta::complete(&fetched, &rec).is_err() {
                    success = false;
                }
            }
            Err(err) => {
                cctx.diag.err(format!("fetch failed: {err}"));
                success = false;
            }
        }
    }
    success
}

/// One fetch attempt from the named dataset directory. On success the
/// dataset sits in cache, re-encoded, and its id is returned.
pub fn fetch_files(
    fctx: &FetchCtx<'_>,
    cctx: &mut CacheCtx<'_>,
    descriptors: &[Descriptor],
    name: &str,
) -> Result<u64, FetchError> {
    let world: &dyn Communicator = cctx.topo.world();
    let me = world.rank();
    let n = world.size();

    // rank 0 reads and validates the summary, then shares the verdict
    let mut dataset = 0u64;
    let mut rank_metas: Option<std::collections::BTreeMap<usize, Vec<FileMeta>>> = None;
    let mut ok = true;
    if me == 0 {
        let index = Index::read(fctx.prefix)?;
        match index.id_by_name(name) {
            Some(id) => match Summary::read(fctx.prefix, id) {
                Ok(summary) if summary.ranks == n => {
                    dataset = id;
                    rank_metas = Some(summary.rank_files);
                }
                Ok(summary) => {
                    cctx.diag.err(format!(
                        "summary for '{name}' expects {} ranks, job has {n}",
                        summary.ranks
                    ));
                    ok = false;
                }
                Err(err) => {
                    cctx.diag.err(format!("failed to read summary for '{name}': {err}"));
                    ok = false;
                }
            },
            None => {
                cctx.diag.err(format!("'{name}' not present in index"));
                ok = false;
            }
        }
    }
    let mut head = [
        i64::from(ok),
        dataset as i64,
    ]
    .iter()
    .flat_map(|v| v.to_le_bytes())
    .collect::<Vec<u8>>();
    world.bcast(0, &mut head)?;
    let ok = i64::from_le_bytes(head[0..8].try_into().expect("header")) != 0;
    let dataset = i64::from_le_bytes(head[8..16].try_into().expect("header")) as u64;
    if !ok {
        return Err(FetchError::Failed { name: name.into() });
    }

    // clear any partial copy of this dataset before writing into it
    cache::delete_dataset(cctx, dataset)?;

    let desc = redundancy::select_for_dataset(descriptors, dataset)
        .ok_or(FetchError::NoDescriptor { dataset })?;
    cctx.map.set_desc(dataset, me, desc.to_tree());
    cctx.persist_map()?;
    cache::dataset_dir_create(cctx, desc, dataset)?;

    let fetch_dir = fctx.prefix.join(name);
    let dataset_dir = desc.dataset_dir(dataset);

    // rank 0 fetches its own files, then feeds the window: the start
    // message carries each rank's meta rows, the reply its success flag
    let mut success = true;
    if me == 0 {
        let mut rank_metas = rank_metas.expect("validated above");
        let mine = rank_metas.remove(&0).unwrap_or_default();
        success = fetch_my_files(fctx, cctx, &mine, &fetch_dir, &dataset_dir, dataset);
        cctx.map.set_expected_files(dataset, 0, mine.len());
        cctx.persist_map()?;

        let width = fctx.fetch_width.max(1);
        let mut outstanding: VecDeque<usize> = VecDeque::new();
        let mut next = 1;
        while next < n || !outstanding.is_empty() {
            while next < n && outstanding.len() < width {
                let metas = rank_metas.remove(&next).unwrap_or_default();
                kvtree::exchange::send(&metas_to_tree(&metas), next, world)?;
                outstanding.push_back(next);
                next += 1;
            }
            let rank = outstanding.pop_front().expect("outstanding rank");
            let reply = world.recv(rank)?;
            if reply.first() != Some(&1) {
                success = false;
            }
        }
    } else {
        let tree = kvtree::exchange::recv(0, world)?;
        let metas = metas_from_tree(&tree, &fetch_dir)?;
        let mine = fetch_my_files(fctx, cctx, &metas, &fetch_dir, &dataset_dir, dataset);
        cctx.map.set_expected_files(dataset, me, metas.len());
        cctx.persist_map()?;
        world.send(0, &[u8::from(mine)])?;
        success = mine;
    }

    if !world.alltrue(success)? {
        cache::delete_dataset(cctx, dataset)?;
        return Err(FetchError::Failed { name: name.into() });
    }

    // protect the freshly fetched dataset again
    {
        let mut codec = CodecCtx {
            world,
            map: &mut *cctx.map,
            map_file: cctx.map_file,
            buf_size: cctx.buf_size,
            crc_on_copy: cctx.crc_on_copy,
            diag: cctx.diag,
        };
        if let Err(err) = redundancy::apply(&mut codec, desc, dataset) {
            cctx.diag.err(format!("re-encode after fetch failed: {err}"));
            cache::delete_dataset(cctx, dataset)?;
            return Err(FetchError::Failed { name: name.into() });
        }
    }

    let local = cctx.topo.local();
    flushfile::location_set(cctx.flush_file, dataset, Location::Cache, local)?;
    flushfile::location_set(cctx.flush_file, dataset, Location::Pfs, local)?;
    flushfile::location_unset(cctx.flush_file, dataset, Location::Flushing, local)?;

    Ok(dataset)
}

fn bcast_name(world: &dyn Communicator, name: Option<String>) -> Result<Option<String>, FetchError> {
    let mut bytes = if world.rank() == 0 {
        name.unwrap_or_default().into_bytes()
    } else {
        Vec::new()
    };
    world.bcast(0, &mut bytes)?;
    if bytes.is_empty() {
        Ok(None)
    } else {
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Full fetch driver: resolve the restart target via the `current` link
/// or the index, then try candidates newest-first until one fetches.
pub fn fetch_any(
    fctx: &FetchCtx<'_>,
    cctx: &mut CacheCtx<'_>,
    descriptors: &[Descriptor],
) -> Result<u64, FetchError> {
    let world = cctx.topo.world();
    let me = world.rank();

    let mut candidate: Option<(Option<u64>, String)> = None;
    if me == 0 {
        let index = Index::read(fctx.prefix)?;
        let link = flush::current_link(fctx.prefix);
        if let Ok(target) = std::fs::read_link(&link) {
            let name = target.to_string_lossy().into_owned();
            candidate = Some((index.id_by_name(&name), name));
        } else if let Some((id, name)) = index.most_recent_complete(None) {
            candidate = Some((Some(id), name));
        }
    }

    loop {
        let name = bcast_name(
            world,
            if me == 0 {
                candidate.as_ref().map(|(_, name)| name.clone())
            } else {
                None
            },
        )?;
        let Some(name) = name else {
            return Err(FetchError::Exhausted);
        };

        match fetch_files(fctx, cctx, descriptors, &name) {
            Ok(dataset) => {
                if me == 0 {
                    let now = logging::now_secs();
                    let mut index = Index::read(fctx.prefix)?;
                    index.mark_fetched(dataset, &name, now);
                    index.write(fctx.prefix)?;
                    let link = flush::current_link(fctx.prefix);
                    let _ = std::fs::remove_file(&link);
                    let _ = std::os::unix::fs::symlink(&name, &link);
                }
                return Ok(dataset);
            }
            Err(err) => {
                cctx.diag
                    .dbg(1, format!("fetch attempt from '{name}' failed: {err}"));
                if me == 0 {
                    let now = logging::now_secs();
                    let mut index = Index::read(fctx.prefix)?;
                    let failed_id = candidate.as_ref().and_then(|(id, _)| *id);
                    if let Some(id) = failed_id {
                        index.mark_failed(id, &name, now);
                        index.write(fctx.prefix)?;
                    }
                    let _ = std::fs::remove_file(flush::current_link(fctx.prefix));

                    // walk back to the next older complete checkpoint
                    let bound = failed_id.and_then(|id| id.checked_sub(1));
                    candidate = match bound {
                        Some(bound) => index
                            .most_recent_complete(Some(bound))
                            .map(|(id, name)| (Some(id), name)),
                        None => index
                            .most_recent_complete(None)
                            .map(|(id, name)| (Some(id), name)),
                    };
                }
            }
        }
    }
}
