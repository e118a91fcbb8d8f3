//! Flush bookkeeping: the synchronous path end to end, and the
//! asynchronous path against a scripted data-mover, including the
//! cancellation contract.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{Cluster, pattern, run_ranks};
use engine::Scr;
use filemap::Filemap;
use flush::flushfile::{self, Location};
use flush::{Dataset, FlushCtx};
use group::{Communicator, LocalWorld, Topology};
use meta::{FileKind, FileMeta};

#[test]
fn sync_flush_writes_summary_index_and_current() {
    let scratch = tempfile::tempdir().unwrap();
    let cluster = Cluster::new(scratch.path(), 2, 2);

    run_ranks(2, |rank, comm| {
        let opts = cluster.options(rank, &[("SCR_FLUSH", "1")]);
        let mut scr = Scr::init(Box::new(comm), opts).unwrap();
        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
        std::fs::write(&path, pattern(rank, 2048)).unwrap();
        scr.complete_checkpoint(true).unwrap();
    });

    let prefix = cluster.prefix();
    let index = flush::index::Index::read(&prefix).unwrap();
    let current = index.current().expect("current set").to_owned();
    assert_eq!(index.id_by_name(&current), Some(1));
    assert_eq!(index.complete(1, &current), Some(true));

    let summary = flush::summary::Summary::read(&prefix, 1).unwrap();
    assert!(summary.complete);
    assert_eq!(summary.ranks, 2);
    assert_eq!(summary.rank_files.len(), 2);

    // the current link resolves to the dataset directory
    let link = std::fs::read_link(flush::current_link(&prefix)).unwrap();
    assert_eq!(link.to_string_lossy(), current);
    for rank in 0..2 {
        let payload = prefix.join(&current).join(format!("rank_{rank}.ckpt"));
        assert_eq!(std::fs::read(&payload).unwrap(), pattern(rank, 2048));
    }

    // flush file on the node records the PFS copy
    let flush_file = cluster.cntl_dir(0).join("flush.scr");
    let tree = flushfile::read(&flush_file).unwrap();
    assert!(flushfile::locations(&tree, 1).iter().any(|l| l == "PFS"));
}

/// Scripted stand-in for the external data-mover: answers RUN with
/// RUNNING (optionally copying the queued files) and STOP with STOPPED.
fn run_mover(transfer: &Path, copy: bool, done: &AtomicBool) {
    while !done.load(Ordering::Relaxed) {
        if transfer.exists() {
            let (lock, mut tree) = kvtree::file::lock_open_read(transfer).unwrap();
            match tree.get_str("COMMAND") {
                Some("RUN") => {
                    if copy {
                        if let Some(files) = tree.get_mut("FILES") {
                            let entries: Vec<String> =
                                files.keys().map(str::to_owned).collect();
                            for src in entries {
                                let entry = files.get_mut(&src).unwrap();
                                let size = entry.get_u64("SIZE").unwrap_or(0);
                                if entry.get_u64("WRITTEN") == Some(size) {
                                    continue;
                                }
                                let dest =
                                    PathBuf::from(entry.get_str("DESTINATION").unwrap());
                                std::fs::copy(&src, &dest).unwrap();
                                let sidecar = meta::sidecar_path(Path::new(&src));
                                if sidecar.exists() {
                                    let _ = std::fs::copy(
                                        &sidecar,
                                        meta::sidecar_path(&dest),
                                    );
                                }
                                entry.set_u64("WRITTEN", size);
                            }
                        }
                    }
                    tree.set_str("STATE", "RUNNING");
                }
                Some("STOP") => {
                    tree.set_str("STATE", "STOPPED");
                }
                _ => {}
            }
            kvtree::file::write_close_unlock(lock, &tree).unwrap();
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// One node with two ranks, a dataset already complete in cache.
struct AsyncRig {
    cntl: PathBuf,
    prefix: PathBuf,
    cache: PathBuf,
    flush_file: PathBuf,
    transfer_file: PathBuf,
}

impl AsyncRig {
    fn new(base: &Path) -> Self {
        let cntl = base.join("cntl");
        let rig = Self {
            flush_file: cntl.join("flush.scr"),
            transfer_file: cntl.join("transfer.scr"),
            cntl,
            prefix: base.join("pfs"),
            cache: base.join("cache"),
        };
        fileio::mkdir_p(&rig.cntl).unwrap();
        fileio::mkdir_p(&rig.prefix).unwrap();
        fileio::mkdir_p(&rig.cache).unwrap();
        rig
    }

    fn stage_rank(&self, rank: usize, ranks: usize) -> (Filemap, PathBuf) {
        let file = self.cache.join(format!("rank_{rank}.dat"));
        std::fs::write(&file, pattern(rank, 900)).unwrap();
        let meta_rec =
            FileMeta::for_file(&file, rank, ranks, 1, FileKind::Full, true).unwrap();
        meta::complete(&file, &meta_rec).unwrap();

        let mut map = Filemap::new();
        map.add_file(1, rank, &file);
        map.set_expected_files(1, rank, 1);
        let map_file = self.cntl.join(format!("filemap_{rank}.scr"));
        map.write(&map_file).unwrap();
        (map, map_file)
    }
}

fn async_ctx<'a>(rig: &'a AsyncRig, topo: &'a Topology, diag: &'a logging::Diag) -> FlushCtx<'a> {
    FlushCtx {
        topo,
        prefix: &rig.prefix,
        flush_file: &rig.flush_file,
        transfer_file: &rig.transfer_file,
        flush_width: 4,
        file_buf_size: 4096,
        crc_on_flush: true,
        flush_async_bw: 1e9,
        flush_async_percent: 0.0,
        jobid: "job1",
        poll_interval: Duration::from_millis(20),
        diag,
    }
}

#[test]
fn async_flush_cancel_leaves_index_incomplete() {
    let scratch = tempfile::tempdir().unwrap();
    let rig = AsyncRig::new(scratch.path());
    let done = Arc::new(AtomicBool::new(false));

    let transfer = rig.cntl.join("transfer.scr");
    std::thread::scope(|scope| {
        {
            let transfer = transfer.clone();
            let done = Arc::clone(&done);
            scope.spawn(move || run_mover(&transfer, false, &done));
        }

        let comms = LocalWorld::new(2).into_comms();
        for comm in comms {
            let rig = &rig;
            let done = Arc::clone(&done);
            scope.spawn(move || {
                let rank = comm.rank();
                let topo = Topology::build(Box::new(comm), "node0").unwrap();
                let diag = logging::Diag::quiet();
                let (map, _map_file) = rig.stage_rank(rank, 2);
                let ctx = async_ctx(rig, &topo, &diag);

                flushfile::location_set(ctx.flush_file, 1, Location::Cache, topo.local())
                    .unwrap();
                let state = flush::nonblocking::start(&ctx, &map, 1).unwrap();
                assert!(
                    flushfile::is_flushing(ctx.flush_file, 1, topo.local(), topo.world())
                        .unwrap()
                );

                // cancel before the mover moved anything
                flush::nonblocking::stop(&ctx, &state).unwrap();

                if rank == 0 {
                    // STOPPED observed, queue drained
                    let tree = kvtree::file::read_with_lock(ctx.transfer_file).unwrap();
                    assert_eq!(tree.get_str("STATE"), Some("STOPPED"));
                    assert!(tree.get("FILES").is_none());

                    // the index never learned the dataset completed
                    let index = flush::index::Index::read(&rig.prefix).unwrap();
                    assert_eq!(index.complete(1, &state.name), None);
                    assert!(index.current().is_none());
                }

                // the dataset still wants a flush
                assert!(flushfile::need_flush(ctx.flush_file, 1, topo.local()).unwrap());
                assert!(
                    !flushfile::is_flushing(ctx.flush_file, 1, topo.local(), topo.world())
                        .unwrap()
                );
                done.store(true, Ordering::Relaxed);
            });
        }
    });
}

#[test]
fn async_flush_completes_through_the_mover() {
    let scratch = tempfile::tempdir().unwrap();
    let rig = AsyncRig::new(scratch.path());
    let done = Arc::new(AtomicBool::new(false));

    let transfer = rig.cntl.join("transfer.scr");
    std::thread::scope(|scope| {
        {
            let transfer = transfer.clone();
            let done = Arc::clone(&done);
            scope.spawn(move || run_mover(&transfer, true, &done));
        }

        let comms = LocalWorld::new(2).into_comms();
        for comm in comms {
            let rig = &rig;
            let done = Arc::clone(&done);
            scope.spawn(move || {
                let rank = comm.rank();
                let topo = Topology::build(Box::new(comm), "node0").unwrap();
                let diag = logging::Diag::quiet();
                let (map, _map_file) = rig.stage_rank(rank, 2);
                let ctx = async_ctx(rig, &topo, &diag);

                flushfile::location_set(ctx.flush_file, 1, Location::Cache, topo.local())
                    .unwrap();
                let state = flush::nonblocking::start(&ctx, &map, 1).unwrap();

                let info = Dataset {
                    id: 1,
                    is_checkpoint: true,
                    ..Dataset::default()
                };
                flush::nonblocking::wait(&ctx, &map, &state, &info).unwrap();

                if rank == 0 {
                    let index = flush::index::Index::read(&rig.prefix).unwrap();
                    assert_eq!(index.complete(1, &state.name), Some(true));
                    assert_eq!(index.current(), Some(state.name.as_str()));

                    let payload = state.dir.join(format!("rank_{rank}.dat"));
                    assert_eq!(std::fs::read(&payload).unwrap(), pattern(rank, 900));
                }
                assert!(!flushfile::need_flush(ctx.flush_file, 1, topo.local()).unwrap());
                done.store(true, Ordering::Relaxed);
            });
        }
    });
}
