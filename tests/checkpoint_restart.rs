//! End-to-end checkpoint and restart scenarios on a single pretend node.

mod common;

use common::{Cluster, pattern, run_ranks};
use engine::{Scr, ScrError};
use group::Communicator;

#[test]
fn local_checkpoint_survives_restart() {
    let scratch = tempfile::tempdir().unwrap();
    let cluster = Cluster::new(scratch.path(), 2, 2);

    // first run: write one checkpoint and shut down cleanly
    run_ranks(2, |rank, comm| {
        let mut scr = Scr::init(Box::new(comm), cluster.options(rank, &[])).unwrap();
        assert!(scr.need_checkpoint().unwrap());

        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
        std::fs::write(&path, format!("hello {rank}")).unwrap();
        scr.complete_checkpoint(true).unwrap();
        assert_eq!(scr.dataset_id(), 1);

        scr.finalize().unwrap();
    });

    // the finalize halt marker would stop a rerun; reset it as the
    // operator would before relaunching
    cluster.clear_halt_files();

    // second run: restart picks the dataset up from cache
    run_ranks(2, |rank, comm| {
        let mut scr = Scr::init(Box::new(comm), cluster.options(rank, &[])).unwrap();
        assert_eq!(scr.dataset_id(), 1);
        assert_eq!(scr.cached_datasets(), vec![1]);

        let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("hello {rank}"));
    });
}

#[test]
fn eviction_keeps_cache_size_datasets() {
    let scratch = tempfile::tempdir().unwrap();
    let cluster = Cluster::new(scratch.path(), 2, 2);

    run_ranks(2, |rank, comm| {
        let opts = cluster.options(rank, &[("SCR_CACHE_SIZE", "2")]);
        let mut scr = Scr::init(Box::new(comm), opts).unwrap();

        for id in 1..=3u64 {
            scr.start_checkpoint().unwrap();
            let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
            std::fs::write(&path, pattern(rank, 256)).unwrap();
            scr.complete_checkpoint(true).unwrap();
            assert_eq!(scr.dataset_id(), id);
        }

        // the oldest dataset fell off; the newest two remain
        assert_eq!(scr.cached_datasets(), vec![2, 3]);
    });

    assert!(!cluster.dataset_dir(0, 1).exists());
    assert!(cluster.dataset_dir(0, 2).exists());
    assert!(cluster.dataset_dir(0, 3).exists());
}

#[test]
fn halt_countdown_stops_the_job() {
    let scratch = tempfile::tempdir().unwrap();
    let cluster = Cluster::new(scratch.path(), 2, 2);

    run_ranks(2, |rank, comm| {
        let mut scr = Scr::init(Box::new(comm), cluster.options(rank, &[])).unwrap();

        // an operator grants exactly one more checkpoint
        if rank == 0 {
            halt::update(&cluster.cntl_dir(0).join("halt.scr"), |values| {
                values.set_i64(halt::KEY_CHECKPOINTS, 1);
            })
            .unwrap();
        }
        scr.topology().world().barrier().unwrap();

        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
        std::fs::write(&path, b"last one").unwrap();
        let result = scr.complete_checkpoint(true);
        assert!(
            matches!(result, Err(ScrError::Halted(_))),
            "expected a halt, got {result:?}"
        );
    });
}

#[test]
fn misordered_calls_are_rejected() {
    let scratch = tempfile::tempdir().unwrap();
    let cluster = Cluster::new(scratch.path(), 1, 1);

    run_ranks(1, |rank, comm| {
        let mut scr = Scr::init(Box::new(comm), cluster.options(rank, &[])).unwrap();
        assert!(matches!(
            scr.complete_checkpoint(true),
            Err(ScrError::InvalidCall(_))
        ));
        scr.start_checkpoint().unwrap();
        assert!(matches!(
            scr.start_checkpoint(),
            Err(ScrError::InvalidCall(_))
        ));
    });
}
