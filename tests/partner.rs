//! PARTNER redundancy: losing one rank's files is repaired from its
//! partner on the other node.

mod common;

use common::{Cluster, pattern, run_ranks};
use engine::Scr;

const EXTRA: &[(&str, &str)] = &[
    ("SCR_COPY_TYPE", "PARTNER"),
    ("SCR_HOP_DISTANCE", "1"),
    ("SCR_CRC_ON_COPY", "1"),
];

#[test]
fn partner_restores_lost_rank() {
    let scratch = tempfile::tempdir().unwrap();
    // 4 ranks across 2 nodes: rank 0 pairs with rank 2, rank 1 with 3
    let cluster = Cluster::new(scratch.path(), 4, 2);

    run_ranks(4, |rank, comm| {
        let mut scr = Scr::init(Box::new(comm), cluster.options(rank, EXTRA)).unwrap();
        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
        std::fs::write(&path, pattern(rank, 1500 + rank * 100)).unwrap();
        scr.complete_checkpoint(true).unwrap();
        // the partner's mirrored copy landed beside our own files
        assert!(scr.cached_datasets().contains(&1));
    });

    // the mirrored copy of rank 0 lives on node 1 with rank 2
    let mirrored = cluster.dataset_dir(1, 1).join("rank_0.ckpt");
    assert!(mirrored.exists(), "partner copy missing");

    // node failure for rank 0's data
    cluster.kill_rank_files(0, 1);
    assert!(!cluster.dataset_dir(0, 1).join("rank_0.ckpt").exists());

    // restart: redistribute moves the partner copy back, then the
    // re-encode restores the mirror
    run_ranks(4, |rank, comm| {
        let mut scr = Scr::init(Box::new(comm), cluster.options(rank, EXTRA)).unwrap();
        assert_eq!(scr.dataset_id(), 1, "rank {rank} failed to recover");

        let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
        let content = std::fs::read(&path).unwrap();
        assert_eq!(content, pattern(rank, 1500 + rank * 100));

        // recorded CRC still matches the payload
        let meta = meta::read(&path).unwrap();
        assert_eq!(meta.crc32.unwrap(), fileio::crc32_file(&path).unwrap());
    });
}
