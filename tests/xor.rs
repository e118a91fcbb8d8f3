//! XOR redundancy: single-rank loss rebuilds byte-identical files; a
//! double loss in one set falls back to the PFS fetch.

mod common;

use common::{Cluster, pattern, run_ranks};
use engine::Scr;

const EXTRA: &[(&str, &str)] = &[
    ("SCR_COPY_TYPE", "XOR"),
    ("SCR_SET_SIZE", "4"),
    ("SCR_HOP_DISTANCE", "1"),
    // keep transfers small so multiple ring slices are exercised
    ("SCR_MPI_BUF_SIZE", "512"),
];

fn file_len(rank: usize) -> usize {
    rank * 1024 + 7
}

fn write_checkpoint(cluster: &Cluster, rank: usize, comm: group::LocalComm, extra: &[(&str, &str)]) {
    let mut settings = EXTRA.to_vec();
    settings.extend_from_slice(extra);
    let mut scr = Scr::init(Box::new(comm), cluster.options(rank, &settings)).unwrap();
    scr.start_checkpoint().unwrap();
    let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
    std::fs::write(&path, pattern(rank, file_len(rank))).unwrap();
    scr.complete_checkpoint(true).unwrap();
}

#[test]
fn single_loss_rebuilds_byte_identical() {
    let scratch = tempfile::tempdir().unwrap();
    // 8 ranks on 4 nodes: two XOR sets of four, one per level group
    let cluster = Cluster::new(scratch.path(), 8, 2);

    run_ranks(8, |rank, comm| write_checkpoint(&cluster, rank, comm, &[]));

    // every rank owns one parity chunk
    let chunk = std::fs::read_dir(cluster.dataset_dir(2, 1))
        .unwrap()
        .flatten()
        .any(|e| e.path().extension().is_some_and(|x| x == "xor"));
    assert!(chunk, "no chunk file written");

    cluster.kill_rank_files(4, 1);

    run_ranks(8, |rank, comm| {
        let mut scr = Scr::init(Box::new(comm), cluster.options(rank, EXTRA)).unwrap();
        assert_eq!(scr.dataset_id(), 1, "rank {rank} failed to recover");

        let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
        let content = std::fs::read(&path).unwrap();
        assert_eq!(
            content,
            pattern(rank, file_len(rank)),
            "rank {rank} content differs after rebuild"
        );
    });
}

#[test]
fn empty_files_encode_with_unit_chunk() {
    let scratch = tempfile::tempdir().unwrap();
    // 4 ranks on 4 nodes: one set, every file empty
    let cluster = Cluster::new(scratch.path(), 4, 1);

    run_ranks(4, |rank, comm| {
        let mut scr = Scr::init(Box::new(comm), cluster.options(rank, EXTRA)).unwrap();
        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
        std::fs::write(&path, b"").unwrap();
        scr.complete_checkpoint(true).unwrap();
    });

    cluster.kill_rank_files(1, 1);

    run_ranks(4, |rank, comm| {
        let mut scr = Scr::init(Box::new(comm), cluster.options(rank, EXTRA)).unwrap();
        assert_eq!(scr.dataset_id(), 1);
        let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
        assert_eq!(fileio::file_size(&path).unwrap(), 0);
    });
}

#[test]
fn double_loss_falls_back_to_fetch() {
    let scratch = tempfile::tempdir().unwrap();
    let cluster = Cluster::new(scratch.path(), 8, 2);

    // flush every checkpoint so the PFS holds a copy
    run_ranks(8, |rank, comm| {
        write_checkpoint(&cluster, rank, comm, &[("SCR_FLUSH", "1")]);
    });
    assert!(flush::index::index_path(&cluster.prefix()).exists());

    // two failures in the same set exceed what XOR tolerates
    cluster.kill_rank_files(2, 1);
    cluster.kill_rank_files(4, 1);

    run_ranks(8, |rank, comm| {
        let mut settings = EXTRA.to_vec();
        settings.push(("SCR_FLUSH", "1"));
        let mut scr = Scr::init(Box::new(comm), cluster.options(rank, &settings)).unwrap();
        assert_eq!(scr.dataset_id(), 1, "rank {rank} did not fetch");

        let path = scr.route_file(&format!("rank_{rank}.ckpt")).unwrap();
        let content = std::fs::read(&path).unwrap();
        assert_eq!(content, pattern(rank, file_len(rank)));
    });
}
