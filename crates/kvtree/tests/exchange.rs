//! The sparse exchange must deliver exactly what a naïve direct
//! all-to-all would, for any assignment of destinations.

use std::sync::Arc;
use std::thread;

use group::{Communicator, LocalComm, LocalWorld};
use kvtree::{KvTree, exchange};
use proptest::prelude::*;

/// Direct n-squared reference: announce senders with an all-to-all of
/// flags, then move every payload point-to-point.
fn naive_exchange(tree_send: &KvTree, comm: &dyn Communicator) -> KvTree {
    let size = comm.size();
    let mut flags = vec![0i64; size];
    for key in tree_send.keys() {
        flags[key.parse::<usize>().unwrap()] = 1;
    }
    let senders = comm.alltoall_i64(&flags).unwrap();

    for (key, sub) in tree_send.iter() {
        let dest: usize = key.parse().unwrap();
        exchange::send(sub, dest, comm).unwrap();
    }

    let mut tree_recv = KvTree::new();
    for src in 0..size {
        if senders[src] != 0 {
            tree_recv.set(src.to_string(), exchange::recv(src, comm).unwrap());
        }
    }
    tree_recv
}

fn run_case(sends: Vec<Vec<(usize, u64)>>) {
    let n = sends.len();
    let world = LocalWorld::new(n);
    let sends = Arc::new(sends);

    let handles: Vec<_> = world
        .into_comms()
        .into_iter()
        .map(|comm: LocalComm| {
            let sends = Arc::clone(&sends);
            thread::spawn(move || {
                let mut tree_send = KvTree::new();
                for &(dest, val) in &sends[comm.rank()] {
                    tree_send.ensure_int(dest as i64).set_u64("VAL", val);
                }

                let via_bruck = exchange::exchange(&tree_send, &comm).unwrap();
                let via_naive = naive_exchange(&tree_send, &comm);
                assert_eq!(via_bruck, via_naive, "rank {} results differ", comm.rank());

                // spot-check contents against the global send assignment
                for (src, dests) in sends.iter().enumerate() {
                    for &(dest, val) in dests {
                        if dest == comm.rank() {
                            let from_src = via_bruck.get_int(src as i64).unwrap();
                            assert_eq!(from_src.get_u64("VAL"), Some(val));
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn matches_naive_reference(
        case in (2usize..7).prop_flat_map(|n| {
            proptest::collection::vec(
                proptest::collection::btree_map(0..n, any::<u64>(), 0..n),
                n,
            )
        })
    ) {
        let sends: Vec<Vec<(usize, u64)>> = case
            .into_iter()
            .map(|m| m.into_iter().collect())
            .collect();
        run_case(sends);
    }
}

#[test]
fn ring_shift_delivers() {
    // every rank sends one tree to its right neighbour
    let n = 5;
    let sends: Vec<Vec<(usize, u64)>> = (0..n).map(|r| vec![((r + 1) % n, r as u64)]).collect();
    run_case(sends);
}

#[test]
fn empty_exchange_yields_empty_trees() {
    run_case(vec![Vec::new(), Vec::new(), Vec::new()]);
}
