#![deny(unsafe_code)]

//! Prints the node count recorded in a control directory.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, Command};
use kvtree::KvTree;

fn main() -> ExitCode {
    let matches = Command::new("scr_nodes_file")
        .about("Print the number of nodes recorded for a run")
        .arg(
            Arg::new("dir")
                .long("dir")
                .value_name("DIR")
                .required(true)
                .help("Control directory holding nodes.scr"),
        )
        .get_matches();

    let dir = PathBuf::from(matches.get_one::<String>("dir").expect("required arg"));
    match KvTree::read_file(&dir.join("nodes.scr")) {
        Ok(tree) => match tree.get_u64("NODES") {
            Some(nodes) => {
                println!("{nodes}");
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("scr_nodes_file: no NODES value recorded");
                ExitCode::FAILURE
            }
        },
        Err(err) => {
            eprintln!("scr_nodes_file: {err}");
            ExitCode::FAILURE
        }
    }
}
