#![deny(unsafe_code)]

//! Pretty-prints any tree-store file.

use std::process::ExitCode;

use clap::{Arg, Command};
use kvtree::KvTree;

fn main() -> ExitCode {
    let matches = Command::new("scr_print_hash_file")
        .about("Print the contents of a tree-store file")
        .arg(
            Arg::new("file")
                .value_name("FILE")
                .required(true)
                .help("Tree-store file to print"),
        )
        .get_matches();

    let file = matches.get_one::<String>("file").expect("required arg");
    match KvTree::read_file(std::path::Path::new(file)) {
        Ok(tree) => {
            print!("{tree}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("scr_print_hash_file: {err}");
            ExitCode::FAILURE
        }
    }
}
