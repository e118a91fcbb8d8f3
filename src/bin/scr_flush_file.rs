#![deny(unsafe_code)]

//! Inspects and manipulates a node's flush file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, ArgAction, Command};

fn main() -> ExitCode {
    let matches = Command::new("scr_flush_file")
        .about("Inspect and manipulate a run's flush file")
        .arg(
            Arg::new("dir")
                .long("dir")
                .value_name("DIR")
                .required(true)
                .help("Control directory holding flush.scr"),
        )
        .arg(
            Arg::new("list-ckpt")
                .long("list-ckpt")
                .action(ArgAction::SetTrue)
                .help("List dataset ids present in the flush file"),
        )
        .arg(
            Arg::new("need-flush")
                .long("need-flush")
                .value_name("ID")
                .help("Exit 0 when the dataset still needs a flush"),
        )
        .arg(
            Arg::new("location")
                .long("location")
                .value_name("ID")
                .help("Print the recorded locations of the dataset"),
        )
        .arg(
            Arg::new("latest")
                .long("latest")
                .action(ArgAction::SetTrue)
                .help("Print the most recent dataset id present"),
        )
        .arg(
            Arg::new("resume")
                .long("resume")
                .value_name("ID")
                .help("Command the data-mover to resume its queued transfer"),
        )
        .arg(
            Arg::new("summary")
                .long("summary")
                .value_name("ID")
                .help("Clear the FLUSHING marker once the dataset's summary is on the PFS"),
        )
        .get_matches();

    let dir = PathBuf::from(matches.get_one::<String>("dir").expect("required arg"));
    let path = dir.join("flush.scr");

    let tree = match flush::flushfile::read(&path) {
        Ok(tree) => tree,
        Err(err) => {
            eprintln!("scr_flush_file: {err}");
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("list-ckpt") {
        for id in flush::flushfile::datasets(&tree) {
            println!("{id}");
        }
        return ExitCode::SUCCESS;
    }

    if matches.get_flag("latest") {
        return match flush::flushfile::datasets(&tree).last() {
            Some(id) => {
                println!("{id}");
                ExitCode::SUCCESS
            }
            None => ExitCode::FAILURE,
        };
    }

    if let Some(id) = matches.get_one::<String>("need-flush") {
        let Ok(id) = id.parse::<u64>() else {
            eprintln!("scr_flush_file: bad dataset id '{id}'");
            return ExitCode::FAILURE;
        };
        let locations = flush::flushfile::locations(&tree, id);
        let in_cache = locations.iter().any(|l| l == "CACHE");
        let in_pfs = locations.iter().any(|l| l == "PFS");
        return if in_cache && !in_pfs {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    if let Some(id) = matches.get_one::<String>("location") {
        let Ok(id) = id.parse::<u64>() else {
            eprintln!("scr_flush_file: bad dataset id '{id}'");
            return ExitCode::FAILURE;
        };
        let locations = flush::flushfile::locations(&tree, id);
        if locations.is_empty() {
            return ExitCode::FAILURE;
        }
        for location in locations {
            println!("{location}");
        }
        return ExitCode::SUCCESS;
    }

    if matches.get_one::<String>("resume").is_some() {
        // wake the mover back up for whatever is still queued
        let transfer = dir.join("transfer.scr");
        let result = kvtree::file::lock_open_read(&transfer).and_then(|(lock, mut tree)| {
            tree.set_str("COMMAND", "RUN");
            kvtree::file::write_close_unlock(lock, &tree)
        });
        return match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("scr_flush_file: {err}");
                ExitCode::FAILURE
            }
        };
    }

    if let Some(id) = matches.get_one::<String>("summary") {
        let Ok(id) = id.parse::<u64>() else {
            eprintln!("scr_flush_file: bad dataset id '{id}'");
            return ExitCode::FAILURE;
        };
        // the summary is down once the dataset reached the PFS; only
        // then may the in-flight marker be cleared
        let locations = flush::flushfile::locations(&tree, id);
        if !locations.iter().any(|l| l == "PFS") {
            return ExitCode::FAILURE;
        }
        let result = kvtree::file::lock_open_read(&path).and_then(|(lock, mut tree)| {
            if let Some(ckpt) = tree
                .get_mut("CKPT")
                .and_then(|c| c.get_mut(&id.to_string()))
            {
                ckpt.unset_kv("LOCATION", "FLUSHING");
            }
            kvtree::file::write_close_unlock(lock, &tree)
        });
        return match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("scr_flush_file: {err}");
                ExitCode::FAILURE
            }
        };
    }

    // no action flag: print the whole file
    print!("{tree}");
    ExitCode::SUCCESS
}
