#![deny(unsafe_code)]

//! Appends one transfer row to a prefix's record log.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, Command};
use logging::TransferRecord;

fn main() -> ExitCode {
    let matches = Command::new("scr_log_transfer")
        .about("Append a transfer record to a prefix's log")
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .short('p')
                .value_name("DIR")
                .required(true)
                .help("PFS prefix directory"),
        )
        .arg(
            Arg::new("type")
                .long("type")
                .short('t')
                .value_name("TYPE")
                .required(true)
                .help("Transfer type string"),
        )
        .arg(
            Arg::new("from")
                .long("from")
                .short('f')
                .value_name("PATH")
                .help("Source path"),
        )
        .arg(
            Arg::new("to")
                .long("to")
                .short('o')
                .value_name("PATH")
                .help("Destination path"),
        )
        .arg(
            Arg::new("dset")
                .long("dset")
                .short('d')
                .value_name("ID")
                .help("Dataset id"),
        )
        .arg(
            Arg::new("start")
                .long("start")
                .short('S')
                .value_name("SECS")
                .help("Start time in epoch seconds"),
        )
        .arg(
            Arg::new("secs")
                .long("secs")
                .short('L')
                .value_name("SECS")
                .help("Duration in seconds"),
        )
        .arg(
            Arg::new("bytes")
                .long("bytes")
                .short('b')
                .value_name("N")
                .help("Bytes moved"),
        )
        .get_matches();

    let prefix = PathBuf::from(matches.get_one::<String>("prefix").expect("required arg"));
    let record = TransferRecord {
        kind: matches.get_one::<String>("type").expect("required arg").clone(),
        from: matches.get_one::<String>("from").cloned(),
        to: matches.get_one::<String>("to").cloned(),
        dataset: matches
            .get_one::<String>("dset")
            .and_then(|v| v.parse().ok()),
        start: matches
            .get_one::<String>("start")
            .and_then(|v| v.parse().ok()),
        secs: matches
            .get_one::<String>("secs")
            .and_then(|v| v.parse().ok()),
        bytes: matches
            .get_one::<String>("bytes")
            .and_then(|v| v.parse().ok()),
    };

    match logging::log_transfer(&prefix, &record) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("scr_log_transfer: {err}");
            ExitCode::FAILURE
        }
    }
}
