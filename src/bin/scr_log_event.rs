#![deny(unsafe_code)]

//! Appends one event row to a prefix's record log.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, Command};
use logging::EventRecord;

fn main() -> ExitCode {
    let matches = Command::new("scr_log_event")
        .about("Append an event record to a prefix's log")
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
                .help("Event type string"),
        )
        .arg(
            Arg::new("note")
                .long("note")
                .short('n')
                .value_name("TEXT")
                .help("Free-form note"),
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
        .get_matches();

    let prefix = PathBuf::from(matches.get_one::<String>("prefix").expect("required arg"));
    let record = EventRecord {
        kind: matches.get_one::<String>("type").expect("required arg").clone(),
        note: matches.get_one::<String>("note").cloned(),
        dataset: matches
            .get_one::<String>("dset")
            .and_then(|v| v.parse().ok()),
        start: matches
            .get_one::<String>("start")
            .and_then(|v| v.parse().ok()),
        secs: matches
            .get_one::<String>("secs")
            .and_then(|v| v.parse().ok()),
    };

    match logging::log_event(&prefix, &record) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("scr_log_event: {err}");
            ExitCode::FAILURE
        }
    }
}
