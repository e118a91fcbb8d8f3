#![deny(unsafe_code)]

//! Lists or edits a halt file. Edits run as a locked read-modify-write
//! so concurrent runs and operators cannot clobber each other.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, ArgAction, Command};
use kvtree::KvTree;

fn print_values(values: &KvTree) {
    for key in [
        halt::KEY_EXIT_REASON,
        halt::KEY_SECONDS,
        halt::KEY_CHECKPOINTS,
        halt::KEY_EXIT_BEFORE,
        halt::KEY_EXIT_AFTER,
    ] {
        if let Some(value) = values.get_str(key) {
            println!("{key}: {value}");
        }
    }
}

fn main() -> ExitCode {
    let matches = Command::new("scr_halt_cntl")
        .about("List or edit a halt file")
        .arg(
            Arg::new("file")
                .short('f')
                .value_name("FILE")
                .required(true)
                .help("Halt file to operate on"),
        )
        .arg(
            Arg::new("list")
                .short('l')
                .action(ArgAction::SetTrue)
                .help("List the current halt settings"),
        )
        .arg(
            Arg::new("checkpoints")
                .short('c')
                .value_name("N")
                .help("Halt after N more checkpoints"),
        )
        .arg(
            Arg::new("before")
                .short('b')
                .value_name("SECS")
                .help("Halt before this epoch time (minus the halt seconds)"),
        )
        .arg(
            Arg::new("after")
                .short('a')
                .value_name("SECS")
                .help("Halt after this epoch time"),
        )
        .arg(
            Arg::new("seconds")
                .short('s')
                .value_name("SECS")
                .help("Set the halt-seconds margin"),
        )
        .arg(
            Arg::new("reason")
                .short('r')
                .value_name("REASON")
                .help("Set an explicit exit reason"),
        )
        .arg(
            Arg::new("clear-checkpoints")
                .long("xc")
                .action(ArgAction::SetTrue)
                .help("Clear the checkpoints-left field"),
        )
        .arg(
            Arg::new("clear-before")
                .long("xb")
                .action(ArgAction::SetTrue)
                .help("Clear the exit-before field"),
        )
        .arg(
            Arg::new("clear-after")
                .long("xa")
                .action(ArgAction::SetTrue)
                .help("Clear the exit-after field"),
        )
        .arg(
            Arg::new("clear-seconds")
                .long("xs")
                .action(ArgAction::SetTrue)
                .help("Clear the halt-seconds field"),
        )
        .arg(
            Arg::new("clear-reason")
                .long("xr")
                .action(ArgAction::SetTrue)
                .help("Clear the exit reason"),
        )
        .get_matches();

    let file = PathBuf::from(matches.get_one::<String>("file").expect("required arg"));

    if matches.get_flag("list") {
        return match halt::read(&file) {
            Ok(values) => {
                print_values(&values);
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("scr_halt_cntl: {err}");
                ExitCode::FAILURE
            }
        };
    }

    let sets: Vec<(&str, Option<&String>)> = vec![
        (halt::KEY_CHECKPOINTS, matches.get_one("checkpoints")),
        (halt::KEY_EXIT_BEFORE, matches.get_one("before")),
        (halt::KEY_EXIT_AFTER, matches.get_one("after")),
        (halt::KEY_SECONDS, matches.get_one("seconds")),
        (halt::KEY_EXIT_REASON, matches.get_one("reason")),
    ];
    let clears: Vec<(&str, bool)> = vec![
        (halt::KEY_CHECKPOINTS, matches.get_flag("clear-checkpoints")),
        (halt::KEY_EXIT_BEFORE, matches.get_flag("clear-before")),
        (halt::KEY_EXIT_AFTER, matches.get_flag("clear-after")),
        (halt::KEY_SECONDS, matches.get_flag("clear-seconds")),
        (halt::KEY_EXIT_REASON, matches.get_flag("clear-reason")),
    ];

    let result = halt::update(&file, |values| {
        for (key, value) in sets {
            if let Some(value) = value {
                values.set_str(key, value);
            }
        }
        for (key, clear) in clears {
            if clear {
                values.unset(key);
            }
        }
    });

    match result.and_then(|()| halt::read(&file)) {
        Ok(values) => {
            print_values(&values);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("scr_halt_cntl: {err}");
            ExitCode::FAILURE
        }
    }
}
