#![deny(unsafe_code)]

//! Exits 0 when the job in the given control directory must halt, 1
//! otherwise. Run by batch scripts deciding whether to launch another
//! attempt.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, Command};

fn main() -> ExitCode {
    let matches = Command::new("scr_retries_halt")
        .about("Test whether a run's halt file says to stop retrying")
        .arg(
            Arg::new("dir")
                .long("dir")
                .value_name("DIR")
                .required(true)
                .help("Control directory holding halt.scr"),
        )
        .get_matches();

    let dir = PathBuf::from(matches.get_one::<String>("dir").expect("required arg"));
    let values = match halt::read(&dir.join("halt.scr")) {
        Ok(values) => values,
        Err(err) => {
            eprintln!("scr_retries_halt: {err}");
            return ExitCode::FAILURE;
        }
    };

    let state = halt::HaltState::from_values(values);
    match state.check(logging::now_secs(), None) {
        Some(_) => ExitCode::SUCCESS,
        None => ExitCode::FAILURE,
    }
}
