#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `engine` is the orchestrator of the SCR workspace: it resolves
//! parameters, builds the node topology and redundancy descriptor table,
//! and exposes the public checkpoint API as methods on an [`Scr`] value —
//! the single owner of all library state for the process.
//!
//! The application drives one loop:
//!
//! ```text
//! let mut scr = Scr::init(world, options)?;
//! while work_remains {
//!     compute();
//!     if scr.need_checkpoint()? {
//!         scr.start_checkpoint()?;
//!         let path = scr.route_file("rank_0.ckpt")?;
//!         write_state(&path);
//!         scr.complete_checkpoint(true)?;
//!     }
//! }
//! scr.finalize()?;
//! ```
//!
//! `init` doubles as restart: it gathers whatever filemaps survive in
//! the control directory, redistributes cached files to match the new
//! rank layout, rebuilds anything a redundancy scheme can rebuild, and
//! falls back to fetching from the parallel file system.
//!
//! # Invariants
//!
//! - Every rank of the job calls every public method in the same order
//!   (SPMD discipline); the methods contain the necessary collectives.
//! - Exactly one `init`/`finalize` pair runs per process.

mod config;
mod error;
mod params;
mod state;

pub use config::{parse as parse_config, read as read_config};
pub use error::ScrError;
pub use params::{Params, parse_bytes};
pub use state::{InitOptions, Scr, SecsRemaining};
