#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;
extern crate failure;
extern crate libc;
extern crate nix;
extern crate strum;
#[macro_use]
extern crate strum_macros;

pub mod clock;
pub mod config;
pub mod cursor;
pub mod display;
pub mod error;
pub mod input;
pub mod main_loop;
pub mod remote;
pub mod signal;
pub mod state;
pub mod transfer;
pub mod watch;

pub use config::{Config, ExitStatus};
pub use error::{Error, Result};
pub use main_loop::RunRequest;

/// The crate's single entry point: runs a whole transfer to completion and
/// returns the accumulated exit-status bitmask (design §1/§6). Everything
/// above this — argument parsing, environment lookups, process exit-code
/// translation — belongs to the external driver in `bin/pv.rs`, not here.
pub fn run(request: RunRequest) -> ExitStatus {
    main_loop::run(request)
}
