use std::io;
use std::path::PathBuf;

use nix;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Every fallible operation in the core funnels through this enum so that
/// the main loop can fold failures into the exit-status bitmask (see
/// `Error::exit_bit`) instead of matching on ad hoc string errors.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "{}: {}", path, inner)]
    InputOpen { path: String, inner: io::Error },

    #[fail(display = "{}: input file is output file", path)]
    InputIsOutput { path: String },

    #[fail(display = "{}: {}", path, inner)]
    Read { path: String, inner: io::Error },

    #[fail(display = "write failed: {}", inner)]
    Write { inner: io::Error },

    #[fail(display = "failed to allocate transfer buffer of {} bytes", size)]
    Alloc { size: usize },

    #[fail(display = "terminated by signal")]
    Aborted,

    #[fail(display = "cursor coordination unavailable: {}", inner)]
    Cursor { inner: nix::Error },

    #[fail(display = "lockfile {:?}: {}", path, inner)]
    Lock { path: PathBuf, inner: io::Error },

    #[fail(display = "remote control message not received")]
    RemoteNotReceived,

    #[fail(display = "remote control channel error: {}", inner)]
    Remote { inner: nix::Error },

    #[fail(display = "{}", inner)]
    Nix { inner: nix::Error },

    #[fail(display = "{}", inner)]
    Io { inner: io::Error },
}

impl Error {
    /// Maps an error to the bit it contributes to the process exit status,
    /// per the design's error handling section: 2/4/8/16/32/64, bitwise-OR'd
    /// over the whole run. Errors that degrade silently (cursor, lock,
    /// remote) contribute nothing.
    pub fn exit_bit(&self) -> u32 {
        match *self {
            Error::InputOpen { .. } => 2,
            Error::InputIsOutput { .. } => 4,
            Error::Read { .. } => 16,
            Error::Write { .. } => 16,
            Error::Alloc { .. } => 64,
            Error::Aborted => 32,
            Error::Cursor { .. } => 0,
            Error::Lock { .. } => 0,
            Error::RemoteNotReceived => 0,
            Error::Remote { .. } => 0,
            Error::Nix { .. } => 16,
            Error::Io { .. } => 16,
        }
    }
}

impl From<nix::Error> for Error {
    fn from(inner: nix::Error) -> Self {
        Error::Nix { inner }
    }
}

impl From<io::Error> for Error {
    fn from(inner: io::Error) -> Self {
        Error::Io { inner }
    }
}
