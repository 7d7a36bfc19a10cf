//! Input sequencer (design §2, component share 6%).
//!
//! Iterates the input list, opens each, detects size (file/block-device/
//! pipe), and rejects input == output. A thin `File`-owning newtype with
//! a `From<Errno>`-mapped open error.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::{fstat, stat, FileStat, SFlag};

use error::{Error, Result};

/// What kind of thing an input descriptor names, and whether its size is
/// knowable up front (design §3 "Input descriptor").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    RegularFile,
    BlockDevice,
    /// Pipe, fifo, character device, or socket: size is never known.
    Unsized,
}

/// One opened input source plus the bookkeeping the sequencer needs:
/// its declared name (for error messages and `%N`), its kind, and its
/// size if knowable.
#[derive(Debug)]
pub struct Input {
    pub name: String,
    pub file: File,
    pub kind: InputKind,
    pub size: Option<u64>,
    /// Bytes already present before we started reading (design §3
    /// "initial-offset"), used so rate accounting on files opened at a
    /// nonzero position (e.g. after a previous skip) stays accurate.
    pub initial_offset: u64,
}

impl Input {
    /// Opens `path` (or stdin, for `"-"`), classifies it, and measures its
    /// size where that's possible without disturbing the read position.
    pub fn open(path: &str) -> Result<Input> {
        let file = if path == "-" {
            // NOTE(unsafe): fd 0 is always valid for the lifetime of the
            // process, so wrapping it in an owned `File` here is sound.
            unsafe { File::from_raw_fd(0) }
        } else {
            OpenOptions::new()
                .read(true)
                .open(path)
                .map_err(|inner| Error::InputOpen {
                    path: path.to_owned(),
                    inner,
                })?
        };

        let st = fstat(file.as_raw_fd()).map_err(|_| Error::InputOpen {
            path: path.to_owned(),
            inner: io::Error::last_os_error(),
        })?;

        let (kind, size) = classify(&file, &st)?;

        Ok(Input {
            name: path.to_owned(),
            file,
            kind,
            size,
            initial_offset: 0,
        })
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        set_nonblocking_fd(self.file.as_raw_fd(), nonblocking)
    }
}

/// Puts an arbitrary fd into (or out of) non-blocking mode. The transfer
/// engine's readiness wait (design §4.1) only tells us a fd *became* ready;
/// without `O_NONBLOCK` a subsequent read/write on a pipe whose peer raced us
/// could still block the whole process, so both the input side (here) and
/// the sink side (`state::open_sink`) need this, not just one.
pub fn set_nonblocking_fd(fd: RawFd, nonblocking: bool) -> Result<()> {
    let mut flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

impl AsRawFd for Input {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

fn classify(file: &File, st: &FileStat) -> Result<(InputKind, Option<u64>)> {
    let mode = SFlag::from_bits_truncate(st.st_mode);
    if mode.contains(SFlag::S_IFREG) {
        Ok((InputKind::RegularFile, Some(st.st_size as u64)))
    } else if mode.contains(SFlag::S_IFBLK) {
        // Block devices don't report their size in `st_size`; discover it
        // by seeking to the end and rewinding, per design §3.
        use std::io::{Seek, SeekFrom};
        let mut f = file.try_clone()?;
        let end = f.seek(SeekFrom::End(0))?;
        f.seek(SeekFrom::Start(0))?;
        Ok((InputKind::BlockDevice, Some(end)))
    } else {
        Ok((InputKind::Unsized, None))
    }
}

/// Rejects the case where an input is, by device+inode, the same file as
/// the output (design §3 "Input-is-output collision"). Only applies to
/// regular files and block devices — a pipe can't collide with itself this
/// way since two distinct fds over the same fifo are a legitimate setup.
pub fn collides_with_output(input: &Input, output_path: &str) -> Result<bool> {
    if input.kind == InputKind::Unsized {
        return Ok(false);
    }
    let out_stat = match stat(Path::new(output_path)) {
        Ok(st) => st,
        Err(_) => return Ok(false),
    };
    let in_stat = fstat(input.as_raw_fd())?;
    Ok(in_stat.st_dev == out_stat.st_dev && in_stat.st_ino == out_stat.st_ino)
}

/// Sums the sizes of all sized inputs; per design §3, the total is zero if
/// any input's size is unknown.
pub fn total_size(inputs: &[Input]) -> u64 {
    let mut total = 0u64;
    for input in inputs {
        match input.size {
            Some(size) => total += size,
            None => return 0,
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn regular_file_reports_size() {
        let mut tmp = tempfile_for_test();
        tmp.write_all(b"hello world").unwrap();
        let path = tmp.path_str();
        let input = Input::open(&path).unwrap();
        assert_eq!(input.kind, InputKind::RegularFile);
        assert_eq!(input.size, Some(11));
    }

    #[test]
    fn total_size_is_zero_if_any_input_unsized() {
        let mut tmp = tempfile_for_test();
        tmp.write_all(b"1234567890").unwrap();
        let sized = Input::open(&tmp.path_str()).unwrap();
        let (r, _w) = nix::unistd::pipe().unwrap();
        let unsized_input = Input {
            name: "pipe".into(),
            file: unsafe { File::from_raw_fd(r) },
            kind: InputKind::Unsized,
            size: None,
            initial_offset: 0,
        };
        assert_eq!(total_size(&[sized, unsized_input]), 0);
    }

    // Minimal local helper rather than pulling in a tempfile dependency this
    // crate doesn't otherwise need.
    struct TestFile {
        path: std::path::PathBuf,
        file: File,
    }

    impl TestFile {
        fn path_str(&self) -> String {
            self.path.to_str().unwrap().to_owned()
        }
    }

    impl Write for TestFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.file.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl Drop for TestFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn tempfile_for_test() -> TestFile {
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        let path = std::env::temp_dir().join(format!("pv-test-{}-{}", pid, nonce));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        TestFile { path, file }
    }
}
