//! Cursor coordinator (design §4.3): negotiates one terminal row per
//! sibling instance when several copies share a diagnostic stream.
//!
//! This module is one of the few places outside `transfer.rs` that drops
//! below `nix`'s safe wrappers to raw `libc` FFI (each call carries a
//! `NOTE(unsafe)` comment), because POSIX shared memory and `flock`
//! byte-range locking on a tty have no safe abstraction in this crate's
//! dependency set.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_void, mode_t, off_t, O_CREAT, O_EXCL, O_NOFOLLOW, O_RDWR};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;

use error::{Error, Result};

/// Layout of the shared segment: the Y-coordinate of the topmost sibling,
/// and how many siblings are currently attached. Plain `AtomicI32`s rather
/// than a mutex-guarded struct — the mutual-exclusion lock (tty or
/// lockfile) already serializes every access that matters (design §4.3
/// step 4: "under the lock").
#[repr(C)]
struct SharedRecord {
    top_y: AtomicI32,
    attach_count: AtomicI32,
}

const SEGMENT_SIZE: usize = std::mem::size_of::<SharedRecord>();

enum Lock {
    Tty(File),
    LockFile(File, PathBuf),
}

impl Lock {
    fn acquire(&self) -> Result<()> {
        let fd = match self {
            Lock::Tty(f) => f.as_raw_fd(),
            Lock::LockFile(f, _) => f.as_raw_fd(),
        };
        flock(fd, FlockArg::LockExclusive).map_err(|inner| Error::Cursor { inner })
    }

    fn release(&self) -> Result<()> {
        let fd = match self {
            Lock::Tty(f) => f.as_raw_fd(),
            Lock::LockFile(f, _) => f.as_raw_fd(),
        };
        flock(fd, FlockArg::Unlock).map_err(|inner| Error::Cursor { inner })
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Lock::LockFile(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

struct Shared {
    ptr: *mut SharedRecord,
    shm_fd: RawFd,
    name: String,
    owner: bool,
}

impl Shared {
    fn record(&self) -> &SharedRecord {
        unsafe { &*self.ptr }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // NOTE(unsafe): ptr came from a successful mmap of exactly
        // SEGMENT_SIZE bytes and is only ever read through `record()`.
        unsafe {
            let _ = munmap(self.ptr as *mut c_void, SEGMENT_SIZE);
        }
        unsafe {
            libc::close(self.shm_fd);
        }
        if self.owner {
            if let Ok(name) = CString::new(self.name.clone()) {
                unsafe {
                    libc::shm_unlink(name.as_ptr());
                }
            }
        }
    }
}

/// Coordinates a row among sibling instances sharing one terminal.
pub struct CursorCoordinator {
    lock: Lock,
    shared: Option<Shared>,
    top_y: u16,
    own_offset: u16,
    terminal_height: u16,
    is_first: bool,
}

impl CursorCoordinator {
    /// Attempts to set up cursor coordination on `tty_fd` (the diagnostic
    /// stream's underlying terminal). Returns `None` rather than an error
    /// when coordination simply isn't available (design: "if unresolvable,
    /// silently disable cursor mode") — callers fall back to plain
    /// carriage-return overwrite.
    pub fn new(tty_fd: RawFd, terminal_height: u16) -> Option<Self> {
        let tty_path = resolve_tty_path(tty_fd)?;
        let euid = nix::unistd::geteuid();

        let lock = acquire_lock(&tty_path, tty_fd, euid.as_raw()).ok()?;
        lock.acquire().ok()?;

        let shm_name = shared_memory_name(&tty_path, euid.as_raw());
        let shared = attach_shared(&shm_name).ok();

        let (top_y, own_offset, is_first) = match &shared {
            Some(shared) => {
                let attach_count = shared.record().attach_count.fetch_add(1, Ordering::SeqCst) + 1;
                if attach_count == 1 {
                    let y = query_cursor_row(tty_fd).unwrap_or(0);
                    shared.record().top_y.store(i32::from(y), Ordering::SeqCst);
                    (y, 0, true)
                } else {
                    let y = shared.record().top_y.load(Ordering::SeqCst) as u16;
                    (y, (attach_count - 1) as u16, false)
                }
            }
            None => {
                // Shared memory unavailable: best-effort per-terminal
                // serialization (design §4.3 "If shared memory is
                // unavailable").
                let y = query_cursor_row(tty_fd).unwrap_or(0);
                (y, 0, true)
            }
        };

        let _ = lock.release();

        Some(CursorCoordinator {
            lock,
            shared,
            top_y,
            own_offset,
            terminal_height,
            is_first,
        })
    }

    /// Renders `line` at this instance's row. Scrolls first if the
    /// combined height of all siblings has outgrown the terminal.
    pub fn update(&mut self, tty: &mut impl io::Write, line: &str) -> io::Result<()> {
        self.lock.acquire().map_err(to_io_error)?;

        if let Some(shared) = &self.shared {
            let attach_count = shared.record().attach_count.load(Ordering::SeqCst) as u16;
            if self.top_y + attach_count > self.terminal_height && self.is_first {
                let scroll = (self.top_y + attach_count) - self.terminal_height;
                for _ in 0..scroll {
                    write!(tty, "\n")?;
                }
                self.top_y = self.top_y.saturating_sub(scroll);
                shared.record().top_y.store(i32::from(self.top_y), Ordering::SeqCst);
            }
        }

        write!(tty, "\x1b[{};1H{}", self.top_y + self.own_offset, line)?;
        tty.flush()?;

        self.lock.release().map_err(to_io_error)
    }

    /// Moves the cursor below the last sibling and, if this was the last
    /// attached instance, destroys the shared segment (design §4.3
    /// "Teardown").
    pub fn teardown(&mut self, tty: &mut impl io::Write) {
        let _ = self.lock.acquire();

        let last_row = if let Some(shared) = &self.shared {
            let remaining = shared.record().attach_count.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining <= 0 {
                if let Some(shared) = self.shared.take() {
                    // `Shared::drop` unlinks the segment since `owner` was
                    // set at creation time for whichever instance created it.
                    drop(shared);
                }
            }
            self.top_y + self.own_offset + 1
        } else {
            self.top_y + self.own_offset + 1
        };

        let _ = write!(tty, "\x1b[{};1H", last_row);
        let _ = tty.flush();
        let _ = self.lock.release();
    }
}

fn to_io_error(e: Error) -> io::Error {
    match e {
        Error::Cursor { inner } => io::Error::from_raw_os_error(inner as i32),
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

fn resolve_tty_path(fd: RawFd) -> Option<PathBuf> {
    let mut buf = vec![0u8; 256];
    // NOTE(unsafe): ttyname_r writes a NUL-terminated path into `buf` and
    // returns 0 on success; `fd` is owned by the caller for the duration
    // of this call.
    let rc = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0)?;
    buf.truncate(len);
    Some(PathBuf::from(String::from_utf8(buf).ok()?))
}

fn lockfile_path(tty_path: &Path, euid: u32) -> PathBuf {
    let basename = tty_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    std::env::temp_dir().join(format!("pv-{}-{}.lock", basename, euid))
}

fn acquire_lock(tty_path: &Path, tty_fd: RawFd, euid: u32) -> Result<Lock> {
    // First preference: lock the terminal device itself, so unrelated
    // instances watching the same tty serialize without any file of their
    // own (design §4.3 step 2). `F_SETLK`-on-a-tty is refused by most
    // drivers, so failure here is expected and not logged as an error.
    let tty_file = OpenOptions::new().write(true).open(tty_path);
    if let Ok(f) = tty_file {
        if flock(f.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_ok() {
            let _ = flock(f.as_raw_fd(), FlockArg::Unlock);
            return Ok(Lock::Tty(f));
        }
    }
    let _ = tty_fd;

    let path = lockfile_path(tty_path, euid);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .custom_flags(O_NOFOLLOW)
        .open(&path)
        .map_err(|inner| Error::Lock { path: path.clone(), inner })?;
    Ok(Lock::LockFile(file, path))
}

fn shared_memory_name(tty_path: &Path, euid: u32) -> String {
    // A fixed byte salt plus the tty path and euid (design §4.3 step 3,
    // §3 "Remote message" uses the same derive-from-euid idea for its
    // channel identity).
    let digest = tty_path.to_string_lossy().bytes().fold(2166136261u32, |h, b| {
        (h ^ u32::from(b)).wrapping_mul(16777619)
    });
    format!("/pv-cursor-{:08x}-{}", digest, euid)
}

fn attach_shared(name: &str) -> Result<Shared> {
    let cname = CString::new(name).map_err(|_| Error::Cursor { inner: nix::Error::InvalidPath })?;

    let mut owner = false;
    // NOTE(unsafe): shm_open is a thin syscall wrapper; O_CREAT|O_EXCL
    // tells us whether we're the first attacher so we know who unlinks.
    let mut fd = unsafe { libc::shm_open(cname.as_ptr(), O_RDWR | O_CREAT | O_EXCL, 0o600 as mode_t) };
    if fd >= 0 {
        owner = true;
        if unsafe { libc::ftruncate(fd, SEGMENT_SIZE as off_t) } != 0 {
            unsafe {
                libc::close(fd);
            }
            return Err(Error::Cursor { inner: nix::Error::Sys(Errno::last()) });
        }
    } else {
        fd = unsafe { libc::shm_open(cname.as_ptr(), O_RDWR, 0o600 as mode_t) };
        if fd < 0 {
            return Err(Error::Cursor { inner: nix::Error::Sys(Errno::last()) });
        }
    }

    // NOTE(unsafe): fd is a just-opened (or just-created) shm object sized
    // to exactly SEGMENT_SIZE bytes above.
    let addr = unsafe {
        mmap(
            ptr::null_mut(),
            SEGMENT_SIZE,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(|inner| Error::Cursor { inner })?;

    if owner {
        let record = addr as *mut SharedRecord;
        // NOTE(unsafe): we just created and truncated this segment; no
        // other process can have attached yet because we held O_EXCL.
        unsafe {
            ptr::write(record, SharedRecord { top_y: AtomicI32::new(0), attach_count: AtomicI32::new(0) });
        }
        let _ = ftruncate(fd, SEGMENT_SIZE as off_t);
    }

    Ok(Shared { ptr: addr as *mut SharedRecord, shm_fd: fd, name: name.to_string(), owner })
}

/// Writes the "report cursor position" escape sequence and parses the
/// `ESC [ row ; col R` reply (design §4.3 step 3). The caller's terminal
/// must already be in raw/non-canonical mode for the reply to arrive
/// byte-by-byte without needing Enter.
fn query_cursor_row(tty_fd: RawFd) -> io::Result<u16> {
    let query = b"\x1b[6n";
    let n = unsafe { libc::write(tty_fd, query.as_ptr() as *const c_void, query.len()) };
    if n != query.len() as isize {
        return Err(io::Error::last_os_error());
    }

    let mut reply = Vec::with_capacity(16);
    let mut byte = [0u8; 1];
    loop {
        let n = unsafe { libc::read(tty_fd, byte.as_mut_ptr() as *mut c_void, 1) };
        if n != 1 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no cursor-position reply"));
        }
        reply.push(byte[0]);
        if byte[0] == b'R' || reply.len() > 15 {
            break;
        }
    }

    parse_cursor_reply(&reply).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed cursor reply"))
}

fn parse_cursor_reply(reply: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(reply).ok()?;
    let start = text.find("[")? + 1;
    let end = text.find(';')?;
    text[start..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_cursor_reply() {
        assert_eq!(parse_cursor_reply(b"\x1b[24;1R"), Some(24));
    }

    #[test]
    fn rejects_malformed_cursor_reply() {
        assert_eq!(parse_cursor_reply(b"garbage"), None);
    }

    #[test]
    fn lockfile_path_embeds_basename_and_euid() {
        let path = lockfile_path(Path::new("/dev/pts/4"), 1000);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "pv-4-1000.lock");
    }

    #[test]
    fn shared_memory_name_is_stable_for_same_inputs() {
        let a = shared_memory_name(Path::new("/dev/pts/4"), 1000);
        let b = shared_memory_name(Path::new("/dev/pts/4"), 1000);
        assert_eq!(a, b);
        assert!(a.starts_with("/pv-cursor-"));
    }
}
