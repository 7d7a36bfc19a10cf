//! Transfer engine (design §2, component share 25% — the hard core).
//!
//! A single call to [`transfer`] is one main-loop iteration's worth of
//! work: wait briefly for readiness, move as many bytes as the budget and
//! buffer allow, and return. All the buffer-discipline, zero-copy,
//! rate-limit, line-mode and error-skip behaviour described in the design's
//! §4.1 lives here.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::thread::sleep;
use std::time::Duration;

use libc;
use nix::errno::Errno;
use nix::sys::signal::alarm;
use nix::unistd::lseek;
use nix::unistd::Whence;

use error::{Error, Result};
use input::Input;

const READY_WAIT: Duration = Duration::from_millis(90);
const TRANSIENT_NAP: Duration = Duration::from_millis(10);

/// The shared transfer buffer plus its two indices (design §3 "Live
/// state"). `0 <= w <= r <= buf.len()` is the buffer-bounds invariant
/// checked by the tests below and upheld by every mutator in this module.
pub struct TransferBuffer {
    buf: Vec<u8>,
    r: usize,
    w: usize,
    /// A target size requested mid-run; applied only once `r == w == 0`,
    /// per design §9 open question (a).
    pending_resize: Option<usize>,
}

impl TransferBuffer {
    pub fn new(size: usize) -> Self {
        TransferBuffer {
            buf: vec![0u8; size],
            r: 0,
            w: 0,
            pending_resize: None,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn fill_percent(&self) -> u8 {
        if self.buf.is_empty() {
            return 0;
        }
        ((self.r - self.w) * 100 / self.buf.len()) as u8
    }

    /// Requests a new target capacity. Applied immediately if the buffer is
    /// currently empty, otherwise deferred until it next drains.
    pub fn request_resize(&mut self, new_size: usize) {
        if self.r == 0 && self.w == 0 {
            self.buf.resize(new_size, 0);
        } else {
            self.pending_resize = Some(new_size);
        }
    }

    fn maybe_apply_pending_resize(&mut self) {
        if self.r == 0 && self.w == 0 {
            if let Some(size) = self.pending_resize.take() {
                self.buf.resize(size, 0);
            }
        }
    }

    fn check_invariant(&self) {
        debug_assert!(self.w <= self.r);
        debug_assert!(self.r <= self.buf.len());
    }

    /// Buffer-fill maximization (design §4.1): when the sink only partially
    /// drains what's ready, compact the unread tail to the front so the next
    /// read can fill as much of the buffer as possible.
    fn compact(&mut self) {
        if self.w > 0 && self.w < self.r {
            self.buf.copy_within(self.w..self.r, 0);
            self.r -= self.w;
            self.w = 0;
        } else if self.w == self.r {
            self.r = 0;
            self.w = 0;
        }
    }
}

/// Tracks which source fds have refused the zero-copy fast path, per
/// design §9 "Zero-copy fallback": two states per source, probe only if
/// not already rejected.
#[derive(Default)]
pub struct ZeroCopyState {
    rejected: HashSet<RawFd>,
    pub used_this_tick: bool,
}

/// Error-skip state machine (design §4.1 "Error-skip state machine").
pub struct ErrorSkipState {
    last_fd: Option<RawFd>,
    errors_in_a_row: u32,
    warning_shown: bool,
}

impl Default for ErrorSkipState {
    fn default() -> Self {
        ErrorSkipState {
            last_fd: None,
            errors_in_a_row: 0,
            warning_shown: false,
        }
    }
}

impl ErrorSkipState {
    fn reset_if_new_source(&mut self, fd: RawFd) {
        if self.last_fd != Some(fd) {
            self.last_fd = Some(fd);
            self.errors_in_a_row = 0;
            self.warning_shown = false;
        }
    }

    /// The seek step for the `k`-th consecutive error (1-indexed), per
    /// design §4.1: 1 for the first 4, 2 for 5..9, doubling from there
    /// capped at 512.
    fn step_for(&self, k: u32) -> u64 {
        if k <= 4 {
            1
        } else if k <= 9 {
            2
        } else {
            let shift = (k - 9).min(9 + 1);
            (1u64 << shift).min(512)
        }
    }
}

/// A ring of the last `N` bytes written, rendered by the display formatter
/// with non-printables shown as `.` (design §4.1 "Write path").
#[derive(Debug)]
pub struct EchoRing {
    buf: Vec<u8>,
    capacity: usize,
    valid: bool,
}

impl EchoRing {
    pub fn new(capacity: usize) -> Self {
        EchoRing {
            buf: Vec::with_capacity(capacity),
            capacity,
            valid: capacity > 0,
        }
    }

    fn record(&mut self, written: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let take = written.len().min(self.capacity);
        self.buf.clear();
        self.buf
            .extend_from_slice(&written[written.len() - take..]);
        self.valid = true;
    }

    /// Marks the echo as unavailable for this tick — used when the bytes
    /// moved via zero-copy and never passed through our buffer (design §9
    /// "Last-output echo vs. zero-copy").
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Renders the ring as a printable string, `.` standing in for
    /// non-printable bytes, or `None` if nothing has been recorded yet or
    /// the last tick used zero-copy.
    pub fn render(&self) -> Option<String> {
        if !self.valid {
            return None;
        }
        Some(
            self.buf
                .iter()
                .map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect(),
        )
    }
}

/// Outcome of one `transfer` call.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferTick {
    pub bytes_written: u64,
    pub lines_written: u64,
    /// A non-transient read error was seeked past this tick (design §4.1
    /// "Error-skip state machine"); the caller must fold this into the
    /// run's exit status even though the tick itself succeeded.
    pub error_skipped: bool,
}

/// One main-loop iteration's worth of copying, per design §4.1's contract.
///
/// `budget` bounds how many bytes (or lines, in line mode — though the
/// budget itself is always expressed in bytes moved) may move this tick;
/// callers combine the rate limiter's budget with any stop-at-size cap
/// before calling in.
pub fn transfer<W: Write + AsRawFd>(
    buffer: &mut TransferBuffer,
    zero_copy: &mut ZeroCopyState,
    error_skip: &mut ErrorSkipState,
    echo: &mut EchoRing,
    source: &mut Input,
    sink: &mut W,
    line_mode: bool,
    null_terminated: bool,
    forbid_zero_copy: bool,
    skip_errors: bool,
    budget: u64,
    eof_in: &mut bool,
    eof_out: &mut bool,
) -> Result<TransferTick> {
    buffer.check_invariant();
    zero_copy.used_this_tick = false;
    let mut tick = TransferTick::default();

    if budget == 0 {
        return Ok(tick);
    }

    if !forbid_zero_copy && !line_mode {
        if let Some(moved) = try_zero_copy(zero_copy, source, sink, budget)? {
            tick.bytes_written = moved;
            echo.invalidate();
            return Ok(tick);
        }
    }

    // Read phase: refill [r, len) if the source is ready.
    if buffer.r < buffer.buf.len() && source_readable(source)? {
        match source.read(&mut buffer.buf[buffer.r..]) {
            Ok(0) => {
                *eof_in = true;
            }
            Ok(n) => {
                buffer.r += n;
                error_skip.errors_in_a_row = 0;
            }
            Err(e) => {
                if is_transient(&e) {
                    sleep(TRANSIENT_NAP);
                } else if skip_errors {
                    handle_read_error(buffer, error_skip, source, eof_in)?;
                    tick.error_skipped = true;
                } else {
                    // Design §4.1 "Error-skip state machine": skip-errors
                    // disabled means a single non-transient read error ends
                    // the input and propagates, rather than seeking past it.
                    *eof_in = true;
                    return Err(Error::Read { path: source.name.clone(), inner: e });
                }
            }
        }
    }

    // Write phase: drain [w, min(r, w+allowed)) if the sink is ready.
    let write_allowed = (budget as usize).min(buffer.r - buffer.w);
    if buffer.w < buffer.r && write_allowed > 0 && sink_writable(sink)? {
        let mut end = buffer.w + write_allowed;
        if line_mode {
            let terminator = if null_terminated { 0u8 } else { b'\n' };
            match buffer.buf[buffer.w..end].iter().rposition(|&b| b == terminator) {
                Some(rel) => end = buffer.w + rel + 1,
                None => end = buffer.w, // no terminator in window: write nothing this tick
            }
        }

        if end > buffer.w {
            match write_with_alarm(sink, &buffer.buf[buffer.w..end]) {
                Ok(n) => {
                    let written = &buffer.buf[buffer.w..buffer.w + n];
                    if line_mode {
                        let terminator = if null_terminated { 0u8 } else { b'\n' };
                        tick.lines_written = written.iter().filter(|&&b| b == terminator).count() as u64;
                    }
                    tick.bytes_written = n as u64;
                    echo.record(written);
                    buffer.w += n;
                }
                Err(e) => {
                    if is_broken_pipe(&e) {
                        *eof_in = true;
                        *eof_out = true;
                    } else if is_transient(&e) {
                        sleep(TRANSIENT_NAP);
                    } else {
                        return Err(Error::Write { inner: e });
                    }
                }
            }
        }
    }

    buffer.compact();
    buffer.maybe_apply_pending_resize();
    buffer.check_invariant();

    Ok(tick)
}

/// Waits up to `READY_WAIT` for the source to become readable. A pure
/// poll-and-return helper rather than a long block, so the main loop still
/// observes signals promptly (design §5 "Suspension points").
fn source_readable(source: &Input) -> Result<bool> {
    wait_ready(source.as_raw_fd(), false)
}

fn sink_writable<W: AsRawFd>(sink: &W) -> Result<bool> {
    wait_ready(sink.as_raw_fd(), true)
}

/// Waits up to `READY_WAIT` for `fd` to become ready for read or write via
/// `select(2)`. Regular files and block devices — the common case for this
/// tool — aren't pollable under `epoll`, which rejects registering them
/// outright; `select` has no such restriction and reports them ready
/// immediately.
fn wait_ready(fd: RawFd, for_write: bool) -> Result<bool> {
    // NOTE(unsafe): raw `select(2)` FFI; no safe wrapper in this crate's
    // dependency stack covers a single-fd wait with a sub-second timeout.
    unsafe {
        let mut set: libc::fd_set = std::mem::zeroed();
        libc::FD_ZERO(&mut set);
        libc::FD_SET(fd, &mut set);

        let mut timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: READY_WAIT.as_micros() as libc::suseconds_t,
        };

        let (read_set, write_set) = if for_write {
            (std::ptr::null_mut(), &mut set as *mut libc::fd_set)
        } else {
            (&mut set as *mut libc::fd_set, std::ptr::null_mut())
        };

        let ready = libc::select(
            fd + 1,
            read_set,
            write_set,
            std::ptr::null_mut(),
            &mut timeout,
        );

        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err.into());
        }

        Ok(ready > 0 && libc::FD_ISSET(fd, &set))
    }
}

fn is_transient(e: &io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(e.kind(), Interrupted | WouldBlock)
}

fn is_broken_pipe(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::BrokenPipe || e.raw_os_error() == Some(libc::EPIPE)
}

/// Wraps a write in a 1-second alarm (design §4.1 "Write path") so a sink
/// that stops draining cannot wedge the process. A SIGALRM firing mid-write
/// surfaces as `EINTR`, which the caller treats as transient.
fn write_with_alarm<W: Write>(sink: &mut W, data: &[u8]) -> io::Result<usize> {
    alarm::set(1);
    let result = sink.write(data);
    alarm::cancel();
    result
}

/// Handles a non-transient read error when skip-errors is enabled (design
/// §4.1's error-skip state machine): seeks past the bad region and
/// zero-fills it so the downstream sees the gap as zeros. The disabled case
/// is handled by the caller before this is ever reached.
fn handle_read_error(
    buffer: &mut TransferBuffer,
    state: &mut ErrorSkipState,
    source: &mut Input,
    eof_in: &mut bool,
) -> Result<()> {
    let fd = source.as_raw_fd();
    state.reset_if_new_source(fd);

    if !state.warning_shown {
        warn!("warning: read errors detected");
        state.warning_shown = true;
    }

    state.errors_in_a_row += 1;
    if state.errors_in_a_row > 19 {
        *eof_in = true;
        return Ok(());
    }

    let step = state.step_for(state.errors_in_a_row);
    let current = lseek(fd, 0, Whence::SeekCur).unwrap_or(0) as u64;
    let target = (current + step) / step * step;
    let delta = target.saturating_sub(current);

    match lseek(fd, delta as i64, Whence::SeekCur) {
        Ok(new_pos) => {
            let skip_len = step as usize;
            let start = buffer.r;
            let end = (start + skip_len).min(buffer.buf.len());
            for byte in &mut buffer.buf[start..end] {
                *byte = 0;
            }
            buffer.r = end;
            info!(
                "skipped past read error at offset {}, skipped {} bytes (now at {})",
                current, skip_len, new_pos
            );
        }
        Err(nix::Error::Sys(Errno::EINVAL)) => {
            *eof_in = true;
        }
        Err(_) => {
            *eof_in = true;
        }
    }

    Ok(())
}

/// Attempts the kernel-assisted zero-copy fast path via `splice(2)`. Returns
/// `Ok(Some(n))` on success (`n` may be 0 on a transient would-block),
/// `Ok(None)` if zero-copy isn't applicable this tick and the caller should
/// fall through to the buffered path.
fn try_zero_copy<W: Write + AsRawFd>(
    state: &mut ZeroCopyState,
    source: &Input,
    sink: &W,
    budget: u64,
) -> Result<Option<u64>> {
    let fd_in = source.as_raw_fd();
    if state.rejected.contains(&fd_in) {
        return Ok(None);
    }

    let fd_out = sink.as_raw_fd();
    let len = budget.min(i32::max_value() as u64) as usize;

    // NOTE(unsafe): splice(2) with null offsets operates on each fd's
    // current file position, same as a normal read/write pair would.
    let moved = unsafe {
        libc::splice(
            fd_in,
            std::ptr::null_mut(),
            fd_out,
            std::ptr::null_mut(),
            len,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    };

    if moved >= 0 {
        state.used_this_tick = true;
        Ok(Some(moved as u64))
    } else {
        let errno = Errno::last();
        match errno {
            Errno::EINVAL => {
                state.rejected.insert(fd_in);
                Ok(None)
            }
            Errno::EAGAIN => Ok(Some(0)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_invariant_holds_after_compact() {
        let mut buf = TransferBuffer::new(16);
        buf.r = 10;
        buf.w = 4;
        buf.compact();
        assert_eq!(buf.w, 0);
        assert_eq!(buf.r, 6);
        buf.check_invariant();
    }

    #[test]
    fn buffer_resets_to_zero_when_fully_drained() {
        let mut buf = TransferBuffer::new(16);
        buf.r = 8;
        buf.w = 8;
        buf.compact();
        assert_eq!(buf.r, 0);
        assert_eq!(buf.w, 0);
    }

    #[test]
    fn resize_deferred_until_drained() {
        let mut buf = TransferBuffer::new(16);
        buf.r = 4;
        buf.w = 2;
        buf.request_resize(32);
        assert_eq!(buf.len(), 16, "resize must not apply while buffer is non-empty");
        buf.w = 4;
        buf.r = 4;
        buf.maybe_apply_pending_resize();
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn error_skip_step_schedule() {
        let state = ErrorSkipState::default();
        assert_eq!(state.step_for(1), 1);
        assert_eq!(state.step_for(4), 1);
        assert_eq!(state.step_for(5), 2);
        assert_eq!(state.step_for(9), 2);
        assert_eq!(state.step_for(10), 2);
        assert_eq!(state.step_for(11), 4);
    }

    #[test]
    fn error_skip_step_caps_at_512() {
        let state = ErrorSkipState::default();
        assert!(state.step_for(19) <= 512);
        assert_eq!(state.step_for(19), 512);
    }

    #[test]
    fn echo_ring_renders_non_printables_as_dots() {
        let mut ring = EchoRing::new(4);
        ring.record(b"a\nbc");
        assert_eq!(ring.render(), Some("a.bc".to_string()));
    }

    #[test]
    fn echo_ring_invalidated_by_zero_copy() {
        let mut ring = EchoRing::new(4);
        ring.record(b"abcd");
        ring.invalidate();
        assert_eq!(ring.render(), None);
    }

    #[test]
    fn fill_percent_zero_when_empty() {
        let buf = TransferBuffer::new(100);
        assert_eq!(buf.fill_percent(), 0);
    }
}
