//! Signal dispatcher (design §2, component share 8%).
//!
//! Captures termination, resize, background/foreground, stop/continue and
//! pipe-closed events and exposes them as flags the main loop polls. Per
//! design §9 "Shared state across handlers": handlers only ever perform an
//! async-signal-safe write to a word-sized flag, never allocate or lock.

use std::fs::OpenOptions;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;

use error::Result;

// Per design §9 "Global process state": the dispatcher is a per-process
// singleton. Only one instance of the core runs per process, so plain
// statics (rather than some injected handle) are an accurate model of the
// runtime, not a shortcut.
static ABORT: AtomicBool = AtomicBool::new(false);
static RESIZE: AtomicBool = AtomicBool::new(false);
static STOPPED: AtomicBool = AtomicBool::new(false);
static BACKGROUNDED: AtomicBool = AtomicBool::new(false);
static PIPE_CLOSED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term(_: libc::c_int) {
    ABORT.store(true, Ordering::SeqCst);
}

extern "C" fn handle_winch(_: libc::c_int) {
    RESIZE.store(true, Ordering::SeqCst);
}

extern "C" fn handle_tstp(_: libc::c_int) {
    STOPPED.store(true, Ordering::SeqCst);
}

/// SIGCONT clears both "stopped" and "backgrounded" — from a user's point of
/// view, continuing a job unconditionally restores both, so the one signal
/// drives both flags rather than needing two competing handlers on it.
extern "C" fn handle_cont(_: libc::c_int) {
    STOPPED.store(false, Ordering::SeqCst);
    BACKGROUNDED.store(false, Ordering::SeqCst);
}

extern "C" fn handle_ttou(_: libc::c_int) {
    BACKGROUNDED.store(true, Ordering::SeqCst);
}

extern "C" fn handle_pipe(_: libc::c_int) {
    PIPE_CLOSED.store(true, Ordering::SeqCst);
}

/// Installs the dispatcher's handlers. Call exactly once from the main
/// loop before starting the transfer; installing it twice would silently
/// replace the first process's handlers, which is a correctness bug we
/// want to catch rather than paper over, so `install` is idempotent
/// per-process only by convention, not enforced here.
pub fn install() {
    unsafe {
        let term_action = SigAction::new(
            SigHandler::Handler(handle_term),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let _ = signal::sigaction(Signal::SIGTERM, &term_action);
        let _ = signal::sigaction(Signal::SIGINT, &term_action);

        let winch_action = SigAction::new(
            SigHandler::Handler(handle_winch),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let _ = signal::sigaction(Signal::SIGWINCH, &winch_action);

        let tstp_action = SigAction::new(
            SigHandler::Handler(handle_tstp),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let _ = signal::sigaction(Signal::SIGTSTP, &tstp_action);
        let _ = signal::sigaction(Signal::SIGSTOP, &tstp_action);

        let cont_action = SigAction::new(
            SigHandler::Handler(handle_cont),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let _ = signal::sigaction(Signal::SIGCONT, &cont_action);

        let ttou_action = SigAction::new(
            SigHandler::Handler(handle_ttou),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let _ = signal::sigaction(Signal::SIGTTOU, &ttou_action);
        let _ = signal::sigaction(Signal::SIGTTIN, &ttou_action);

        // Ignored per design §5: "the pipe-closed signal is ignored;
        // broken-pipe errors on write terminate the loop cleanly". We still
        // record it for diagnostics, but the main loop does not act on it.
        let pipe_action = SigAction::new(
            SigHandler::Handler(handle_pipe),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let _ = signal::sigaction(Signal::SIGPIPE, &pipe_action);
    }
}

/// Snapshot of dispatcher state consumed once per main-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub abort: bool,
    pub resize: bool,
    pub stopped: bool,
    pub backgrounded: bool,
    pub pipe_closed: bool,
}

pub fn poll() -> Flags {
    Flags {
        abort: ABORT.load(Ordering::SeqCst),
        resize: RESIZE.swap(false, Ordering::SeqCst),
        stopped: STOPPED.load(Ordering::SeqCst),
        backgrounded: BACKGROUNDED.load(Ordering::SeqCst),
        pipe_closed: PIPE_CLOSED.load(Ordering::SeqCst),
    }
}

/// Redirects a raw fd to `/dev/null`, used by the main loop when
/// `backgrounded` is observed, so that stop/foreground cycles don't corrupt
/// the terminal by writing to a stream we no longer own (design §5
/// "background-write signal"). Returns a duplicate of the fd's original
/// target, which the caller holds onto so [`restore`] can later put it back
/// — once `fd` itself has been `dup2`'d over, the original target is only
/// reachable through that duplicate.
pub fn redirect_to_null(fd: RawFd) -> Result<RawFd> {
    use std::os::unix::io::AsRawFd;
    let saved = unistd::dup(fd)?;
    let null = OpenOptions::new().write(true).open("/dev/null")?;
    let null_fd = null.as_raw_fd();
    unistd::dup2(null_fd, fd)?;
    std::mem::forget(null);
    Ok(saved)
}

/// Restores `fd` from the duplicate `saved` returned by an earlier
/// [`redirect_to_null`] (design §5: "a heartbeat every second re-attempts
/// to restore the original diagnostic stream once foregrounded"). Closes
/// `saved` on success since its only purpose was this one restoration.
pub fn restore(fd: RawFd, saved: RawFd) -> Result<()> {
    unistd::dup2(saved, fd)?;
    let _ = unistd::close(saved);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_snapshot_reads_resize_once() {
        RESIZE.store(true, Ordering::SeqCst);
        let first = poll();
        assert!(first.resize);
        let second = poll();
        assert!(!second.resize, "resize flag should be consumed on read");
    }
}
