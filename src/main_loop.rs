//! Main loop (design §2, component share 6%): composes the transfer
//! engine, clock, display formatter, signal dispatcher and remote-control
//! channel into the single cooperative event loop described in design §5.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use nix::sys::signal::{raise, Signal};

use config::{Config, ExitStatus};
use cursor::CursorCoordinator;
use display::Tick;
use error::Error;
use input;
use remote::RemoteChannel;
use signal;
use state::{self, LiveState, Sink};
use transfer;
use {remote, watch};

const REMOTE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const BACKGROUND_RESTORE_INTERVAL: Duration = Duration::from_secs(1);
/// The diagnostic stream's conventional fd (design §1/§6: "conventionally
/// the process's standard error"). Width/height probing and cursor
/// coordination both key off this, never off the payload sink's fd.
const DIAGNOSTIC_FD: std::os::unix::io::RawFd = 2;

fn live_width_override(config: &Config) -> Option<usize> {
    if config.presentation.width > 0 {
        Some(config.presentation.width)
    } else {
        None
    }
}

/// Everything the external driver hands the core to start a run (design
/// §1's "external driver" boundary): the built configuration plus the
/// paths argv named, kept separate from `Config` since the core treats
/// argv itself as none of its concern.
pub struct RunRequest {
    pub config: Config,
    pub inputs: Vec<String>,
    pub output: Option<String>,
    pub watch_pid_fd: Option<(i32, i32)>,
}

/// Runs to completion and returns the accumulated exit-status bitmask
/// (design §6: "Exit status is a bitmask").
pub fn run(request: RunRequest) -> ExitStatus {
    signal::install();

    if let Some((pid, fd)) = request.watch_pid_fd {
        return watch::run(pid, fd, request.config);
    }

    let mut status = ExitStatus::CLEAN;
    let opened = match state::open_inputs(&request.inputs, &mut status) {
        Ok(v) => v,
        Err(_) => Vec::new(),
    };
    let opened = state::reject_output_collisions(opened, request.output.as_deref(), &mut status);

    if opened.is_empty() {
        status |= ExitStatus::INPUT_FAILURE;
        return status;
    }

    let mut sink = match open_sink(request.output.as_deref()) {
        Ok(sink) => sink,
        Err(e) => {
            status |= ExitStatus::from_bits_truncate(e.exit_bit());
            return status;
        }
    };

    // Design §4.1/§5: the engine is non-blocking end to end. A fd left in
    // blocking mode would undo the whole readiness-wait discipline the first
    // time its peer raced us between the poll and the read/write.
    for input in &opened {
        let _ = input::set_nonblocking_fd(input.as_raw_fd(), true);
    }
    let _ = input::set_nonblocking_fd(sink.as_raw_fd(), true);

    // Design §3 "Presentation options": an explicit width/height always wins
    // over probing; probing itself reads the *diagnostic* stream's terminal
    // (conventionally stderr), not the payload sink — they are frequently
    // different files entirely (e.g. `pv in > out`).
    let explicit_width = live_width_override(&request.config);
    let terminal_width = explicit_width.or_else(|| probe_width(DIAGNOSTIC_FD)).unwrap_or(80);
    let mut live = LiveState::new(request.config, opened, terminal_width);
    live.exit_status = status;

    let mut remote_channel = RemoteChannel::open().ok();
    let is_tty = unsafe { libc::isatty(DIAGNOSTIC_FD) } != 0;
    let force = live.config.presentation.force;
    let quiet = !live.config.presentation.numeric
        && (!any_display_enabled(&live.config) || (!is_tty && !force));

    // Design §4.3: cursor coordination is only set up when requested, and
    // only degrades silently (never aborts the run) on failure.
    let mut cursor = if live.config.presentation.cursor && !quiet {
        let explicit_height = if live.config.presentation.height > 0 {
            Some(live.config.presentation.height as u16)
        } else {
            None
        };
        let height = explicit_height.or_else(|| probe_height(DIAGNOSTIC_FD)).unwrap_or(24);
        CursorCoordinator::new(DIAGNOSTIC_FD, height)
    } else {
        None
    };

    let started_at = Instant::now();
    let display_not_ready_before = started_at + live.config.transfer.delay_start;
    let wait_for_first_byte = live.config.transfer.wait_for_first_byte;

    let mut next_remote_poll = Instant::now();
    let mut next_display = Instant::now() + live.config.transfer.interval;
    let mut next_background_check = Instant::now();
    let mut saved_diagnostic_fd: Option<std::os::unix::io::RawFd> = None;

    loop {
        let flags = signal::poll();
        if flags.abort {
            live.mark_exit(ExitStatus::ABORTED_BY_SIGNAL);
            break;
        }

        if flags.stopped {
            live.clock.suspend();
            let _ = raise(Signal::SIGSTOP);
            live.clock.resume();
        }

        if flags.resize && explicit_width.is_none() {
            if let Some(width) = probe_width(DIAGNOSTIC_FD) {
                live.formatter.set_terminal_width(width);
            }
        }

        let now = Instant::now();
        if flags.backgrounded && saved_diagnostic_fd.is_none() {
            if let Ok(saved) = signal::redirect_to_null(DIAGNOSTIC_FD) {
                saved_diagnostic_fd = Some(saved);
            }
        } else if !flags.backgrounded && saved_diagnostic_fd.is_some() && now >= next_background_check {
            // Design §5: retried once a second rather than on every tick, in
            // case a racing re-backgrounding makes the first attempt moot.
            if let Some(saved) = saved_diagnostic_fd {
                if signal::restore(DIAGNOSTIC_FD, saved).is_ok() {
                    saved_diagnostic_fd = None;
                }
            }
            next_background_check = now + BACKGROUND_RESTORE_INTERVAL;
        }

        if now >= next_remote_poll {
            if let Some(channel) = remote_channel.as_mut() {
                if let Some(message) = channel.poll() {
                    remote::apply(&mut live.config, &message);
                    live.formatter.apply_remote(
                        live.config.display.clone(),
                        live.config.presentation.format.clone(),
                        live.config.presentation.name.clone(),
                    );
                }
            }
            next_remote_poll = now + REMOTE_POLL_INTERVAL;
        }

        if !run_one_tick(&mut live, &mut sink) {
            break;
        }

        if live.reached_declared_size() {
            live.eof_in = true;
            live.eof_out = true;
        }

        if live.eof_out {
            break;
        }

        let ready_to_show = Instant::now() >= display_not_ready_before
            && (!wait_for_first_byte || live.total_bytes > 0 || live.total_lines > 0);

        if !quiet && ready_to_show && Instant::now() >= next_display {
            render_and_write(&mut live, &mut sink, 0, cursor.as_mut());
            next_display = Instant::now() + live.config.transfer.interval;
        }
    }

    if !quiet {
        render_and_write(&mut live, &mut sink, -1, cursor.as_mut());
        if let Some(mut coordinator) = cursor.take() {
            coordinator.teardown(&mut std::io::stderr());
        } else if !live.config.presentation.numeric {
            let _ = writeln!(std::io::stderr());
        }
    }

    live.exit_status
}

/// One transfer call plus the bookkeeping the main loop owns around it:
/// input rotation on EOF, counters, and the error-skip/zero-copy state
/// that belongs to the engine rather than to `LiveState` itself. Returns
/// `false` when there is nothing left to read.
fn run_one_tick(live: &mut LiveState, sink: &mut Sink) -> bool {
    let budget = effective_budget(live);

    let line_mode = live.config.transfer.line_mode;
    let null_terminated = live.config.transfer.null_terminated_lines;
    let forbid_zero_copy = live.config.transfer.no_zero_copy;
    let skip_errors = live.config.transfer.skip_errors;

    let LiveState {
        ref mut inputs,
        current,
        ref mut buffer,
        ref mut zero_copy,
        ref mut error_skip,
        ref mut echo,
        ref mut eof_in,
        ref mut eof_out,
        ..
    } = *live;

    let input = match inputs.get_mut(current) {
        Some(input) => input,
        None => return false,
    };

    let result = transfer::transfer(
        buffer,
        zero_copy,
        error_skip,
        echo,
        input,
        sink,
        line_mode,
        null_terminated,
        forbid_zero_copy,
        skip_errors,
        budget,
        eof_in,
        eof_out,
    );

    match result {
        Ok(tick) => {
            live.record_transfer(tick.bytes_written, tick.lines_written);
            live.mark_visible();
            if tick.error_skipped {
                live.mark_exit(ExitStatus::IO_ERROR);
            }
        }
        Err(Error::Write { .. }) => {
            live.mark_exit(ExitStatus::IO_ERROR);
            live.eof_out = true;
        }
        Err(_) => {
            live.mark_exit(ExitStatus::IO_ERROR);
        }
    }

    if live.eof_in {
        if !live.advance_input() {
            live.eof_out = true;
        }
    }

    true
}

fn effective_budget(live: &mut LiveState) -> u64 {
    let mut budget = live.rate_limiter.budget();
    if live.config.transfer.stop_at_size && live.config.transfer.size > 0 {
        let remaining = live.config.transfer.size.saturating_sub(live.total_bytes);
        budget = budget.min(remaining);
    }
    budget
}

fn render_and_write(live: &mut LiveState, sink: &mut Sink, delta_override: i64, cursor: Option<&mut CursorCoordinator>) {
    let delta = if delta_override < 0 { -1 } else { 0 };
    let tick = Tick {
        elapsed: live.clock.elapsed(),
        delta,
        total: if live.config.transfer.line_mode { live.total_lines } else { live.total_bytes },
        buffer_fill_percent: live.buffer.fill_percent(),
        used_zero_copy: live.zero_copy.used_this_tick,
        echo: live.echo.render(),
    };

    if live.config.presentation.numeric {
        if let Some(line) = live.formatter.render_numeric(&tick) {
            let _ = write!(std::io::stderr(), "{}", line);
        }
        return;
    }

    if let Some(line) = live.formatter.render(&tick) {
        // Design §6 "Diagnostic-stream output": cursor-positioning mode
        // hands placement to the coordinator instead of the trailing `\r`
        // overwrite every other run uses.
        match cursor {
            Some(coordinator) => {
                let _ = coordinator.update(&mut std::io::stderr(), &line);
            }
            None => {
                let _ = write!(std::io::stderr(), "{}\r", line);
                let _ = std::io::stderr().flush();
            }
        }
    }
    let _ = sink;
}

fn open_sink(output: Option<&str>) -> Result<Sink, Error> {
    match output {
        None | Some("-") => Ok(Sink::Stdout(std::io::stdout())),
        Some(path) => std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map(Sink::File)
            .map_err(|inner| Error::InputOpen { path: path.to_owned(), inner }),
    }
}

fn any_display_enabled(config: &Config) -> bool {
    let t = &config.display;
    t.progress || t.timer || t.eta || t.wall_clock_eta || t.rate || t.average_rate || t.bytes || t.buffer_fill
}

fn probe_width(fd: std::os::unix::io::RawFd) -> Option<usize> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    // NOTE(unsafe): TIOCGWINSZ writes into `ws` only on success; a non-tty
    // fd returns -1 and leaves it untouched, which is fine since we never
    // read it in that branch.
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws as *mut libc::winsize) };
    if rc == 0 && ws.ws_col > 0 {
        Some(ws.ws_col as usize)
    } else {
        None
    }
}

fn probe_height(fd: std::os::unix::io::RawFd) -> Option<u16> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws as *mut libc::winsize) };
    if rc == 0 && ws.ws_row > 0 {
        Some(ws.ws_row)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_display_enabled_reflects_toggles() {
        let mut config = Config::default();
        assert!(any_display_enabled(&config));
        config.display.progress = false;
        config.display.timer = false;
        config.display.eta = false;
        config.display.rate = false;
        config.display.bytes = false;
        assert!(!any_display_enabled(&config));
    }
}
