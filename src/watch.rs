//! Process-watching collaborator (design §6): reuses the display engine's
//! `(elapsed, delta, total)` contract unmodified, substituting position
//! polling of another process's file descriptor for actually reading from
//! it. This is the one place in the crate that talks to procfs.

use std::fs;
use std::io;
use std::thread::sleep;
use std::time::Instant;

use config::{Config, ExitStatus};
use display::{Formatter, Tick};

/// How often the watched descriptor's offset is sampled. The real transfer
/// engine waits on readiness; there is no equivalent to wait on here, so a
/// fixed poll cadence stands in for it.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(900);

/// Watches `fd` inside `pid`, rendering the same status line the transfer
/// engine would, until the descriptor disappears (the watched process
/// exited or closed it).
pub fn run(pid: i32, fd: i32, config: Config) -> ExitStatus {
    let total_size = stat_fd_target(pid, fd).unwrap_or(0);
    let mut config = config;
    if config.transfer.size == 0 {
        config.transfer.size = total_size;
    }

    let mut formatter = Formatter::new(&config, config.presentation.width, 0);
    let start = Instant::now();
    let mut last_pos = read_pos(pid, fd).unwrap_or(0);
    let mut status = ExitStatus::CLEAN;

    loop {
        sleep(POLL_INTERVAL);

        let pos = match read_pos(pid, fd) {
            Ok(pos) => pos,
            Err(_) => break,
        };
        let delta = pos.saturating_sub(last_pos) as i64;
        last_pos = pos;

        let tick = Tick {
            elapsed: start.elapsed(),
            delta,
            total: pos,
            buffer_fill_percent: 0,
            used_zero_copy: false,
            echo: None,
        };

        if config.presentation.numeric {
            if let Some(line) = formatter.render_numeric(&tick) {
                eprint!("{}", line);
            }
        } else if let Some(line) = formatter.render(&tick) {
            eprint!("{}\r", line);
        }

        if config.transfer.size > 0 && pos >= config.transfer.size {
            break;
        }
    }

    let final_tick = Tick {
        elapsed: start.elapsed(),
        delta: -1,
        total: last_pos,
        buffer_fill_percent: 0,
        used_zero_copy: false,
        echo: None,
    };
    if !config.presentation.numeric {
        if let Some(line) = formatter.render(&final_tick) {
            eprintln!("{}", line);
        }
    }

    status |= ExitStatus::FILE_CLOSE;
    status
}

/// Reads the `pos:` field out of `/proc/{pid}/fdinfo/{fd}`, the Linux
/// procfs file that exposes a descriptor's current file offset without
/// requiring any privilege beyond the ability to read the directory at all.
fn read_pos(pid: i32, fd: i32) -> io::Result<u64> {
    let path = format!("/proc/{}/fdinfo/{}", pid, fd);
    let contents = fs::read_to_string(path)?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("pos:") {
            return rest
                .trim()
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed pos field"));
        }
    }
    Err(io::Error::new(io::ErrorKind::NotFound, "no pos field in fdinfo"))
}

/// Resolves `/proc/{pid}/fd/{fd}` and stats whatever it points at, so a
/// watched regular file still gets a known total size and therefore a
/// real progress bar rather than the unknown-size bounce.
fn stat_fd_target(pid: i32, fd: i32) -> Option<u64> {
    let link = format!("/proc/{}/fd/{}", pid, fd);
    let target = fs::read_link(link).ok()?;
    let meta = fs::metadata(target).ok()?;
    if meta.is_file() {
        Some(meta.len())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_pos_rejects_missing_process() {
        let result = read_pos(i32::max_value(), 0);
        assert!(result.is_err());
    }

    #[test]
    fn stat_fd_target_returns_none_for_missing_process() {
        assert_eq!(stat_fd_target(i32::max_value(), 0), None);
    }
}
