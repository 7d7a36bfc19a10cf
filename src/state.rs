//! Live state (design §3): binds the configuration to everything that
//! changes over the life of a run — the transfer buffer and its companion
//! state machines, the clock, the rate limiter and the formatter — behind
//! one owning struct the main loop drives.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use config::{Config, ExitStatus};
use clock::{Clock, RateLimiter};
use display::Formatter;
use error::Result;
use input::{self, Input};
use transfer::{EchoRing, ErrorSkipState, TransferBuffer, ZeroCopyState};

/// Everything the main loop needs to carry from one iteration to the next.
pub struct LiveState {
    pub config: Config,
    pub inputs: Vec<Input>,
    pub(crate) current: usize,
    pub buffer: TransferBuffer,
    pub zero_copy: ZeroCopyState,
    pub error_skip: ErrorSkipState,
    pub echo: EchoRing,
    pub clock: Clock,
    pub rate_limiter: RateLimiter,
    pub formatter: Formatter,
    pub total_bytes: u64,
    pub total_lines: u64,
    pub exit_status: ExitStatus,
    pub eof_in: bool,
    pub eof_out: bool,
    /// Set after the first successful write to the diagnostic stream
    /// (design §3 "display-visible flag") — the cursor coordinator and the
    /// final-newline behaviour both key off it.
    pub display_visible: bool,
}

impl LiveState {
    pub fn new(config: Config, inputs: Vec<Input>, terminal_width: usize) -> Self {
        let total_size = input::total_size(&inputs);
        let initial_offset = inputs.get(0).map(|i| i.initial_offset).unwrap_or(0);

        let mut config = config;
        config.transfer.size = if config.transfer.size > 0 { config.transfer.size } else { total_size };

        let formatter = Formatter::new(&config, terminal_width, initial_offset);
        let buffer = TransferBuffer::new(config.transfer.buffer_size);
        let rate_limiter = RateLimiter::new(config.transfer.rate_limit);
        let echo = EchoRing::new(config.display.last_written_echo);

        LiveState {
            config,
            inputs,
            current: 0,
            buffer,
            zero_copy: ZeroCopyState::default(),
            error_skip: ErrorSkipState::default(),
            echo,
            clock: Clock::start_now(),
            rate_limiter,
            formatter,
            total_bytes: 0,
            total_lines: 0,
            exit_status: ExitStatus::CLEAN,
            eof_in: false,
            eof_out: false,
            display_visible: false,
        }
    }

    pub fn current_input(&mut self) -> Option<&mut Input> {
        self.inputs.get_mut(self.current)
    }

    /// Moves on to the next input once the current one hits EOF, per
    /// design §3's "Input sequencer" — multiple inputs are concatenated
    /// into a single logical stream. Returns `true` if there was another
    /// input to move to.
    pub fn advance_input(&mut self) -> bool {
        if self.current + 1 < self.inputs.len() {
            self.current += 1;
            self.eof_in = false;
            true
        } else {
            false
        }
    }

    pub fn current_name(&self) -> Option<&str> {
        self.inputs.get(self.current).map(|i| i.name.as_str())
    }

    pub fn record_transfer(&mut self, bytes: u64, lines: u64) {
        self.total_bytes += bytes;
        self.total_lines += lines;
        let moved = if self.config.transfer.line_mode { lines } else { bytes };
        self.rate_limiter.debit(moved);
    }

    pub fn mark_visible(&mut self) {
        self.display_visible = true;
    }

    pub fn mark_exit(&mut self, bit: ExitStatus) {
        self.exit_status |= bit;
    }

    pub fn reached_declared_size(&self) -> bool {
        self.config.transfer.size > 0 && self.total_bytes >= self.config.transfer.size
    }
}

/// Opens every input path in order (design §3 "Input descriptor"),
/// collecting open failures into the exit-status bitmask rather than
/// aborting the whole run (design §7: "Input-open failure ... continue
/// with the rest").
pub fn open_inputs(paths: &[String], status: &mut ExitStatus) -> Result<Vec<Input>> {
    let mut inputs = Vec::with_capacity(paths.len());
    for path in paths {
        match Input::open(path) {
            Ok(input) => inputs.push(input),
            Err(e) => {
                warn!("{}", e);
                *status |= ExitStatus::INPUT_FAILURE;
            }
        }
    }
    Ok(inputs)
}

/// Rejects any input that resolves to the same file as the output,
/// dropping the offending entries and marking the bit rather than
/// aborting (design §3 "Input-is-output collision").
pub fn reject_output_collisions(inputs: Vec<Input>, output_path: Option<&str>, status: &mut ExitStatus) -> Vec<Input> {
    let output_path = match output_path {
        Some(p) => p,
        None => return inputs,
    };

    inputs
        .into_iter()
        .filter(|input| match input::collides_with_output(input, output_path) {
            Ok(true) => {
                warn!("{}: input file is output file", input.name);
                *status |= ExitStatus::INPUT_IS_OUTPUT;
                false
            }
            _ => true,
        })
        .collect()
}

/// The output sink: stdout by default, or a regular file when `-o`-style
/// redirection is requested by the driver. Kept as a thin enum rather than
/// a trait object since the transfer engine only ever needs `Write +
/// AsRawFd`, which both variants already implement.
pub enum Sink {
    Stdout(std::io::Stdout),
    File(File),
}

impl std::io::Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Stdout(s) => s.write(buf),
            Sink::File(f) => f.write(buf),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Stdout(s) => s.flush(),
            Sink::File(f) => f.flush(),
        }
    }
}

impl AsRawFd for Sink {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        match self {
            Sink::Stdout(s) => s.as_raw_fd(),
            Sink::File(f) => f.as_raw_fd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_accumulates_across_marks() {
        let mut status = ExitStatus::CLEAN;
        status |= ExitStatus::INPUT_FAILURE;
        status |= ExitStatus::IO_ERROR;
        assert!(status.contains(ExitStatus::INPUT_FAILURE));
        assert!(status.contains(ExitStatus::IO_ERROR));
    }

    #[test]
    fn reject_output_collisions_passes_through_with_no_output_path() {
        let inputs = Vec::new();
        let mut status = ExitStatus::CLEAN;
        let result = reject_output_collisions(inputs, None, &mut status);
        assert!(result.is_empty());
        assert_eq!(status, ExitStatus::CLEAN);
    }
}
