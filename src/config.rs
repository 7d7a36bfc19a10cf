//! The Configuration record (data model §3). Built once by the external
//! driver before the core runs, then only ever mutated by the remote
//! control channel (`remote::apply`).

use std::time::Duration;

bitflags! {
    /// The bitwise-OR'd process exit status (design §7 / §6 "Exit status").
    pub struct ExitStatus: u32 {
        const CLEAN              = 0;
        const INPUT_FAILURE      = 2;
        const INPUT_IS_OUTPUT    = 4;
        const FILE_CLOSE         = 8;
        const IO_ERROR           = 16;
        const ABORTED_BY_SIGNAL  = 32;
        const ALLOCATION_FAILURE = 64;
    }
}

/// Display toggles: which components the formatter is allowed to render.
#[derive(Clone, Debug)]
pub struct DisplayToggles {
    pub progress: bool,
    pub timer: bool,
    pub eta: bool,
    pub wall_clock_eta: bool,
    pub rate: bool,
    pub average_rate: bool,
    pub bytes: bool,
    pub buffer_fill: bool,
    /// Width of the last-output echo ring; `0` means the component is off.
    pub last_written_echo: usize,
    pub name: bool,
}

impl Default for DisplayToggles {
    fn default() -> Self {
        DisplayToggles {
            progress: true,
            timer: true,
            eta: true,
            wall_clock_eta: false,
            rate: true,
            average_rate: false,
            bytes: true,
            buffer_fill: false,
            last_written_echo: 0,
            name: false,
        }
    }
}

/// Transfer options: everything the transfer engine consults per tick.
#[derive(Clone, Debug)]
pub struct TransferOptions {
    /// Bytes/sec, or `0` for unlimited.
    pub rate_limit: u64,
    pub buffer_size: usize,
    /// Declared total size in bytes; `0` means unknown.
    pub size: u64,
    pub stop_at_size: bool,
    pub skip_errors: bool,
    pub no_zero_copy: bool,
    pub line_mode: bool,
    pub null_terminated_lines: bool,
    pub delay_start: Duration,
    pub interval: Duration,
    pub wait_for_first_byte: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            rate_limit: 0,
            buffer_size: 400 * 1024,
            size: 0,
            stop_at_size: false,
            skip_errors: false,
            no_zero_copy: false,
            line_mode: false,
            null_terminated_lines: false,
            delay_start: Duration::from_secs(0),
            interval: Duration::from_millis(900),
            wait_for_first_byte: false,
        }
    }
}

/// Presentation options: everything about *how* the display is shown,
/// independent of which components it contains.
#[derive(Clone, Debug, Default)]
pub struct Presentation {
    pub force: bool,
    pub numeric: bool,
    pub cursor: bool,
    /// Explicit width/height; `0` means "probe the terminal".
    pub width: usize,
    pub height: usize,
    pub name: Option<String>,
    pub format: Option<String>,
}

/// The flat, immutable-for-the-run Configuration record.
#[derive(Clone, Debug)]
pub struct Config {
    pub display: DisplayToggles,
    pub transfer: TransferOptions,
    pub presentation: Presentation,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            display: DisplayToggles::default(),
            transfer: TransferOptions::default(),
            presentation: Presentation::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_bits_compose() {
        let mut status = ExitStatus::CLEAN;
        status |= ExitStatus::INPUT_FAILURE;
        status |= ExitStatus::IO_ERROR;
        assert_eq!(status.bits(), 2 | 16);
        assert!(status.contains(ExitStatus::INPUT_FAILURE));
        assert!(!status.contains(ExitStatus::ABORTED_BY_SIGNAL));
    }

    #[test]
    fn default_config_has_sane_buffer() {
        let cfg = Config::default();
        assert!(cfg.transfer.buffer_size > 0);
        assert_eq!(cfg.transfer.size, 0);
    }
}
