//! Display formatter (design §2, component share 25%).
//!
//! Given the live state, the elapsed time, the delta since the last call
//! (negative requests a final "flush" rendering) and the cumulative total,
//! produces a terminal-width-bounded line with no trailing newline (design
//! §4.2's contract). This is also the contract the process-watching
//! collaborator (§6) drives, independent of how its `(elapsed, delta,
//! total)` triple was produced.

pub mod bar;
pub mod format;
pub mod number;

use std::time::Duration;

use config::{Config, DisplayToggles};
use format::{ComponentId, Segment};

/// Time below which a rate measurement is considered too noisy to trust on
/// its own (design §4.2 "Rate smoothing").
const RATE_SMOOTHING_FLOOR: Duration = Duration::from_millis(10);

/// Everything the formatter needs about *this* tick that isn't already
/// tracked as formatter state. Kept as a single argument bundle so the
/// `render` call site (the main loop) doesn't need to know the formatter's
/// internals.
pub struct Tick {
    pub elapsed: Duration,
    /// Bytes (or lines, in line mode) moved since the last tick; negative
    /// signals the final flush rendering (design §4.2).
    pub delta: i64,
    pub total: u64,
    pub buffer_fill_percent: u8,
    pub used_zero_copy: bool,
    pub echo: Option<String>,
}

pub struct Formatter {
    toggles: DisplayToggles,
    format: String,
    numeric: bool,
    name: Option<String>,
    total_size: u64,
    line_mode: bool,
    terminal_width: usize,
    initial_offset: u64,

    pending_delta: f64,
    previous_rate: f64,
    previous_elapsed: f64,
    previous_length: usize,
    previous_width: usize,
    bounce: u16,
}

impl Formatter {
    pub fn new(config: &Config, terminal_width: usize, initial_offset: u64) -> Self {
        let format = config
            .presentation
            .format
            .clone()
            .unwrap_or_else(|| format::default_format(&config.display));

        Formatter {
            toggles: config.display.clone(),
            format,
            numeric: config.presentation.numeric,
            name: config.presentation.name.clone(),
            total_size: config.transfer.size,
            line_mode: config.transfer.line_mode,
            terminal_width: if terminal_width == 0 { 80 } else { terminal_width },
            initial_offset,
            pending_delta: 0.0,
            previous_rate: 0.0,
            previous_elapsed: 0.0,
            previous_length: 0,
            previous_width: if terminal_width == 0 { 80 } else { terminal_width },
            bounce: 0,
        }
    }

    /// Adopts a new format/name/size set pushed in by the remote-control
    /// channel (design §4.4: "rebuild the default format string ... set
    /// the reparse-format flag"). Since segments are recomputed fresh on
    /// every `render` call (see module docs), "reparse" here just means
    /// "store the new format"; there is no separate cached segment list to
    /// invalidate.
    pub fn apply_remote(&mut self, toggles: DisplayToggles, format: Option<String>, name: Option<String>) {
        self.toggles = toggles;
        if let Some(format) = format {
            self.format = format;
        } else {
            self.format = format::default_format(&self.toggles);
        }
        if let Some(name) = name {
            self.name = Some(name);
        }
    }

    pub fn set_terminal_width(&mut self, width: usize) {
        self.terminal_width = if width == 0 { 80 } else { width };
    }

    /// The non-numeric rendering path (design §4.2's main contract).
    pub fn render(&mut self, tick: &Tick) -> Option<String> {
        if self.numeric {
            return None;
        }

        let final_flush = tick.delta < 0;
        let elapsed_secs = tick.elapsed.as_secs() as f64 + f64::from(tick.elapsed.subsec_millis()) / 1000.0;

        let average_rate = self.average_rate(elapsed_secs, tick.total);
        let (mut instantaneous_rate, eta_blanked) = self.compute_rate(elapsed_secs, tick.delta, final_flush);
        if final_flush {
            // Design §4.2: "on the final call, the instantaneous rate
            // component is replaced by the average rate and the ETA is
            // blanked" — there's nothing instantaneous left to measure.
            instantaneous_rate = average_rate;
        }

        let components = self.render_components(
            elapsed_secs,
            instantaneous_rate,
            average_rate,
            tick.total,
            tick.buffer_fill_percent,
            tick.used_zero_copy,
            &tick.echo,
            eta_blanked,
        );

        let progress = if self.total_size > 0 {
            let percent = ((tick.total.min(self.total_size) * 100) / self.total_size) as u8;
            Progress::Known(percent)
        } else {
            self.bounce = bar::advance(self.bounce);
            Progress::Unknown(self.bounce)
        };

        let segments = format::parse(&self.format);
        let rendered = assemble(&segments, &components, progress, self.terminal_width);

        let padded = self.pad_to_previous_length(rendered);
        self.previous_width = self.terminal_width;
        Some(padded)
    }

    /// The numeric-mode rendering path (design §4.2 "Numeric mode output").
    pub fn render_numeric(&mut self, tick: &Tick) -> Option<String> {
        if !self.numeric {
            return None;
        }
        let mut line = String::new();
        if self.toggles.timer {
            line.push_str(&format!("{} ", tick.elapsed.as_secs()));
        }
        if self.toggles.bytes {
            line.push_str(&tick.total.to_string());
        } else if self.total_size > 0 {
            let pct = ((tick.total * 100) / self.total_size).min(100);
            line.push_str(&pct.to_string());
        } else {
            self.bounce = bar::advance(self.bounce);
            line.push_str(&bar::fold(self.bounce).to_string());
        }
        line.push('\n');
        Some(line)
    }

    fn compute_rate(&mut self, elapsed_secs: f64, delta: i64, final_flush: bool) -> (f64, bool) {
        if final_flush {
            return (self.previous_rate, true);
        }

        let dt = elapsed_secs - self.previous_elapsed;
        let rate = if Duration::from_secs_f64(dt.max(0.0)) <= RATE_SMOOTHING_FLOOR {
            self.pending_delta += delta.max(0) as f64;
            self.previous_rate
        } else {
            let moved = delta.max(0) as f64 + self.pending_delta;
            self.pending_delta = 0.0;
            if dt > 0.0 {
                moved / dt
            } else {
                self.previous_rate
            }
        };

        self.previous_rate = rate;
        self.previous_elapsed = elapsed_secs;
        (rate, false)
    }

    fn average_rate(&self, elapsed_secs: f64, total: u64) -> f64 {
        if elapsed_secs <= 0.0 {
            return 0.0;
        }
        (total.saturating_sub(self.initial_offset)) as f64 / elapsed_secs
    }

    #[allow(clippy::too_many_arguments)]
    fn render_components(
        &mut self,
        elapsed_secs: f64,
        instantaneous_rate: f64,
        average_rate: f64,
        total: u64,
        buffer_fill_percent: u8,
        used_zero_copy: bool,
        echo: &Option<String>,
        eta_blanked: bool,
    ) -> Components {
        let rate_unit = if self.line_mode { "l/s" } else { "B/s" };
        let render_rate = |v: f64| -> String {
            if self.line_mode {
                format!("[{}{}]", number::format_decimal(v, ""), rate_unit)
            } else {
                format!("[{}]", number::format_bytes(v, rate_unit))
            }
        };

        let eta = if eta_blanked {
            let blank_len = "ETA 0:00:00".len();
            " ".repeat(blank_len)
        } else if self.total_size > 0 && instantaneous_rate > 0.0 {
            let remaining = self.total_size.saturating_sub(total);
            let secs = (remaining as f64 / instantaneous_rate).round() as u64;
            format!("ETA {}", number::format_hms(secs))
        } else {
            String::new()
        };

        let wall_clock_eta = if eta_blanked {
            String::new()
        } else if self.total_size > 0 && instantaneous_rate > 0.0 {
            let remaining = self.total_size.saturating_sub(total);
            let secs = (remaining as f64 / instantaneous_rate).round() as u64;
            number::wall_clock_time(secs, secs > 6 * 3600)
        } else {
            String::new()
        };

        let bytes_component = if self.line_mode {
            total.to_string()
        } else {
            number::format_bytes(total as f64, "B")
        };

        let buffer_fill = if used_zero_copy {
            "{----}".to_string()
        } else {
            format!("{{{:>3}%}}", buffer_fill_percent.min(100))
        };

        Components {
            name: self.name.clone().map(|n| format!("{:>9}:", n)).unwrap_or_default(),
            bytes: bytes_component,
            buffer_fill,
            timer: number::format_hms(elapsed_secs as u64),
            rate: render_rate(instantaneous_rate),
            average_rate: render_rate(average_rate),
            eta,
            wall_clock_eta,
            echo: echo.clone().unwrap_or_else(|| "-".repeat(4)),
        }
    }

    /// Width management (design §4.2): pad with spaces up to the previous
    /// tick's length (capped at +15) when this tick's render is shorter and
    /// the terminal hasn't narrowed, so stale characters get overwritten.
    fn pad_to_previous_length(&mut self, rendered: String) -> String {
        let len = rendered.chars().count();
        let result = if len < self.previous_length && self.terminal_width >= self.previous_width {
            let target = len.max(self.previous_length.min(len + 15));
            let mut padded = rendered;
            while padded.chars().count() < target {
                padded.push(' ');
            }
            padded
        } else {
            rendered
        };
        self.previous_length = result.chars().count();
        result
    }
}

/// The set of per-tick rendered component strings (design §3 "per-component
/// rendered strings"). Plain `String`s rather than the fixed-size buffers
/// the design allows for, since Rust's `String` already bounds growth
/// through ordinary ownership — ungrounded fixed-capacity buffers would
/// just reintroduce a length check this type already gives us for free.
struct Components {
    name: String,
    bytes: String,
    buffer_fill: String,
    timer: String,
    rate: String,
    average_rate: String,
    eta: String,
    wall_clock_eta: String,
    echo: String,
}

impl Components {
    fn get(&self, id: ComponentId) -> &str {
        match id {
            ComponentId::Name => &self.name,
            ComponentId::Bytes => &self.bytes,
            ComponentId::BufferFill => &self.buffer_fill,
            ComponentId::Timer => &self.timer,
            ComponentId::Rate => &self.rate,
            ComponentId::AverageRate => &self.average_rate,
            ComponentId::Eta => &self.eta,
            ComponentId::WallClockEta => &self.wall_clock_eta,
            ComponentId::Echo => &self.echo,
        }
    }
}

/// Whether the transfer's total size is known, carried through to the
/// elastic segment so it can pick `bar::render_known` vs `render_unknown`
/// (design §4.2 "Progress bar rendering").
#[derive(Clone, Copy)]
enum Progress {
    Known(u8),
    Unknown(u16),
}

/// Lays out fixed segments verbatim and gives the single elastic segment
/// whatever width remains (design §4.2 "Segment model").
fn assemble(segments: &[Segment], components: &Components, progress: Progress, terminal_width: usize) -> String {
    let mut fixed_width = 0usize;
    let mut has_elastic = false;
    for seg in segments {
        match seg {
            Segment::Literal(s) => fixed_width += s.chars().count(),
            Segment::Fixed(id) => fixed_width += components.get(*id).chars().count(),
            Segment::Elastic => has_elastic = true,
        }
    }

    let elastic_width = if has_elastic {
        terminal_width.saturating_sub(fixed_width)
    } else {
        0
    };

    let mut out = String::new();
    for seg in segments {
        match seg {
            Segment::Literal(s) => out.push_str(s),
            Segment::Fixed(id) => out.push_str(components.get(*id)),
            Segment::Elastic => {
                let rendered = match progress {
                    Progress::Known(percent) => bar::render_known(elastic_width, percent),
                    Progress::Unknown(counter) => bar::render_unknown(elastic_width, counter),
                };
                if let Some(rendered) = rendered {
                    out.push_str(&rendered);
                }
            }
        }
    }

    if out.chars().count() > terminal_width {
        out.chars().take(terminal_width).collect()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::Config;

    fn tick(elapsed_ms: u64, delta: i64, total: u64) -> Tick {
        Tick {
            elapsed: Duration::from_millis(elapsed_ms),
            delta,
            total,
            buffer_fill_percent: 0,
            used_zero_copy: false,
            echo: None,
        }
    }

    #[test]
    fn name_only_format_is_right_justified_to_nine() {
        let mut cfg = Config::default();
        cfg.display.progress = false;
        cfg.display.timer = false;
        cfg.display.eta = false;
        cfg.display.rate = false;
        cfg.display.bytes = false;
        cfg.display.name = true;
        cfg.presentation.name = Some("N".to_string());
        cfg.presentation.format = Some("%N".to_string());

        let mut formatter = Formatter::new(&cfg, 80, 0);
        let line = formatter.render(&tick(0, 0, 0)).unwrap();
        assert_eq!(line, "        N:");
        assert_eq!(line.len(), 10);
    }

    #[test]
    fn rendered_line_never_exceeds_terminal_width() {
        let mut cfg = Config::default();
        cfg.presentation.format = Some("%N %b %T %t %r %a %p %e %I".to_string());
        cfg.presentation.name = Some("abc".to_string());
        cfg.transfer.size = 10_000;

        let mut formatter = Formatter::new(&cfg, 40, 0);
        let line = formatter.render(&tick(500, 100, 5_000)).unwrap();
        assert!(line.chars().count() <= 40);
    }

    #[test]
    fn numeric_mode_suppresses_normal_render() {
        let mut cfg = Config::default();
        cfg.presentation.numeric = true;
        let mut formatter = Formatter::new(&cfg, 80, 0);
        assert!(formatter.render(&tick(0, 0, 0)).is_none());
        assert!(formatter.render_numeric(&tick(0, 0, 0)).is_some());
    }

    #[test]
    fn numeric_mode_reports_total_bytes() {
        let mut cfg = Config::default();
        cfg.presentation.numeric = true;
        cfg.display.timer = false;
        let mut formatter = Formatter::new(&cfg, 80, 0);
        let line = formatter.render_numeric(&tick(0, 0, 1234)).unwrap();
        assert_eq!(line, "1234\n");
    }
}
