//! SI/IEC magnitude formatting (design §4.2 "SI/IEC formatting").
//!
//! Base-1000 for rate-ish units, base-1024 for byte counts. The prefix
//! table is a `strum`-derived closed enum rather than a bare slice of
//! strings, so a bad index is a compile error, not a panic.

use libc;
use strum_macros::Display as StrumDisplay;

/// The canonical SI prefix ladder, yocto (10^-24) through Yotta (10^24).
/// `strum`'s `Display` derive maps each variant to its conventional symbol
/// below; `PREFIXES_ASCENDING` walks the ladder in magnitude order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, StrumDisplay)]
pub enum Prefix {
    #[strum(to_string = "y")]
    Yocto,
    #[strum(to_string = "z")]
    Zepto,
    #[strum(to_string = "a")]
    Atto,
    #[strum(to_string = "f")]
    Femto,
    #[strum(to_string = "p")]
    Pico,
    #[strum(to_string = "n")]
    Nano,
    #[strum(to_string = "u")]
    Micro,
    #[strum(to_string = "m")]
    Milli,
    #[strum(to_string = "")]
    None,
    #[strum(to_string = "K")]
    Kilo,
    #[strum(to_string = "M")]
    Mega,
    #[strum(to_string = "G")]
    Giga,
    #[strum(to_string = "T")]
    Tera,
    #[strum(to_string = "P")]
    Peta,
    #[strum(to_string = "E")]
    Exa,
    #[strum(to_string = "Z")]
    Zetta,
    #[strum(to_string = "Y")]
    Yotta,
}

const PREFIXES_ASCENDING: &[Prefix] = &[
    Prefix::Yocto,
    Prefix::Zepto,
    Prefix::Atto,
    Prefix::Femto,
    Prefix::Pico,
    Prefix::Nano,
    Prefix::Micro,
    Prefix::Milli,
    Prefix::None,
    Prefix::Kilo,
    Prefix::Mega,
    Prefix::Giga,
    Prefix::Tera,
    Prefix::Peta,
    Prefix::Exa,
    Prefix::Zetta,
    Prefix::Yotta,
];

const NONE_INDEX: usize = 8;

/// Formats `value` using base-1000 scaling (rates, counters not denominated
/// in bytes). `unit` is appended after the prefix (e.g. `"/s"`).
pub fn format_decimal(value: f64, unit: &str) -> String {
    format_scaled(value, 1000.0, "", unit)
}

/// Formats `value` (a byte count) using base-1024 scaling with the IEC `i`
/// infix (e.g. `12.3MiB/s`). `unit` is appended after the infixed prefix.
pub fn format_bytes(value: f64, unit: &str) -> String {
    format_scaled(value, 1024.0, "i", unit)
}

fn format_scaled(value: f64, ratio: f64, infix: &str, unit: &str) -> String {
    if value == 0.0 {
        return format!("0{}", unit);
    }

    let negative = value < 0.0;
    let mut magnitude = value.abs();
    let mut idx = NONE_INDEX as isize;

    while magnitude >= ratio * 0.97 && idx < (PREFIXES_ASCENDING.len() - 1) as isize {
        magnitude /= ratio;
        idx += 1;
    }
    while magnitude < 1.0 && idx > 0 {
        magnitude *= ratio;
        idx -= 1;
    }

    let prefix = PREFIXES_ASCENDING[idx as usize];
    let sign = if negative { "-" } else { "" };
    let prefix_str = prefix.to_string();
    let infix = if prefix == Prefix::None { "" } else { infix };

    if magnitude >= 99.95 {
        format!("{}{:.0}{}{}{}", sign, magnitude, prefix_str, infix, unit)
    } else if magnitude >= 9.95 {
        format!("{}{:.1}{}{}{}", sign, magnitude, prefix_str, infix, unit)
    } else {
        format!("{}{:.2}{}{}{}", sign, magnitude, prefix_str, infix, unit)
    }
}

/// Renders a `Duration`-like second count as `H:MM:SS`, or `D:HH:MM:SS` once
/// it exceeds a day (design §4.2 "%e" / "%t").
pub fn format_hms(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if days > 0 {
        format!("{}:{:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    }
}

/// Renders the wall-clock time `secs_from_now` seconds from now (design
/// §4.2 "%I"). `include_date` (true once the ETA is more than six hours
/// out) prepends the calendar date; otherwise just the time of day.
pub fn wall_clock_time(secs_from_now: u64, include_date: bool) -> String {
    // NOTE(unsafe): raw `time(3)`/`localtime_r(3)` FFI; no safe wrapper in
    // this crate's dependency stack covers a wall-clock breakdown.
    unsafe {
        let now = libc::time(std::ptr::null_mut());
        let then = now + secs_from_now as libc::time_t;
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&then, &mut tm);

        if include_date {
            format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                tm.tm_year + 1900,
                tm.tm_mon + 1,
                tm.tm_mday,
                tm.tm_hour,
                tm.tm_min,
                tm.tm_sec,
            )
        } else {
            format!("{:02}:{:02}:{:02}", tm.tm_hour, tm.tm_min, tm.tm_sec)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_renders_without_prefix() {
        assert_eq!(format_bytes(0.0, "B"), "0B");
        assert_eq!(format_decimal(0.0, "/s"), "0/s");
    }

    #[test]
    fn small_values_have_no_prefix() {
        assert_eq!(format_bytes(42.0, "B"), "42.0B");
    }

    #[test]
    fn kilo_boundary_scales_up() {
        assert_eq!(format_decimal(1000.0, "/s"), "1.00K/s");
    }

    #[test]
    fn mebibyte_scaling_uses_iec_infix() {
        let rendered = format_bytes(2.0 * 1024.0 * 1024.0, "B");
        assert_eq!(rendered, "2.00MiB");
    }

    #[test]
    fn hms_under_a_day() {
        assert_eq!(format_hms(3661), "1:01:01");
    }

    #[test]
    fn hms_over_a_day_gains_a_field() {
        assert_eq!(format_hms(90_061), "1:01:01:01");
    }

    #[test]
    fn large_magnitude_shows_no_decimals() {
        let rendered = format_decimal(123_456.0, "/s");
        assert!(rendered.starts_with("123"));
    }
}
