//! The thin external driver (design §1/§1A): parses argv with `clap`,
//! validates it, and hands the core a fully populated `Config` plus the
//! input/output paths. Everything here is argv-shaped convenience; the
//! core itself never sees a `clap::ArgMatches`.

use std::fs;
use std::io::Write;
use std::process;
use std::time::Duration;

use clap::{App, Arg};

use pv::config::{Config, DisplayToggles, Presentation, TransferOptions};
use pv::main_loop::RunRequest;

fn main() {
    // Design §1A: the binary is the only place that ever touches a
    // logger. `PV_LOG` takes priority over `RUST_LOG` so a user can opt
    // this one program into tracing without perturbing anything else on
    // their `RUST_LOG`.
    let log_env = env_logger::Env::default().filter_or("PV_LOG", std::env::var("RUST_LOG").unwrap_or_default());
    env_logger::Builder::from_env(log_env).init();

    let matches = build_cli().get_matches();

    if let Some(pid) = matches.value_of("remote-target") {
        match send_remote(pid, &matches) {
            Ok(()) => process::exit(0),
            Err(e) => {
                eprintln!("pv: {}", e);
                process::exit(1);
            }
        }
    }

    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pv: {}", e);
            process::exit(1);
        }
    };

    let inputs: Vec<String> = matches
        .values_of("inputs")
        .map(|v| v.map(str::to_owned).collect())
        .unwrap_or_else(|| vec!["-".to_owned()]);
    let output = matches.value_of("output").map(str::to_owned);

    let watch_pid_fd = matches.value_of("watch-pid-and-fd").and_then(parse_watch_spec);

    if let Some(path) = matches.value_of("pidfile") {
        if write_pidfile(path).is_err() {
            eprintln!("pv: warning: could not write pidfile {}", path);
        }
    }

    let request = RunRequest {
        config,
        inputs,
        output,
        watch_pid_fd,
    };

    let status = pv::run(request);

    if let Some(path) = matches.value_of("pidfile") {
        let _ = fs::remove_file(path);
    }

    process::exit(status.bits() as i32);
}

fn build_cli<'a, 'b>() -> App<'a, 'b> {
    App::new("pv")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Monitor the progress of data through a pipe")
        .arg(Arg::with_name("progress").short("p").long("progress").help("Turn on the progress bar"))
        .arg(Arg::with_name("timer").short("t").long("timer").help("Turn on the elapsed timer"))
        .arg(Arg::with_name("eta").short("e").long("eta").help("Turn on the ETA timer"))
        .arg(Arg::with_name("wall-clock-eta").short("I").long("fineta").help("Show the estimated wall-clock completion time"))
        .arg(Arg::with_name("rate").short("r").long("rate").help("Turn on the instantaneous rate counter"))
        .arg(Arg::with_name("average-rate").short("a").long("average-rate").help("Turn on the average rate counter"))
        .arg(Arg::with_name("bytes").short("b").long("bytes").help("Turn on the byte/line counter"))
        .arg(Arg::with_name("buffer-fill").long("buffer-percent").help("Turn on the transfer buffer percentage"))
        .arg(Arg::with_name("numeric").short("n").long("numeric").help("Output percentages, not visual information"))
        .arg(Arg::with_name("quiet").short("q").long("quiet").help("No output at all"))
        .arg(Arg::with_name("force").short("f").long("force").help("Force output even when the destination is not a terminal"))
        .arg(Arg::with_name("cursor").short("c").long("cursor").help("Use cursor positioning escape sequences"))
        .arg(Arg::with_name("wait-for-first-byte").short("W").long("wait").help("Wait for the first byte before showing progress"))
        .arg(Arg::with_name("line-mode").short("l").long("line-mode").help("Count lines, not bytes"))
        .arg(Arg::with_name("null-delim").short("0").long("null").help("Lines are null-terminated"))
        .arg(Arg::with_name("skip-errors").short("E").long("skip-errors").multiple(true).help("Skip read errors instead of aborting"))
        .arg(Arg::with_name("stop-at-size").short("S").long("stop-at-size").help("Stop after transferring the declared size"))
        .arg(Arg::with_name("no-zero-copy").long("no-splice").help("Never use kernel-assisted zero-copy"))
        .arg(Arg::with_name("size").short("s").long("size").takes_value(true).help("Declared total size (K/M/G/T suffix, base 1024)"))
        .arg(Arg::with_name("buffer-size").short("B").long("buffer-size").takes_value(true).help("Transfer buffer target size"))
        .arg(Arg::with_name("rate-limit").short("L").long("rate-limit").takes_value(true).help("Limit transfer to this many bytes/sec"))
        .arg(Arg::with_name("interval").short("i").long("interval").takes_value(true).help("Update interval in seconds"))
        .arg(Arg::with_name("delay-start").short("D").long("delay-start").takes_value(true).help("Delay the first display update by this many seconds"))
        .arg(Arg::with_name("width").short("w").long("width").takes_value(true).help("Assume this terminal width"))
        .arg(Arg::with_name("height").short("H").long("height").takes_value(true).help("Assume this terminal height"))
        .arg(Arg::with_name("name").short("N").long("name").takes_value(true).help("Prefix the display with this name"))
        .arg(Arg::with_name("format").long("format").takes_value(true).help("Custom format string"))
        .arg(Arg::with_name("pidfile").long("pidfile").takes_value(true).help("Save the process id to this file"))
        .arg(Arg::with_name("remote-target").long("remote").takes_value(true).help("Send display settings to a running instance by pid"))
        .arg(Arg::with_name("last-written-echo").long("last-written").takes_value(true).help("Show this many of the last bytes written"))
        .arg(Arg::with_name("watch-pid-and-fd").long("watchfd").takes_value(true).help("Watch PID:FD instead of copying stdin"))
        .arg(Arg::with_name("output").short("o").long("output").takes_value(true).help("Write to this file instead of stdout"))
        .arg(Arg::with_name("inputs").multiple(true).help("Input files ('-' or omitted for stdin)"))
}

fn build_config(matches: &clap::ArgMatches) -> Result<Config, String> {
    let display = DisplayToggles {
        progress: matches.is_present("progress") || default_display(matches),
        timer: matches.is_present("timer") || default_display(matches),
        eta: matches.is_present("eta") || default_display(matches),
        wall_clock_eta: matches.is_present("wall-clock-eta"),
        rate: matches.is_present("rate") || default_display(matches),
        average_rate: matches.is_present("average-rate"),
        bytes: matches.is_present("bytes") || default_display(matches),
        buffer_fill: matches.is_present("buffer-fill"),
        last_written_echo: matches
            .value_of("last-written-echo")
            .map(|v| v.parse().map_err(|_| "invalid --last-written value".to_owned()))
            .transpose()?
            .unwrap_or(0),
        name: matches.value_of("name").is_some(),
    };

    let transfer = TransferOptions {
        rate_limit: matches
            .value_of("rate-limit")
            .map(parse_size)
            .transpose()?
            .unwrap_or(0),
        buffer_size: matches
            .value_of("buffer-size")
            .map(|v| parse_size(v).map(|n| n as usize))
            .transpose()?
            .unwrap_or(400 * 1024),
        size: matches.value_of("size").map(parse_size).transpose()?.unwrap_or(0),
        stop_at_size: matches.is_present("stop-at-size"),
        skip_errors: matches.is_present("skip-errors"),
        no_zero_copy: matches.is_present("no-zero-copy"),
        line_mode: matches.is_present("line-mode"),
        null_terminated_lines: matches.is_present("null-delim"),
        delay_start: matches
            .value_of("delay-start")
            .map(parse_seconds)
            .transpose()?
            .unwrap_or_else(|| Duration::from_secs(0)),
        interval: matches
            .value_of("interval")
            .map(parse_seconds)
            .transpose()?
            .unwrap_or_else(|| Duration::from_millis(900)),
        wait_for_first_byte: matches.is_present("wait-for-first-byte"),
    };

    let presentation = Presentation {
        force: matches.is_present("force"),
        numeric: matches.is_present("numeric"),
        cursor: matches.is_present("cursor"),
        width: matches.value_of("width").map(|v| v.parse().unwrap_or(0)).unwrap_or(0),
        height: matches.value_of("height").map(|v| v.parse().unwrap_or(0)).unwrap_or(0),
        name: matches.value_of("name").map(str::to_owned),
        format: matches.value_of("format").map(str::to_owned),
    };

    if matches.is_present("quiet") {
        // §7: quiet is the driver's concern — it's not a core toggle, so
        // approximate it by turning every display component off and
        // leaving the core to notice nothing is enabled (main_loop's
        // `any_display_enabled`).
        return Ok(Config {
            display: DisplayToggles {
                progress: false,
                timer: false,
                eta: false,
                wall_clock_eta: false,
                rate: false,
                average_rate: false,
                bytes: false,
                buffer_fill: false,
                last_written_echo: 0,
                name: false,
            },
            transfer,
            presentation,
        });
    }

    Ok(Config { display, transfer, presentation })
}

/// When none of the individual display toggles were given, default to the
/// classic progress/timer/eta/rate/bytes set (matching `DisplayToggles::default`).
fn default_display(matches: &clap::ArgMatches) -> bool {
    !(matches.is_present("progress")
        || matches.is_present("timer")
        || matches.is_present("eta")
        || matches.is_present("rate")
        || matches.is_present("bytes")
        || matches.is_present("average-rate")
        || matches.is_present("buffer-fill")
        || matches.is_present("wall-clock-eta"))
}

/// Parses a byte count with an optional K/M/G/T suffix, base 1024 (design
/// §6 "size (bytes, with optional K/M/G/T suffix, base-1024)").
fn parse_size(text: &str) -> Result<u64, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty size argument".to_owned());
    }
    let (number_part, multiplier) = match text.chars().last().unwrap().to_ascii_uppercase() {
        'K' => (&text[..text.len() - 1], 1024u64),
        'M' => (&text[..text.len() - 1], 1024 * 1024),
        'G' => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        'T' => (&text[..text.len() - 1], 1024 * 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    let base: u64 = number_part.parse().map_err(|_| format!("invalid size: {}", text))?;
    Ok(base.saturating_mul(multiplier))
}

fn parse_seconds(text: &str) -> Result<Duration, String> {
    let secs: f64 = text.parse().map_err(|_| format!("invalid seconds value: {}", text))?;
    if secs < 0.0 {
        return Err(format!("seconds value must not be negative: {}", text));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn parse_watch_spec(text: &str) -> Option<(i32, i32)> {
    let mut parts = text.splitn(2, ':');
    let pid = parts.next()?.parse().ok()?;
    let fd = parts.next()?.parse().ok()?;
    Some((pid, fd))
}

fn write_pidfile(path: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "{}", process::id())
}

/// The one-shot remote-control sender (design §4.4 "Send side"): build a
/// `RemoteMessage` from whatever display/transfer flags were given and
/// push it at the target pid, reporting delivery failure to the caller
/// ("message not received") rather than succeeding silently.
fn send_remote(pid_text: &str, matches: &clap::ArgMatches) -> Result<(), String> {
    let pid: i32 = pid_text.parse().map_err(|_| "invalid --remote pid".to_owned())?;

    let message = pv::remote::RemoteMessage {
        recipient_pid: pid,
        toggles: DisplayToggles {
            progress: matches.is_present("progress"),
            timer: matches.is_present("timer"),
            eta: matches.is_present("eta"),
            wall_clock_eta: matches.is_present("wall-clock-eta"),
            rate: matches.is_present("rate"),
            average_rate: matches.is_present("average-rate"),
            bytes: matches.is_present("bytes"),
            buffer_fill: matches.is_present("buffer-fill"),
            last_written_echo: 0,
            name: matches.value_of("name").is_some(),
        },
        rate_limit: matches.value_of("rate-limit").map(parse_size).transpose()?.unwrap_or(0),
        buffer_size: matches.value_of("buffer-size").map(parse_size).transpose()?.unwrap_or(0),
        size: matches.value_of("size").map(parse_size).transpose()?.unwrap_or(0),
        interval_ms: matches
            .value_of("interval")
            .map(parse_seconds)
            .transpose()?
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        width: matches.value_of("width").and_then(|v| v.parse().ok()).unwrap_or(0),
        height: matches.value_of("height").and_then(|v| v.parse().ok()).unwrap_or(0),
        name: matches.value_of("name").map(str::to_owned),
        format: matches.value_of("format").map(str::to_owned),
    };

    // The running instance we're addressing is, by construction, owned by
    // our own effective user (design §3 "Remote message"): the queue
    // identity is derived from euid, not from an arbitrary target user.
    let euid = nix::unistd::geteuid().as_raw();
    pv::remote::send(euid, &message).map_err(|e| e.to_string())
}
