//! Remote-control channel (design §4.4): a typed message queue that lets a
//! sibling process push live configuration changes into a running
//! instance.
//!
//! POSIX message queues have no safe wrapper in this crate's dependency
//! set, so this follows `cursor.rs`'s lead: raw `libc` FFI with
//! `NOTE(unsafe)` comments documenting the invariant behind each call.

use std::convert::TryInto;
use std::ffi::CString;
use std::mem;
use std::time::{Duration, Instant};

use libc::{c_long, mode_t, mq_attr, mqd_t, O_CREAT, O_NONBLOCK, O_RDWR, O_WRONLY};
use nix::errno::Errno;

use config::{Config, DisplayToggles};
use display::format;
use error::{Error, Result};

const SALT: u32 = 0x5056_5243; // "PVRC" — a fixed seed, not a secret.
const MAX_MESSAGES: c_long = 8;
// pid(4) + toggles(1) + 4 u64 fields(32) + 2 u32 fields(8) + name + format,
// rounded up with headroom for both variable-length fields below.
const MESSAGE_SIZE: usize = 320;
const NAME_FIELD_LEN: usize = 32;
const FORMAT_FIELD_LEN: usize = 192;

/// The fixed-shape record carried over the queue (design §3 "Remote
/// message"). A zero-valued numeric field or empty string field means "do
/// not change" — the sender only needs to set what it wants to override.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    pub recipient_pid: i32,
    pub toggles: DisplayToggles,
    pub rate_limit: u64,
    pub buffer_size: u64,
    pub size: u64,
    pub interval_ms: u64,
    pub width: u32,
    pub height: u32,
    pub name: Option<String>,
    pub format: Option<String>,
}

impl RemoteMessage {
    fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        let mut i = 0;

        buf[i..i + 4].copy_from_slice(&self.recipient_pid.to_le_bytes());
        i += 4;

        buf[i] = encode_toggles(&self.toggles);
        i += 1;

        for value in &[self.rate_limit, self.buffer_size, self.size, self.interval_ms] {
            buf[i..i + 8].copy_from_slice(&value.to_le_bytes());
            i += 8;
        }
        for value in &[self.width, self.height] {
            buf[i..i + 4].copy_from_slice(&value.to_le_bytes());
            i += 4;
        }

        i = write_field(&mut buf, i, self.name.as_deref(), NAME_FIELD_LEN);
        write_field(&mut buf, i, self.format.as_deref(), FORMAT_FIELD_LEN);

        buf
    }

    fn decode(buf: &[u8]) -> Option<RemoteMessage> {
        if buf.len() < MESSAGE_SIZE {
            return None;
        }
        let mut i = 0;
        let recipient_pid = i32::from_le_bytes(buf[i..i + 4].try_into().ok()?);
        i += 4;
        let toggles = decode_toggles(buf[i]);
        i += 1;

        let mut values = [0u64; 4];
        for value in values.iter_mut() {
            *value = u64::from_le_bytes(buf[i..i + 8].try_into().ok()?);
            i += 8;
        }
        let [rate_limit, buffer_size, size, interval_ms] = values;

        let mut dims = [0u32; 2];
        for dim in dims.iter_mut() {
            *dim = u32::from_le_bytes(buf[i..i + 4].try_into().ok()?);
            i += 4;
        }
        let [width, height] = dims;

        let (name, next) = read_field(buf, i, NAME_FIELD_LEN)?;
        i = next;
        let (format, _) = read_field(buf, i, FORMAT_FIELD_LEN)?;

        Some(RemoteMessage {
            recipient_pid,
            toggles,
            rate_limit,
            buffer_size,
            size,
            interval_ms,
            width,
            height,
            name,
            format,
        })
    }
}

fn write_field(buf: &mut [u8], offset: usize, value: Option<&str>, max_len: usize) -> usize {
    let bytes = value.unwrap_or("").as_bytes();
    let len = bytes.len().min(max_len - 1);
    buf[offset] = len as u8;
    buf[offset + 1..offset + 1 + len].copy_from_slice(&bytes[..len]);
    offset + max_len
}

fn read_field(buf: &[u8], offset: usize, max_len: usize) -> Option<(Option<String>, usize)> {
    let len = buf[offset] as usize;
    if len > max_len - 1 || offset + 1 + len > buf.len() {
        return None;
    }
    let text = String::from_utf8_lossy(&buf[offset + 1..offset + 1 + len]).into_owned();
    let value = if text.is_empty() { None } else { Some(text) };
    Some((value, offset + max_len))
}

fn encode_toggles(toggles: &DisplayToggles) -> u8 {
    let mut bits = 0u8;
    if toggles.progress {
        bits |= 1 << 0;
    }
    if toggles.timer {
        bits |= 1 << 1;
    }
    if toggles.eta {
        bits |= 1 << 2;
    }
    if toggles.wall_clock_eta {
        bits |= 1 << 3;
    }
    if toggles.rate {
        bits |= 1 << 4;
    }
    if toggles.average_rate {
        bits |= 1 << 5;
    }
    if toggles.bytes {
        bits |= 1 << 6;
    }
    if toggles.buffer_fill {
        bits |= 1 << 7;
    }
    bits
}

fn decode_toggles(bits: u8) -> DisplayToggles {
    DisplayToggles {
        progress: bits & (1 << 0) != 0,
        timer: bits & (1 << 1) != 0,
        eta: bits & (1 << 2) != 0,
        wall_clock_eta: bits & (1 << 3) != 0,
        rate: bits & (1 << 4) != 0,
        average_rate: bits & (1 << 5) != 0,
        bytes: bits & (1 << 6) != 0,
        buffer_fill: bits & (1 << 7) != 0,
        last_written_echo: 0,
        name: false,
    }
}

/// Applies a received message to the live configuration, per design §4.4:
/// rebuild the default format from the incoming toggles, overwrite every
/// nonzero numeric field, replace name/format only when sent non-empty.
/// Returns whether the formatter needs to reparse (always `true` here,
/// since a message always at least rebuilds the toggle set).
pub fn apply(config: &mut Config, message: &RemoteMessage) -> bool {
    config.display = message.toggles.clone();

    if message.rate_limit > 0 {
        config.transfer.rate_limit = message.rate_limit;
    }
    if message.buffer_size > 0 {
        config.transfer.buffer_size = message.buffer_size as usize;
    }
    if message.size > 0 {
        config.transfer.size = message.size;
    }
    if message.interval_ms > 0 {
        config.transfer.interval = Duration::from_millis(message.interval_ms);
    }
    if message.width > 0 {
        config.presentation.width = message.width as usize;
    }
    if message.height > 0 {
        config.presentation.height = message.height as usize;
    }

    if let Some(name) = &message.name {
        config.presentation.name = Some(name.clone());
    }
    config.presentation.format = match &message.format {
        Some(format) => Some(format.clone()),
        None => Some(format::default_format(&config.display)),
    };

    true
}

fn queue_name(euid: u32) -> CString {
    CString::new(format!("/pv-rc-{:08x}-{}", SALT, euid)).expect("queue name has no interior NUL")
}

/// One end of the remote-control channel, owned by the running instance
/// that wants to be reachable.
pub struct RemoteChannel {
    mqd: mqd_t,
    own_pid: i32,
}

impl RemoteChannel {
    /// Creates (or attaches to) this user's queue.
    pub fn open() -> Result<Self> {
        let euid = nix::unistd::geteuid().as_raw();
        let name = queue_name(euid);
        let mqd = open_or_create(&name)?;
        Ok(RemoteChannel { mqd, own_pid: std::process::id() as i32 })
    }

    /// Non-blocking drain of every message currently queued, applying only
    /// the ones addressed to our own pid and silently discarding the rest
    /// (design §4.4: "non-blocking receive of messages addressed to our
    /// own process identifier"). Returns the last message applied, if any,
    /// so the caller can tell the formatter to reparse.
    pub fn poll(&mut self) -> Option<RemoteMessage> {
        let mut applied = None;
        let mut buf = [0u8; MESSAGE_SIZE];
        loop {
            // NOTE(unsafe): mqd is valid for the lifetime of `self`; buf is
            // sized to MESSAGE_SIZE, which matches the queue's msgsize.
            let n = unsafe {
                libc::mq_receive(self.mqd, buf.as_mut_ptr() as *mut libc::c_char, MESSAGE_SIZE, std::ptr::null_mut())
            };
            if n < 0 {
                let errno = Errno::last();
                if errno == Errno::EAGAIN {
                    break;
                }
                if errno == Errno::EBADF {
                    // The queue disappeared from under us; re-create it.
                    if let Ok(mqd) = open_or_create(&queue_name(nix::unistd::geteuid().as_raw())) {
                        self.mqd = mqd;
                    }
                    break;
                }
                break;
            }

            if let Some(message) = RemoteMessage::decode(&buf) {
                if message.recipient_pid == self.own_pid {
                    applied = Some(message);
                }
            }
        }
        applied
    }
}

impl Drop for RemoteChannel {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.mqd);
        }
    }
}

fn open_or_create(name: &CString) -> Result<mqd_t> {
    let mut attr = unsafe { mem::zeroed::<mq_attr>() };
    attr.mq_maxmsg = MAX_MESSAGES;
    attr.mq_msgsize = MESSAGE_SIZE as c_long;

    // NOTE(unsafe): mq_open with O_CREAT is a thin syscall wrapper; attr
    // is fully initialized above.
    let mqd = unsafe {
        libc::mq_open(
            name.as_ptr(),
            O_CREAT | O_RDWR | O_NONBLOCK,
            0o600 as mode_t,
            &attr as *const mq_attr,
        )
    };
    if mqd == -1 {
        return Err(Error::Remote { inner: nix::Error::Sys(Errno::last()) });
    }
    Ok(mqd)
}

/// The one-shot send side (design §4.4 "Send side"): look up the target's
/// queue by pid, snapshot its depth, send, then poll for the target to
/// consume it.
pub fn send(target_euid: u32, message: &RemoteMessage) -> Result<()> {
    let name = queue_name(target_euid);
    // NOTE(unsafe): mq_open without O_CREAT just looks up an existing
    // queue; failure (ENOENT) means there is no instance to reach.
    let mqd = unsafe { libc::mq_open(name.as_ptr(), O_WRONLY | O_NONBLOCK) };
    if mqd == -1 {
        return Err(Error::RemoteNotReceived);
    }

    let before = queue_depth(mqd);
    let payload = message.encode();
    // NOTE(unsafe): payload is exactly MESSAGE_SIZE bytes, matching the
    // queue's msgsize.
    let sent = unsafe { libc::mq_send(mqd, payload.as_ptr() as *const libc::c_char, MESSAGE_SIZE, 0) };
    if sent != 0 {
        unsafe {
            libc::mq_close(mqd);
        }
        return Err(Error::Remote { inner: nix::Error::Sys(Errno::last()) });
    }

    let deadline = Instant::now() + Duration::from_millis(1100);
    let mut consumed = false;
    while Instant::now() < deadline {
        if queue_depth(mqd) <= before {
            consumed = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    unsafe {
        libc::mq_close(mqd);
    }

    if consumed {
        Ok(())
    } else {
        Err(Error::RemoteNotReceived)
    }
}

fn queue_depth(mqd: mqd_t) -> c_long {
    let mut attr = unsafe { mem::zeroed::<mq_attr>() };
    // NOTE(unsafe): mqd is a valid, currently open descriptor.
    if unsafe { libc::mq_getattr(mqd, &mut attr as *mut mq_attr) } == 0 {
        attr.mq_curmsgs
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> RemoteMessage {
        RemoteMessage {
            recipient_pid: 4242,
            toggles: DisplayToggles::default(),
            rate_limit: 1024,
            buffer_size: 0,
            size: 50_000,
            interval_ms: 500,
            width: 0,
            height: 0,
            name: Some("staged".to_string()),
            format: None,
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        use pretty_assertions::assert_eq;
        let message = sample_message();
        let decoded = RemoteMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn decode_rejects_corrupted_length_prefix_instead_of_panicking() {
        let message = sample_message();
        let mut buf = message.encode();
        let name_field_offset = 4 + 1 + 8 * 4 + 4 * 2;
        buf[name_field_offset] = 0xFF;
        assert_eq!(RemoteMessage::decode(&buf), None);
    }

    #[test]
    fn zero_numeric_fields_mean_unchanged_and_stay_zero() {
        let mut message = sample_message();
        message.buffer_size = 0;
        let decoded = RemoteMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded.buffer_size, 0);
    }

    #[test]
    fn applying_message_overwrites_only_nonzero_fields() {
        let mut config = Config::default();
        config.transfer.buffer_size = 999;
        let message = sample_message();

        apply(&mut config, &message);

        assert_eq!(config.transfer.rate_limit, 1024);
        assert_eq!(config.transfer.buffer_size, 999); // unset in message, unchanged
        assert_eq!(config.transfer.size, 50_000);
        assert_eq!(config.presentation.name.as_deref(), Some("staged"));
    }

    #[test]
    fn applying_message_without_format_rebuilds_default() {
        let mut config = Config::default();
        let message = sample_message();
        apply(&mut config, &message);
        assert!(config.presentation.format.is_some());
    }

    #[test]
    fn toggle_byte_round_trips_every_bit() {
        let mut toggles = DisplayToggles::default();
        toggles.wall_clock_eta = true;
        toggles.average_rate = true;
        toggles.buffer_fill = true;
        let byte = encode_toggles(&toggles);
        let back = decode_toggles(byte);
        assert_eq!(back.wall_clock_eta, true);
        assert_eq!(back.average_rate, true);
        assert_eq!(back.buffer_fill, true);
    }
}
