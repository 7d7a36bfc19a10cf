//! The format language and its segment parser (design §4.2 "Format
//! language" / "Segment model", and §9 "Dynamic format language" — the
//! default format is synthesized from the enabled component set and then
//! goes through this same parser, so there is exactly one code path from
//! "a format string" to "a segment list").

use std::borrow::Cow;

use config::DisplayToggles;

/// Which pre-rendered component string a `Fixed` segment points at. This is
/// a lookup key, not an owning handle (design §9 "Cyclic / back-referencing
/// data") — the formatter recomputes and owns the actual strings each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentId {
    Name,
    Bytes,
    BufferFill,
    Timer,
    Rate,
    AverageRate,
    Eta,
    WallClockEta,
    Echo,
}

/// One entry in the parsed format. Segments carry `'a` borrowed from the
/// format string being parsed wherever possible; escaped `%%` is the one
/// case that can't borrow a single-byte slice out of a two-byte input, so
/// it borrows a `'static` literal instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(Cow<'a, str>),
    Fixed(ComponentId),
    /// The single progress bar; at most one may appear in a parsed format.
    Elastic,
}

const MAX_SEGMENTS: usize = 100;

/// Parses a user- or default-supplied format string into an ordered
/// segment list. Never fails: an unrecognized directive letter is rendered
/// literally, `%` and all, per design §4.2.
pub fn parse(format: &str) -> Vec<Segment<'_>> {
    let bytes = format.as_bytes();
    let mut segments = Vec::new();
    let mut literal_start = 0usize;
    let mut i = 0usize;

    macro_rules! flush_literal {
        ($end:expr) => {
            if $end > literal_start {
                segments.push(Segment::Literal(Cow::Borrowed(&format[literal_start..$end])));
            }
        };
    }

    while i < bytes.len() && segments.len() < MAX_SEGMENTS {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }

        flush_literal!(i);
        let percent_at = i;

        // Optional digit run before the directive letter (only meaningful
        // for %nA, but harmless to scan generically).
        let mut j = i + 1;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }

        if j >= bytes.len() {
            // Trailing lone `%` (or `%123` with nothing after): literal.
            segments.push(Segment::Literal(Cow::Borrowed(&format[i..bytes.len()])));
            literal_start = bytes.len();
            i = bytes.len();
            continue;
        }

        let directive = bytes[j] as char;
        let has_digits = j > i + 1;

        let segment = match directive {
            '%' if !has_digits => Some(Segment::Literal(Cow::Borrowed("%"))),
            'N' if !has_digits => Some(Segment::Fixed(ComponentId::Name)),
            'b' if !has_digits => Some(Segment::Fixed(ComponentId::Bytes)),
            'T' if !has_digits => Some(Segment::Fixed(ComponentId::BufferFill)),
            't' if !has_digits => Some(Segment::Fixed(ComponentId::Timer)),
            'r' if !has_digits => Some(Segment::Fixed(ComponentId::Rate)),
            'a' if !has_digits => Some(Segment::Fixed(ComponentId::AverageRate)),
            'e' if !has_digits => Some(Segment::Fixed(ComponentId::Eta)),
            'I' if !has_digits => Some(Segment::Fixed(ComponentId::WallClockEta)),
            'p' if !has_digits => Some(Segment::Elastic),
            'A' => Some(Segment::Fixed(ComponentId::Echo)),
            _ => None,
        };

        match segment {
            Some(seg) => {
                segments.push(seg);
                literal_start = j + 1;
                i = j + 1;
            }
            None => {
                // Unknown trailing letter (or a digit run not followed by
                // `A`): render the whole thing literally, `%` included.
                segments.push(Segment::Literal(Cow::Borrowed(&format[percent_at..=j])));
                literal_start = j + 1;
                i = j + 1;
            }
        }
    }

    flush_literal!(bytes.len().min(format.len()));
    segments
}

/// Synthesizes the default format string from the enabled component set
/// (design §9: "do not conflate 'which components are enabled' with 'how
/// they are laid out'"). The result is fed back through [`parse`] exactly
/// like a user-supplied format would be.
pub fn default_format(toggles: &DisplayToggles) -> String {
    let mut parts = Vec::new();
    if toggles.name {
        parts.push("%N".to_string());
    }
    if toggles.timer {
        parts.push("%t".to_string());
    }
    if toggles.rate {
        parts.push("%r".to_string());
    }
    if toggles.average_rate {
        parts.push("%a".to_string());
    }
    if toggles.bytes {
        parts.push("%b".to_string());
    }
    if toggles.buffer_fill {
        parts.push("%T".to_string());
    }
    if toggles.progress {
        parts.push("%p".to_string());
    }
    if toggles.eta {
        parts.push("%e".to_string());
    }
    if toggles.wall_clock_eta {
        parts.push("%I".to_string());
    }
    if toggles.last_written_echo > 0 {
        parts.push(format!("%{}A", toggles.last_written_echo));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_directive_is_literal() {
        let segs = parse("%q");
        assert_eq!(segs, vec![Segment::Literal(Cow::Borrowed("%q"))]);
    }

    #[test]
    fn literal_percent_escapes() {
        let segs = parse("100%% done");
        assert_eq!(
            segs,
            vec![
                Segment::Literal(Cow::Borrowed("100")),
                Segment::Literal(Cow::Borrowed("%")),
                Segment::Literal(Cow::Borrowed(" done")),
            ]
        );
    }

    #[test]
    fn name_directive_parses() {
        let segs = parse("%N");
        assert_eq!(segs, vec![Segment::Fixed(ComponentId::Name)]);
    }

    #[test]
    fn echo_directive_with_width_parses() {
        let segs = parse("%20A");
        assert_eq!(segs, vec![Segment::Fixed(ComponentId::Echo)]);
    }

    #[test]
    fn parse_is_idempotent() {
        let format = "%N %b %T %t %r %a %p %e %I %20A";
        assert_eq!(parse(format), parse(format));
    }

    #[test]
    fn reordered_format_preserves_elastic_position() {
        let first = parse("%p %r");
        let second = parse("%r %p");
        assert_eq!(first[0], Segment::Elastic);
        assert_eq!(second.last(), Some(&Segment::Elastic));
    }

    #[test]
    fn default_format_only_includes_enabled_toggles() {
        let mut toggles = DisplayToggles::default();
        toggles.average_rate = false;
        toggles.wall_clock_eta = false;
        toggles.buffer_fill = false;
        toggles.last_written_echo = 0;
        toggles.name = false;
        let format = default_format(&toggles);
        assert!(format.contains("%t"));
        assert!(format.contains("%b"));
        assert!(!format.contains("%N"));
        assert!(!format.contains("%a"));
    }

    #[test]
    fn at_most_one_elastic_segment_from_default() {
        let toggles = DisplayToggles::default();
        let format = default_format(&toggles);
        let segs = parse(&format);
        let elastics = segs.iter().filter(|s| **s == Segment::Elastic).count();
        assert!(elastics <= 1);
    }
}
