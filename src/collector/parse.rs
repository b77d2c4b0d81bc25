//! Turns raw runtime output into a timestamped, printable message.

use chrono::DateTime;

/// Width of the stdout/stderr multiplexing header Docker prepends to
/// frames of non-TTY containers.
const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    /// Nanoseconds since the epoch.
    pub timestamp: i64,
    pub message: String,
}

/// Cleans one raw line. Returns `None` when nothing printable is left.
pub fn parse_line(data: &[u8], received_at: i64) -> Option<ParsedLine> {
    let text = String::from_utf8_lossy(strip_frame_header(data));
    let (timestamp, rest) = split_timestamp(&text);
    let message = strip_escapes(rest);
    let message = message.trim();
    if message.is_empty() {
        return None;
    }
    Some(ParsedLine {
        timestamp: timestamp.unwrap_or(received_at),
        message: message.to_string(),
    })
}

fn strip_frame_header(data: &[u8]) -> &[u8] {
    match data {
        [0..=2, 0, 0, 0, _, _, _, _, ..] => &data[FRAME_HEADER_LEN..],
        _ => data,
    }
}

/// Splits a leading RFC3339 token off the line.
fn split_timestamp(text: &str) -> (Option<i64>, &str) {
    let trimmed = text.trim_start();
    let (token, rest) = match trimmed.find(char::is_whitespace) {
        Some(pos) => (&trimmed[..pos], &trimmed[pos..]),
        None => (trimmed, ""),
    };
    match DateTime::parse_from_rfc3339(token)
        .ok()
        .and_then(|ts| ts.timestamp_nanos_opt())
    {
        Some(nanos) => (Some(nanos), rest),
        None => (None, text),
    }
}

/// Removes ANSI CSI and OSC sequences and any remaining control
/// characters except tabs.
fn strip_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => match chars.peek() {
                Some('[') => {
                    chars.next();
                    // Parameters and intermediates, then one final byte.
                    for c in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    // Terminated by BEL or ESC '\'.
                    while let Some(c) = chars.next() {
                        if c == '\u{7}' {
                            break;
                        }
                        if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}
