// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Deterministic canonicalization of terminal output for matching.
//!
//! Matching keys must survive ANSI styling, whitespace drift and volatile
//! values (timestamps, UUIDs, pids, content hashes). All functions here are
//! pure and idempotent; `normalize(normalize(x)) == normalize(x)`.

use once_cell::sync::Lazy;
use regex::Regex;

const ESC: char = '\u{1b}';

/// Remove CSI/OSC/SGR escapes and other terminal control sequences, keeping
/// printable characters and newlines.
///
/// An incomplete escape at the end of the input is kept verbatim: the caller
/// re-normalizes once more bytes arrive, so dropping it here would make the
/// result depend on chunk boundaries.
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find(ESC) {
        out.push_str(&rest[..pos]);
        let seq = &rest[pos..];
        match escape_len(seq) {
            Some(len) => rest = &seq[len..],
            None => {
                // Incomplete sequence at buffer end.
                out.push_str(seq);
                return out;
            },
        }
    }
    out.push_str(rest);
    out
}

/// Length in bytes of the escape sequence starting at `seq` (which begins
/// with ESC), or `None` if the sequence is not yet complete.
fn escape_len(seq: &str) -> Option<usize> {
    let mut chars = seq.char_indices().skip(1);
    let (_, kind) = chars.next()?;
    match kind {
        // CSI: parameters 0x30-0x3F, intermediates 0x20-0x2F, final 0x40-0x7E.
        '[' => {
            for (i, c) in chars {
                match c {
                    '\u{30}'..='\u{3f}' | '\u{20}'..='\u{2f}' => {},
                    '\u{40}'..='\u{7e}' => return Some(i + c.len_utf8()),
                    // Malformed sequence; treat the byte as its terminator.
                    _ => return Some(i + c.len_utf8()),
                }
            }
            None
        },
        // OSC / DCS / SOS / PM / APC: terminated by BEL or ESC-backslash (ST).
        ']' | 'P' | 'X' | '^' | '_' => {
            let mut prev_esc = false;
            for (i, c) in chars {
                if c == '\u{7}' {
                    return Some(i + 1);
                }
                if prev_esc {
                    if c == '\\' {
                        return Some(i + 1);
                    }
                    prev_esc = false;
                }
                if c == ESC {
                    prev_esc = true;
                }
            }
            None
        },
        // Two-character escapes (ESC c, ESC 7, charset selection, ...).
        _ => Some(1 + kind.len_utf8()),
    }
}

/// Collapse runs of non-newline Unicode whitespace into a single space and
/// trim trailing spaces per line.
pub fn collapse_ws(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut line = String::new();
    for c in s.chars() {
        if c == '\n' {
            out.push_str(line.trim_end());
            out.push('\n');
            line.clear();
        } else if c.is_whitespace() {
            if !line.ends_with(' ') {
                line.push(' ');
            }
        } else {
            line.push(c);
        }
    }
    out.push_str(line.trim_end());
    out
}

static RE_TS_ISO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?\b",
    )
    .expect("static regex")
});
static RE_TS_LOCAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{2}[:/]\d{2}[:/]\d{2,4}(?:[ T]\d{2}:\d{2}(?::\d{2})?)?\b")
        .expect("static regex")
});
static RE_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
    )
    .expect("static regex")
});
static RE_PID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(pid\s*[=:#]?\s*)\d+").expect("static regex"));
static RE_HEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9a-fA-F]{16,}\b").expect("static regex"));

/// Replace volatile substrings with fixed placeholders: timestamps with
/// `<TS>`, UUIDs with `<UUID>`, `pid=N` forms with `<PID>`, and hex runs of
/// length >= 16 with `<HEX>`.
pub fn scrub(s: &str) -> String {
    let s = RE_TS_ISO.replace_all(s, "<TS>");
    let s = RE_TS_LOCAL.replace_all(&s, "<TS>");
    let s = RE_UUID.replace_all(&s, "<UUID>");
    let s = RE_PID.replace_all(&s, "${1}<PID>");
    let s = RE_HEX.replace_all(&s, "<HEX>");
    s.into_owned()
}

/// Full canonicalization pipeline: strip escapes, collapse whitespace, scrub
/// volatile values. Idempotent.
pub fn normalize(s: &str) -> String {
    scrub(&collapse_ws(&strip_ansi(s)))
}

/// Canonicalize raw bytes. Invalid UTF-8 is replacement-escaped first so
/// downstream hashing stays deterministic regardless of the byte garbage a
/// program emits.
pub fn normalize_bytes(bytes: &[u8]) -> String {
    normalize(&String::from_utf8_lossy(bytes))
}
