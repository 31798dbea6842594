// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Newline appended by `send_line`.
#[cfg(windows)]
pub const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_ENDING: &str = "\n";

/// Wall-clock milliseconds since the Unix epoch, used for tape file names.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// SHA-256 of `data`, hex-encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Last `max_lines` lines of `text`. Diagnostic tails are capped so error
/// messages stay readable for noisy programs.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let count = text.lines().count();
    if count <= max_lines {
        return text.to_string();
    }
    text.lines()
        .skip(count - max_lines)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip exactly one trailing `\r\n` or `\n` from line-oriented input.
pub fn strip_one_newline(text: &str) -> &str {
    if let Some(stripped) = text.strip_suffix("\r\n") {
        stripped
    } else if let Some(stripped) = text.strip_suffix('\n') {
        stripped
    } else {
        text
    }
}
