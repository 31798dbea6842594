// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use serde::{Deserialize, Serialize};

/// What to do about recording when a session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordMode {
    /// Record unless a tape for this session identity already exists; in
    /// that case replay it instead.
    #[default]
    New,
    /// Always record, truncating any previous tape at the target path.
    Overwrite,
    /// Never record.
    Disabled,
}

/// Policy for a replay lookup that finds no recorded exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Surface `tape-miss` with diagnostics.
    #[default]
    NotFound,
    /// Swap in a live transport and re-issue the pending send.
    Proxy,
}

/// How the input of an exchange was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// Text terminated by a newline; matching ignores the terminator.
    Line,
    /// Raw bytes (control sequences, partial input).
    Raw,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line => write!(f, "line"),
            Self::Raw => write!(f, "raw"),
        }
    }
}
