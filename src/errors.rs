// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error kinds crossing the transport boundary. Timeouts and tape misses are
/// ordinary outcomes here, not panics; callers match on the variant.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("schema-error: {path}:{line}:{column}: {message}")]
    Schema {
        path: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },

    /// No recorded exchange for the computed key. Carries the session
    /// identity and the nearest recorded inputs for diagnostics.
    #[error(
        "tape-miss: no recorded exchange for key {key} (program={program}, cwd={cwd}); nearest inputs: {nearest:?}"
    )]
    TapeMiss {
        key: String,
        program: String,
        cwd: String,
        nearest: Vec<String>,
    },

    #[error("redaction-error: custom pattern {pattern:?} is malformed: {message}")]
    Redaction { pattern: String, message: String },

    #[error("store-busy: could not acquire write lock on {path} within {waited_ms} ms")]
    StoreBusy { path: PathBuf, waited_ms: u64 },

    #[error("recorder-reentrancy: send while an exchange is still open; pair each send with an expect")]
    RecorderReentrancy,

    #[error("session-closed: operation on a finished session")]
    SessionClosed,

    #[error("timeout: no pattern matched within {waited_ms} ms; buffer tail:\n{tail}")]
    Timeout { waited_ms: u64, tail: String },

    #[error("process-error: child ended (code={code:?}, signal={signal:?}); buffer tail:\n{tail}")]
    Process {
        code: Option<i32>,
        signal: Option<String>,
        tail: String,
    },

    #[error("simulated-timeout: injected fault after {streamed_chunks} chunks; buffer tail:\n{tail}")]
    SimulatedTimeout { streamed_chunks: usize, tail: String },

    #[error("simulated-exit: injected process exit with code {code}")]
    SimulatedExit { code: i32 },

    #[error("config-error: {0}")]
    Config(String),

    #[error("io-error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable machine-readable kind, matching the wire-level taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "schema-error",
            Self::TapeMiss { .. } => "tape-miss",
            Self::Redaction { .. } => "redaction-error",
            Self::StoreBusy { .. } => "store-busy",
            Self::RecorderReentrancy => "recorder-reentrancy",
            Self::SessionClosed => "session-closed",
            Self::Timeout { .. } => "timeout",
            Self::Process { .. } => "process-error",
            Self::SimulatedTimeout { .. } => "simulated-timeout",
            Self::SimulatedExit { .. } => "simulated-exit",
            Self::Config(_) => "config-error",
            Self::Io(_) => "io-error",
        }
    }
}
