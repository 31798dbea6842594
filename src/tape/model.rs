// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory representation of a tape: the persisted recording of one
//! interactive session. The struct tree mirrors the on-disk JSON5 layout
//! field-for-field; serialization order is the declaration order below and
//! must stay stable.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cfg::enums::InputKind;

/// The single schema version this build reads and writes. Other versions are
/// rejected at load; migration tooling lives elsewhere.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tape {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    pub meta: Meta,
    pub session: SessionInfo,
    pub exchanges: Vec<Exchange>,
    /// Unknown top-level fields survive a read-modify-write cycle.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Session identity and replay defaults captured at record time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub pty: PtyDims,
    pub tag: Option<String>,
    pub latency: Option<LatencySpec>,
    #[serde(rename = "errorRate")]
    pub error_rate: u8,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PtyDims {
    pub rows: u16,
    pub cols: u16,
}

/// Replay latency default persisted in the tape: a scalar or a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LatencySpec {
    Fixed(u64),
    Range(u64, u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub recorder: String,
    pub platform: String,
}

/// One input/output round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub pre: PreState,
    pub input: Input,
    pub output: Output,
    pub exit: Option<ExitInfo>,
    #[serde(rename = "durMs")]
    pub dur_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreState {
    /// The most recent `expect`-matched tail; empty only for a first
    /// exchange of a program that writes before reading.
    pub prompt: String,
    #[serde(rename = "stateHash")]
    pub state_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub kind: InputKind,
    /// UTF-8 text when the input decodes; line kind stores it without the
    /// trailing newline.
    pub text: Option<String>,
    /// Raw bytes when the input is not valid UTF-8.
    #[serde(rename = "bytesB64")]
    pub bytes_b64: Option<String>,
}

impl Input {
    pub fn from_bytes(kind: InputKind, data: &[u8]) -> Self {
        match std::str::from_utf8(data) {
            Ok(text) => {
                let text = match kind {
                    InputKind::Line => crate::utils::strip_one_newline(text),
                    InputKind::Raw => text,
                };
                Self {
                    kind,
                    text: Some(text.to_string()),
                    bytes_b64: None,
                }
            },
            Err(_) => Self {
                kind,
                text: None,
                bytes_b64: Some(B64.encode(data)),
            },
        }
    }

    /// The text this input contributes to the match key.
    pub fn matching_text(&self) -> String {
        match (&self.text, &self.bytes_b64) {
            (Some(text), _) => text.clone(),
            (None, Some(b64)) => B64
                .decode(b64)
                .map(|raw| String::from_utf8_lossy(&raw).into_owned())
                .unwrap_or_default(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub chunks: Vec<Chunk>,
}

/// A contiguous burst of PTY output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Milliseconds since the previous chunk; the first chunk of an
    /// exchange measures from send completion.
    #[serde(rename = "delayMs")]
    pub delay_ms: u64,
    #[serde(rename = "dataB64")]
    pub data_b64: String,
    /// Hint for editors and the normalizer.
    #[serde(rename = "isUtf8")]
    pub is_utf8: bool,
}

impl Chunk {
    pub fn from_bytes(delay_ms: u64, data: &[u8]) -> Self {
        Self {
            delay_ms,
            data_b64: B64.encode(data),
            is_utf8: std::str::from_utf8(data).is_ok(),
        }
    }

    pub fn data(&self) -> Option<Vec<u8>> {
        B64.decode(&self.data_b64).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: i32,
    pub signal: Option<String>,
}

impl Exchange {
    /// All output bytes of this exchange, in recorded order.
    pub fn concat_output(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in &self.output.chunks {
            if let Some(data) = chunk.data() {
                out.extend_from_slice(&data);
            }
        }
        out
    }
}
