// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Tape (de)serialization.
//!
//! Tapes are read as JSON5 so humans can annotate them with comments,
//! trailing commas and single-quoted strings. Writes emit pretty-printed
//! plain JSON (a JSON5 subset) with two-space indentation and stable key
//! order, so a freshly written tape is bit-reproducible.

use std::path::Path;

use crate::{
    errors::{EngineError, Result},
    tape::model::{SCHEMA_VERSION, Tape},
};

/// Pluggable stricter validation; when absent, validation is structural
/// only. Implementations must not mutate global state.
pub trait SchemaCheck: Send + Sync {
    fn check(&self, path: &Path, tape: &Tape) -> Result<()>;
}

/// Parse and validate tape text. Schema problems report the offending
/// file position.
pub fn decode(path: &Path, text: &str) -> Result<Tape> {
    let tape: Tape = json5::from_str(text).map_err(|e| schema_error(path, &e))?;
    validate(path, &tape)?;
    Ok(tape)
}

/// Render a tape for persistence. Output is valid JSON5 and round-trips
/// through [`decode`].
pub fn encode(tape: &Tape) -> Result<String> {
    let mut text = serde_json::to_string_pretty(tape).map_err(|e| EngineError::Schema {
        path: Default::default(),
        line: 0,
        column: 0,
        message: format!("tape failed to serialize: {e}"),
    })?;
    text.push('\n');
    Ok(text)
}

fn validate(path: &Path, tape: &Tape) -> Result<()> {
    if tape.schema_version != SCHEMA_VERSION {
        return Err(EngineError::Schema {
            path: path.to_path_buf(),
            line: 1,
            column: 1,
            message: format!(
                "unsupported schemaVersion {} (expected {})",
                tape.schema_version, SCHEMA_VERSION
            ),
        });
    }
    if tape.exchanges.is_empty() {
        return Err(EngineError::Schema {
            path: path.to_path_buf(),
            line: 1,
            column: 1,
            message: "tape has no exchanges".to_string(),
        });
    }
    if tape.meta.error_rate > 100 {
        return Err(EngineError::Schema {
            path: path.to_path_buf(),
            line: 1,
            column: 1,
            message: format!("errorRate {} out of range", tape.meta.error_rate),
        });
    }
    for (i, exchange) in tape.exchanges.iter().enumerate() {
        for (j, chunk) in exchange.output.chunks.iter().enumerate() {
            if chunk.data().is_none() {
                return Err(EngineError::Schema {
                    path: path.to_path_buf(),
                    line: 1,
                    column: 1,
                    message: format!(
                        "exchange {i} chunk {j}: dataB64 is not valid base64"
                    ),
                });
            }
        }
    }
    Ok(())
}

fn schema_error(path: &Path, err: &json5::Error) -> EngineError {
    let (line, column) = match err {
        json5::Error::Message {
            location: Some(loc), ..
        } => (loc.line, loc.column),
        json5::Error::Message { location: None, .. } => (0, 0),
    };
    EngineError::Schema {
        path: path.to_path_buf(),
        line,
        column,
        message: err.to_string(),
    }
}
