// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Tape file naming and the end-of-session summary.

use std::path::{Component, Path, PathBuf};

use crate::{
    errors::{EngineError, Result},
    utils::{sha256_hex, unix_millis},
};

/// Produces the relative path for a new tape. Implementations must return a
/// path under the tapes root with a `.json5` extension.
pub trait NameGenerator: Send + Sync {
    fn tape_path(&self, program: &str, tag: Option<&str>, identity_key: &str)
    -> PathBuf;
}

impl<F> NameGenerator for F
where F: Fn(&str, Option<&str>, &str) -> PathBuf + Send + Sync
{
    fn tape_path(
        &self,
        program: &str,
        tag: Option<&str>,
        identity_key: &str,
    ) -> PathBuf {
        self(program, tag, identity_key)
    }
}

/// `<program>/<tag-or-'unnamed'>-<unix-ms>-<short-hash>.json5`
pub struct DefaultNames;

impl NameGenerator for DefaultNames {
    fn tape_path(
        &self,
        program: &str,
        tag: Option<&str>,
        identity_key: &str,
    ) -> PathBuf {
        let tag = tag.unwrap_or("unnamed");
        let stamp = unix_millis();
        let short = short_hash(identity_key);
        PathBuf::from(program).join(format!("{tag}-{stamp}-{short}.json5"))
    }
}

/// First 8 hex characters of the SHA-256 of the identity key.
pub fn short_hash(identity_key: &str) -> String {
    sha256_hex(identity_key.as_bytes())[..8].to_string()
}

/// Rejects generated paths that would escape the tapes root or carry the
/// wrong extension.
pub fn validate_rel_path(path: &Path) -> Result<()> {
    if path.is_absolute() {
        return Err(EngineError::Config(format!(
            "tape path must be relative, got {path:?}"
        )));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(EngineError::Config(format!(
            "tape path must not escape the tapes root: {path:?}"
        )));
    }
    if path.extension().and_then(|e| e.to_str()) != Some("json5") {
        return Err(EngineError::Config(format!(
            "tape path must end in .json5: {path:?}"
        )));
    }
    Ok(())
}

/// Close-time accounting: tapes created this session and tapes that were
/// loaded but never matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub new_tapes: Vec<PathBuf>,
    pub unused_tapes: Vec<PathBuf>,
}

/// Prints the summary to stderr in two sorted lists.
pub fn print_summary(summary: &StoreSummary) {
    eprintln!("New tapes:");
    for path in &summary.new_tapes {
        eprintln!("  {}", path.display());
    }
    eprintln!("Unused tapes:");
    for path in &summary.unused_tapes {
        eprintln!("  {}", path.display());
    }
}
