// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Deterministic match keys over a session's identity and per-exchange
//! state.
//!
//! The key is the SHA-256 of a canonical JSON encoding of the matching
//! context; field order is fixed by the struct definitions and the
//! environment map is key-sorted, so `key(ctx)` is stable across runs and
//! machines.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;

use crate::{
    cfg::enums::InputKind,
    normalize,
    utils::{sha256_hex, strip_one_newline},
};

/// Overrides how the program and argv enter the match key. Must be pure.
pub trait CommandMatcher: Send + Sync {
    fn rewrite(&self, program: &str, args: &[String]) -> (String, Vec<String>);
}

impl<F> CommandMatcher for F
where F: Fn(&str, &[String]) -> (String, Vec<String>) + Send + Sync
{
    fn rewrite(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        self(program, args)
    }
}

/// Overrides how input text enters the match key. Must be pure.
pub trait StdinMatcher: Send + Sync {
    fn rewrite(&self, input: &str) -> String;
}

impl<F> StdinMatcher for F
where F: Fn(&str) -> String + Send + Sync
{
    fn rewrite(&self, input: &str) -> String {
        self(input)
    }
}

/// Selects arguments to neutralize in the key: by position (elided) or by
/// value (replaced with `<IGN>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgSelector {
    Position(usize),
    Value(String),
}

/// Placeholder for argument values neutralized by `ArgSelector::Value`.
pub const IGNORED_ARG: &str = "<IGN>";

/// Filter and override rules shared by the store index and live lookups.
#[derive(Clone, Default)]
pub struct MatchRules {
    pub allow_env: Vec<String>,
    pub ignore_env: Vec<String>,
    pub ignore_args: Vec<ArgSelector>,
    pub ignore_stdin: bool,
    pub command_matcher: Option<Arc<dyn CommandMatcher>>,
    pub stdin_matcher: Option<Arc<dyn StdinMatcher>>,
}

impl fmt::Debug for MatchRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchRules")
            .field("allow_env", &self.allow_env)
            .field("ignore_env", &self.ignore_env)
            .field("ignore_args", &self.ignore_args)
            .field("ignore_stdin", &self.ignore_stdin)
            .field("command_matcher", &self.command_matcher.is_some())
            .field("stdin_matcher", &self.stdin_matcher.is_some())
            .finish()
    }
}

impl MatchRules {
    /// Argv with ignored positions elided and ignored values blanked.
    pub fn filter_args(&self, args: &[String]) -> Vec<String> {
        args.iter()
            .enumerate()
            .filter(|(i, _)| {
                !self
                    .ignore_args
                    .iter()
                    .any(|sel| matches!(sel, ArgSelector::Position(p) if p == i))
            })
            .map(|(_, a)| {
                let ignored = self
                    .ignore_args
                    .iter()
                    .any(|sel| matches!(sel, ArgSelector::Value(v) if v == a));
                if ignored { IGNORED_ARG.to_string() } else { a.clone() }
            })
            .collect()
    }

    /// Environment restricted to the allow list when non-empty, otherwise
    /// the full set minus the ignore list. Sorted by key.
    pub fn filter_env<'a, I>(&self, env: I) -> BTreeMap<String, String>
    where I: IntoIterator<Item = (&'a String, &'a String)> {
        env.into_iter()
            .filter(|&(k, _)| {
                if self.allow_env.is_empty() {
                    !self.ignore_env.contains(k)
                } else {
                    self.allow_env.contains(k)
                }
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Immutable per-lookup fingerprint material.
#[derive(Debug, Clone, Serialize)]
pub struct MatchContext {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub prompt: String,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
}

impl MatchContext {
    /// Builds the context for one lookup. `program` is already resolved and
    /// basenamed (see [`resolve_program`]); `input` is the decorated input
    /// bytes as sent.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        rules: &MatchRules,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: &str,
        prompt: &str,
        input: &[u8],
        kind: InputKind,
        state_hash: Option<String>,
    ) -> Self {
        let (program, args) = match &rules.command_matcher {
            Some(m) => m.rewrite(program, args),
            None => (program.to_string(), args.to_vec()),
        };
        let args = rules.filter_args(&args);
        let env = rules.filter_env(env.iter());

        let input = if rules.ignore_stdin {
            String::new()
        } else {
            let text = String::from_utf8_lossy(input);
            let text = match kind {
                InputKind::Line => strip_one_newline(&text).to_string(),
                InputKind::Raw => text.into_owned(),
            };
            match &rules.stdin_matcher {
                Some(m) => m.rewrite(&text),
                None => text,
            }
        };

        Self {
            program,
            args,
            env,
            cwd: cwd.to_string(),
            prompt: normalize::normalize(prompt),
            input,
            state_hash,
        }
    }

    /// Deterministic fingerprint of this context.
    pub fn key(&self) -> String {
        let canonical =
            serde_json::to_string(self).expect("match context serializes to JSON");
        sha256_hex(canonical.as_bytes())
    }
}

/// Session-scoped identity: everything that must line up before individual
/// exchanges are even considered.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityContext {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
}

impl IdentityContext {
    pub fn build(
        rules: &MatchRules,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: &str,
    ) -> Self {
        let (program, args) = match &rules.command_matcher {
            Some(m) => m.rewrite(program, args),
            None => (program.to_string(), args.to_vec()),
        };
        Self {
            program,
            args: rules.filter_args(&args),
            env: rules.filter_env(env.iter()),
            cwd: cwd.to_string(),
        }
    }

    pub fn key(&self) -> String {
        let canonical =
            serde_json::to_string(self).expect("identity context serializes to JSON");
        sha256_hex(canonical.as_bytes())
    }
}

/// Resolves `program` against `PATH` and returns `(full_path, basename)`.
/// The basename is what enters match keys; the full path is what gets
/// spawned.
pub fn resolve_program(program: &str) -> (PathBuf, String) {
    let path = Path::new(program);
    let full = if path.components().count() > 1 {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    } else {
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(program))
                    .find(|candidate| candidate.is_file())
                    .unwrap_or_else(|| path.to_path_buf())
            })
            .unwrap_or_else(|| path.to_path_buf())
    };
    let base = full
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string());
    (full, base)
}
