// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, path::PathBuf, sync::Arc};

use crate::{
    cfg::enums::{FallbackMode, RecordMode},
    errors::{EngineError, Result},
    matcher::{ArgSelector, CommandMatcher, MatchRules, StdinMatcher},
    tape::{
        model::Tape,
        naming::{DefaultNames, NameGenerator},
    },
};

/// Default `expect` deadline when the caller passes none.
pub const DEFAULT_EXPECT_TIMEOUT_MS: u64 = 10_000;

/// In-memory ceiling for one exchange's captured output before chunks spill
/// to a temp file.
pub const DEFAULT_SPILL_CEILING: usize = 16 * 1024 * 1024;

/// Transforms applied to recorded data. Implementations must be pure; the
/// store never observes their side effects.
pub trait Decorator: Send + Sync {
    fn apply(&self, data: &[u8]) -> Vec<u8>;
}

impl<F> Decorator for F
where F: Fn(&[u8]) -> Vec<u8> + Send + Sync
{
    fn apply(&self, data: &[u8]) -> Vec<u8> {
        self(data)
    }
}

/// Applied once to the finished tape at close, before persistence.
pub trait TapeDecorator: Send + Sync {
    fn apply(&self, tape: &mut Tape);
}

impl<F> TapeDecorator for F
where F: Fn(&mut Tape) + Send + Sync
{
    fn apply(&self, tape: &mut Tape) {
        self(tape)
    }
}

/// Computes the effective pacing delay for a replayed chunk.
pub trait LatencyFn: Send + Sync {
    fn delay_ms(&self, chunk_index: usize, recorded_ms: u64) -> u64;
}

impl<F> LatencyFn for F
where F: Fn(usize, u64) -> u64 + Send + Sync
{
    fn delay_ms(&self, chunk_index: usize, recorded_ms: u64) -> u64 {
        self(chunk_index, recorded_ms)
    }
}

/// Pacing policy applied when replaying recorded chunks.
#[derive(Clone, Default)]
pub enum LatencyPolicy {
    /// Replay the recorded `delayMs` of every chunk verbatim.
    #[default]
    Recorded,
    /// Replace every recorded delay with a fixed value (0 paces flat-out).
    Fixed(u64),
    /// Draw each delay uniformly from `[lo, hi]` milliseconds.
    Uniform(u64, u64),
    /// Defer to a user-supplied callable.
    Custom(Arc<dyn LatencyFn>),
}

impl fmt::Debug for LatencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recorded => write!(f, "Recorded"),
            Self::Fixed(ms) => write!(f, "Fixed({ms})"),
            Self::Uniform(lo, hi) => write!(f, "Uniform({lo}, {hi})"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// What to launch and under which terminal geometry.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Program name or path; bare names are resolved via `PATH`.
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment entries layered over the inherited environment.
    pub env: Vec<(String, String)>,
    /// Working directory; `None` inherits the caller's.
    pub cwd: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            rows: 24,
            cols: 80,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Everything the facade needs to decide between live and replay and to
/// drive recording. Constructed programmatically; config *files* belong to
/// the caller.
#[derive(Clone)]
pub struct SessionConfig {
    /// Root directory holding `*.json5` tapes.
    pub tapes_path: PathBuf,
    pub record: RecordMode,
    pub fallback: FallbackMode,

    /// When non-empty, only these environment keys participate in matching.
    pub allow_env: Vec<String>,
    /// Keys removed from matching when `allow_env` is empty.
    pub ignore_env: Vec<String>,
    /// Argument positions to elide or values to blank in matching.
    pub ignore_args: Vec<ArgSelector>,
    /// Replace the input with the empty string in matching.
    pub ignore_stdin: bool,

    pub command_matcher: Option<Arc<dyn CommandMatcher>>,
    pub stdin_matcher: Option<Arc<dyn StdinMatcher>>,
    pub input_decorator: Option<Arc<dyn Decorator>>,
    pub output_decorator: Option<Arc<dyn Decorator>>,
    pub tape_decorator: Option<Arc<dyn TapeDecorator>>,
    pub name_generator: Arc<dyn NameGenerator>,

    pub latency: LatencyPolicy,
    /// Probability in percent that a replayed exchange gets a fault injected.
    pub error_rate: u8,
    /// Seed persisted into recorded tapes for deterministic injection.
    pub seed: u64,

    /// Optional user tag, also used by the default tape naming scheme.
    pub tag: Option<String>,
    /// Custom redaction rules as `(pattern, category)` pairs.
    pub redact_patterns: Vec<(String, String)>,
    /// Permit recording even when `CC_REDACT=0` disabled the built-ins.
    pub allow_unredacted: bool,

    pub summary: bool,
    pub silent: bool,
    pub debug: bool,
    /// Surface recording I/O failures instead of downgrading to live-only.
    pub strict_recording: bool,

    pub expect_timeout_ms: u64,
    pub spill_ceiling: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tapes_path: PathBuf::from("tapes"),
            record: RecordMode::default(),
            fallback: FallbackMode::default(),
            allow_env: Vec::new(),
            ignore_env: Vec::new(),
            ignore_args: Vec::new(),
            ignore_stdin: false,
            command_matcher: None,
            stdin_matcher: None,
            input_decorator: None,
            output_decorator: None,
            tape_decorator: None,
            name_generator: Arc::new(DefaultNames),
            latency: LatencyPolicy::default(),
            error_rate: 0,
            seed: 0,
            tag: None,
            redact_patterns: Vec::new(),
            allow_unredacted: false,
            summary: true,
            silent: false,
            debug: false,
            strict_recording: false,
            expect_timeout_ms: DEFAULT_EXPECT_TIMEOUT_MS,
            spill_ceiling: DEFAULT_SPILL_CEILING,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("tapes_path", &self.tapes_path)
            .field("record", &self.record)
            .field("fallback", &self.fallback)
            .field("allow_env", &self.allow_env)
            .field("ignore_env", &self.ignore_env)
            .field("ignore_args", &self.ignore_args)
            .field("ignore_stdin", &self.ignore_stdin)
            .field("latency", &self.latency)
            .field("error_rate", &self.error_rate)
            .field("seed", &self.seed)
            .field("tag", &self.tag)
            .field("summary", &self.summary)
            .field("silent", &self.silent)
            .field("strict_recording", &self.strict_recording)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    pub fn new(tapes_path: impl Into<PathBuf>) -> Self {
        Self {
            tapes_path: tapes_path.into(),
            ..Self::default()
        }
    }

    /// Matching rules shared by the store index and per-send lookups.
    pub fn match_rules(&self) -> MatchRules {
        MatchRules {
            allow_env: self.allow_env.clone(),
            ignore_env: self.ignore_env.clone(),
            ignore_args: self.ignore_args.clone(),
            ignore_stdin: self.ignore_stdin,
            command_matcher: self.command_matcher.clone(),
            stdin_matcher: self.stdin_matcher.clone(),
        }
    }

    /// Validates invariants that would otherwise fail deep inside a session.
    /// A tapes root that cannot take writes while recording is requested is
    /// fatal up front.
    pub fn validate(&self) -> Result<()> {
        if self.error_rate > 100 {
            return Err(EngineError::Config(format!(
                "errorRate must be within 0..=100, got {}",
                self.error_rate
            )));
        }
        if let LatencyPolicy::Uniform(lo, hi) = self.latency
            && lo > hi
        {
            return Err(EngineError::Config(format!(
                "latency range is inverted: [{lo}, {hi}]"
            )));
        }
        if self.record != RecordMode::Disabled {
            std::fs::create_dir_all(&self.tapes_path).map_err(|e| {
                EngineError::Config(format!(
                    "tapesPath {:?} is not writable: {e}",
                    self.tapes_path
                ))
            })?;
            let probe = self.tapes_path.join(".write-probe");
            std::fs::write(&probe, b"").map_err(|e| {
                EngineError::Config(format!(
                    "tapesPath {:?} is not writable: {e}",
                    self.tapes_path
                ))
            })?;
            let _ = std::fs::remove_file(&probe);
        }
        Ok(())
    }
}
