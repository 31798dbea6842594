// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The transport facade: one interface over live PTY sessions and tape
//! replays.
//!
//! At start the facade picks a transport from (record mode, fallback mode,
//! whether a tape for this session identity exists); on a `proxy` fallback
//! it swaps the replay transport for a live one in place, under the single
//! session mutex.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use chrono::{SecondsFormat, Utc};
use regex::bytes::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    cfg::{
        config::{LatencyPolicy, SessionConfig, SpawnSpec},
        enums::{FallbackMode, InputKind, RecordMode},
    },
    errors::{EngineError, Result},
    matcher::{IdentityContext, resolve_program},
    redact::Redactor,
    tape::{
        model::{ExitInfo, LatencySpec, Meta, PtyDims, SessionInfo},
        naming::{self, validate_rel_path},
        store::TapeStore,
    },
    transport::{
        common::ExpectOutcome, live::LiveTransport, recorder::Recorder,
        replay::ReplayTransport,
    },
    utils::LINE_ENDING,
};

enum ActiveTransport {
    Live(LiveTransport),
    Replay(ReplayTransport),
}

struct Inner {
    cfg: SessionConfig,
    spec: SpawnSpec,
    program_path: PathBuf,
    program_base: String,
    env: BTreeMap<String, String>,
    cwd: String,
    identity_key: String,
    store: Arc<TapeStore>,
    redactor: Arc<Redactor>,
    transport: ActiveTransport,
    recorder: Option<Arc<StdMutex<Recorder>>>,
    last_prompt: String,
    state_hash: Option<String>,
    closed: bool,
}

/// One interactive session, live or replayed. Callers drive it with
/// `send`/`send_line` and `expect` and cannot observe which transport backs
/// it except through side channels.
pub struct Session {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Load the tape store for `cfg.tapes_path` and start a session.
    pub async fn start(cfg: SessionConfig, spec: SpawnSpec) -> Result<Self> {
        cfg.validate()?;
        let store = TapeStore::load(&cfg.tapes_path, cfg.match_rules());
        Self::start_with_store(cfg, spec, store).await
    }

    /// Start a session against an already-loaded store (shared across
    /// sessions of one process).
    pub async fn start_with_store(
        cfg: SessionConfig,
        spec: SpawnSpec,
        store: Arc<TapeStore>,
    ) -> Result<Self> {
        cfg.validate()?;
        let redactor = Arc::new(Redactor::new(&cfg.redact_patterns)?);
        if redactor.builtins_disabled()
            && cfg.record != RecordMode::Disabled
            && !cfg.allow_unredacted
        {
            return Err(EngineError::Config(format!(
                "{}=0 disables redaction; recording requires allow_unredacted",
                crate::redact::REDACT_ENV
            )));
        }

        let (program_path, program_base) = resolve_program(&spec.program);
        let env = session_env(&spec);
        let cwd = session_cwd(&spec);

        let rules = cfg.match_rules();
        let identity =
            IdentityContext::build(&rules, &program_base, &spec.args, &env, &cwd);
        let identity_key = identity.key();
        let tape_exists = store.has_identity(&identity_key);
        if cfg.debug {
            debug!(
                identity_key = %identity_key,
                tape_exists,
                record = ?cfg.record,
                fallback = ?cfg.fallback,
                "session mode selection"
            );
        }

        let replay_chosen = match (cfg.record, cfg.fallback, tape_exists) {
            (RecordMode::New, _, exists) => exists,
            (RecordMode::Overwrite, _, _) => false,
            (RecordMode::Disabled, FallbackMode::NotFound, false) => {
                return Err(EngineError::TapeMiss {
                    key: identity_key,
                    program: program_base,
                    cwd,
                    nearest: Vec::new(),
                });
            },
            (RecordMode::Disabled, _, exists) => exists,
        };

        let (transport, recorder) = if replay_chosen {
            info!(program = %program_base, "tape found; serving session from replay");
            let replay = ReplayTransport::new(
                store.clone(),
                &cfg,
                program_base.clone(),
                spec.args.clone(),
                env.clone(),
                cwd.clone(),
            );
            if let Some(prompt) = store.first_prompt_for_identity(&identity_key) {
                replay.seed_prompt(&prompt);
            }
            (ActiveTransport::Replay(replay), None)
        } else {
            let recording = cfg.record != RecordMode::Disabled;
            info!(program = %program_base, recording, "starting live session");
            let recorder = if recording {
                Some(build_recorder(
                    &cfg,
                    &program_base,
                    &spec,
                    &env,
                    &cwd,
                    &identity_key,
                    &redactor,
                )?)
            } else {
                None
            };
            let live =
                LiveTransport::spawn(&spec, &program_path, &env, recorder.clone())?;
            (ActiveTransport::Live(live), recorder)
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                cfg,
                spec,
                program_path,
                program_base,
                env,
                cwd,
                identity_key,
                store,
                redactor,
                transport,
                recorder,
                last_prompt: String::new(),
                state_hash: None,
                closed: false,
            }),
        })
    }

    /// Caller-supplied state hash mixed into subsequent match keys.
    pub async fn set_state_hash(&self, state_hash: Option<String>) {
        let mut inner = self.inner.lock().await;
        inner.state_hash = state_hash.clone();
        if let ActiveTransport::Replay(replay) = &mut inner.transport {
            replay.set_state_hash(state_hash);
        }
    }

    /// Send raw bytes. Returns the number of bytes accepted.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        send_impl(&mut inner, data, InputKind::Raw).await
    }

    /// Send a line of text terminated with the platform newline.
    pub async fn send_line(&self, text: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let mut data = text.as_bytes().to_vec();
        data.extend_from_slice(LINE_ENDING.as_bytes());
        send_impl(&mut inner, &data, InputKind::Line).await
    }

    /// Wait until one of `patterns` matches the session output.
    pub async fn expect(
        &self,
        patterns: &[Regex],
        timeout_ms: Option<u64>,
    ) -> Result<ExpectOutcome> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(EngineError::SessionClosed);
        }
        let timeout =
            Duration::from_millis(timeout_ms.unwrap_or(inner.cfg.expect_timeout_ms));

        match &mut inner.transport {
            ActiveTransport::Replay(replay) => {
                let outcome = replay.expect(patterns, timeout).await?;
                inner.last_prompt = outcome.matched_text.clone();
                Ok(outcome)
            },
            ActiveTransport::Live(live) => match live.expect(patterns, timeout).await {
                Ok((outcome, abs_end)) => {
                    if let Some(rec) = &inner.recorder {
                        rec.lock()
                            .expect("recorder poisoned")
                            .on_exchange_end(abs_end, None)?;
                    }
                    inner.last_prompt = outcome.matched_text.clone();
                    Ok(outcome)
                },
                Err(err @ EngineError::Timeout { .. }) => {
                    if let Some(rec) = &inner.recorder {
                        rec.lock().expect("recorder poisoned").on_timeout()?;
                    }
                    Err(err)
                },
                Err(EngineError::Process { code, signal, tail }) => {
                    if let Some(rec) = &inner.recorder {
                        rec.lock().expect("recorder poisoned").on_process_exit(
                            ExitInfo {
                                code: code.unwrap_or(-1),
                                signal: signal.clone(),
                            },
                        );
                    }
                    Err(EngineError::Process { code, signal, tail })
                },
                Err(err) => Err(err),
            },
        }
    }

    pub async fn is_alive(&self) -> bool {
        let inner = self.inner.lock().await;
        if inner.closed {
            return false;
        }
        match &inner.transport {
            ActiveTransport::Live(live) => live.is_alive(),
            ActiveTransport::Replay(replay) => replay.is_alive(),
        }
    }

    /// Drain the transport, persist the tape when recording, and emit the
    /// summary. Returns the exit code when the child (real or replayed)
    /// ended with one.
    pub async fn close(&self, force: bool) -> Result<Option<i32>> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(None);
        }
        inner.closed = true;

        let code = match &mut inner.transport {
            ActiveTransport::Live(live) => live.close(force).await?,
            ActiveTransport::Replay(replay) => replay.close(),
        };

        if let Some(rec) = inner.recorder.take() {
            let taken = rec.lock().expect("recorder poisoned").take_tape();
            if let Some((rel, tape)) = taken {
                let store = inner.store.clone();
                let written =
                    tokio::task::spawn_blocking(move || store.write_tape(&rel, &tape))
                        .await
                        .map_err(|e| {
                            EngineError::Config(format!("writer task failed: {e}"))
                        })?;
                match written {
                    Ok(path) => debug!(tape = %path.display(), "tape written"),
                    Err(e) if inner.cfg.strict_recording => return Err(e),
                    Err(e) => {
                        warn!("tape write failed; session continues without: {e}");
                    },
                }
            }
        }

        if inner.cfg.summary && !inner.cfg.silent {
            naming::print_summary(&inner.store.summary());
        }
        Ok(code)
    }

    /// The store backing this session, mainly for inspection in tests and
    /// tooling.
    pub async fn store(&self) -> Arc<TapeStore> {
        self.inner.lock().await.store.clone()
    }
}

async fn send_impl(inner: &mut Inner, data: &[u8], kind: InputKind) -> Result<usize> {
    if inner.closed {
        return Err(EngineError::SessionClosed);
    }
    let decorated: Vec<u8> = match &inner.cfg.input_decorator {
        Some(d) => d.apply(data),
        None => data.to_vec(),
    };

    // Phase one: drive the current transport. A proxied miss falls through
    // so the swap can happen once the transport borrow has ended.
    let miss = match &mut inner.transport {
        ActiveTransport::Live(live) => {
            if let Some(rec) = &inner.recorder {
                rec.lock().expect("recorder poisoned").on_send(
                    &decorated,
                    kind,
                    &inner.last_prompt,
                    inner.state_hash.clone(),
                )?;
            }
            return live.send(data);
        },
        ActiveTransport::Replay(replay) => {
            match replay.send(&decorated, kind).await {
                Ok(n) => return Ok(n),
                Err(miss @ EngineError::TapeMiss { .. })
                    if inner.cfg.fallback == FallbackMode::Proxy =>
                {
                    replay.close();
                    miss
                },
                Err(other) => return Err(other),
            }
        },
    };

    // Phase two: surrender to a live transport and re-issue the send.
    info!("tape miss; proxying to a live session");
    debug!("miss detail: {miss}");

    let recorder = if inner.cfg.record != RecordMode::Disabled {
        Some(build_recorder(
            &inner.cfg,
            &inner.program_base,
            &inner.spec,
            &inner.env,
            &inner.cwd,
            &inner.identity_key,
            &inner.redactor,
        )?)
    } else {
        None
    };
    let live = LiveTransport::spawn(
        &inner.spec,
        &inner.program_path,
        &inner.env,
        recorder.clone(),
    )?;
    if let Some(rec) = &recorder {
        rec.lock().expect("recorder poisoned").on_send(
            &decorated,
            kind,
            &inner.last_prompt,
            inner.state_hash.clone(),
        )?;
    }
    let n = live.send(data)?;
    inner.recorder = recorder;
    inner.transport = ActiveTransport::Live(live);
    Ok(n)
}

fn build_recorder(
    cfg: &SessionConfig,
    program_base: &str,
    spec: &SpawnSpec,
    env: &BTreeMap<String, String>,
    cwd: &str,
    identity_key: &str,
    redactor: &Arc<Redactor>,
) -> Result<Arc<StdMutex<Recorder>>> {
    let latency = match cfg.latency {
        LatencyPolicy::Fixed(ms) => Some(LatencySpec::Fixed(ms)),
        LatencyPolicy::Uniform(lo, hi) => Some(LatencySpec::Range(lo, hi)),
        LatencyPolicy::Recorded | LatencyPolicy::Custom(_) => None,
    };
    let meta = Meta {
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        program: program_base.to_string(),
        args: spec.args.clone(),
        env: cfg.match_rules().filter_env(env.iter()),
        cwd: cwd.to_string(),
        pty: PtyDims {
            rows: spec.rows,
            cols: spec.cols,
        },
        tag: cfg.tag.clone(),
        latency,
        error_rate: cfg.error_rate,
        seed: cfg.seed,
    };
    let session = SessionInfo {
        recorder: format!("pty-tape-rs {}", env!("CARGO_PKG_VERSION")),
        platform: std::env::consts::OS.to_string(),
    };
    let rel =
        cfg.name_generator
            .tape_path(program_base, cfg.tag.as_deref(), identity_key);
    validate_rel_path(&rel)?;

    Ok(Arc::new(StdMutex::new(Recorder::new(
        meta,
        session,
        rel,
        redactor.clone(),
        cfg.output_decorator.clone(),
        cfg.tape_decorator.clone(),
        cfg.spill_ceiling,
    ))))
}

fn session_env(spec: &SpawnSpec) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    for (key, value) in &spec.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

fn session_cwd(spec: &SpawnSpec) -> String {
    let dir = match &spec.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().unwrap_or_default(),
    };
    std::fs::canonicalize(&dir)
        .unwrap_or(dir)
        .to_string_lossy()
        .into_owned()
}
