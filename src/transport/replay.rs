// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Replay transport: serves `send`/`expect` from a tape.
//!
//! Each hit starts a pacer task that streams the recorded chunks into the
//! output buffer under the latency policy. The caller cannot tell the
//! difference from a live session except through side channels (pid,
//! timing with latency overrides).

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use rand::{RngExt, SeedableRng, rngs::StdRng};
use regex::bytes::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::{
        config::{LatencyPolicy, SessionConfig},
        enums::InputKind,
    },
    errors::{EngineError, Result},
    matcher::{MatchContext, MatchRules},
    tape::{
        model::{ExitInfo, LatencySpec},
        store::TapeStore,
    },
    transport::common::{ExpectOutcome, InjectedFault, OutputBuffer},
};

const NEAREST_KEYS: usize = 5;

#[derive(Debug, Clone, Copy)]
enum Injection {
    Timeout { prefix: usize },
    Exit { code: i32 },
}

pub struct ReplayTransport {
    store: Arc<TapeStore>,
    rules: MatchRules,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: String,
    latency: LatencyPolicy,
    error_rate: u8,
    buf: Arc<OutputBuffer>,
    rng: Option<StdRng>,
    cancel: CancellationToken,
    pacer: Option<JoinHandle<()>>,
    last_prompt: String,
    state_hash: Option<String>,
    closed: bool,
}

impl ReplayTransport {
    pub fn new(
        store: Arc<TapeStore>,
        cfg: &SessionConfig,
        program: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: String,
    ) -> Self {
        Self {
            store,
            rules: cfg.match_rules(),
            program,
            args,
            env,
            cwd,
            latency: cfg.latency.clone(),
            error_rate: cfg.error_rate,
            buf: Arc::new(OutputBuffer::new()),
            rng: None,
            cancel: CancellationToken::new(),
            pacer: None,
            last_prompt: String::new(),
            state_hash: None,
            closed: false,
        }
    }

    pub fn buffer(&self) -> Arc<OutputBuffer> {
        self.buf.clone()
    }

    pub fn last_prompt(&self) -> &str {
        &self.last_prompt
    }

    pub fn set_state_hash(&mut self, state_hash: Option<String>) {
        self.state_hash = state_hash;
    }

    /// Seed the buffer with the recorded greeting so callers that expect a
    /// prompt before their first send keep working.
    pub fn seed_prompt(&self, prompt: &str) {
        if !prompt.is_empty() {
            self.buf.push(prompt.as_bytes());
        }
    }

    /// Look the input up and start pacing its recorded output. Returns the
    /// number of input bytes accepted, exactly like the live transport.
    pub async fn send(&mut self, data: &[u8], kind: InputKind) -> Result<usize> {
        if self.closed {
            return Err(EngineError::SessionClosed);
        }
        // Let the previous exchange finish streaming; its remaining bytes
        // precede ours in recorded order.
        if let Some(pacer) = self.pacer.take() {
            let _ = pacer.await;
        }

        let ctx = MatchContext::build(
            &self.rules,
            &self.program,
            &self.args,
            &self.env,
            &self.cwd,
            &self.last_prompt,
            data,
            kind,
            self.state_hash.clone(),
        );
        let key = ctx.key();

        let Some((tape, ordinal, path)) = self.store.lookup(&key) else {
            return Err(EngineError::TapeMiss {
                key,
                program: self.program.clone(),
                cwd: self.cwd.clone(),
                nearest: self.store.nearest_inputs(&ctx.input, NEAREST_KEYS),
            });
        };
        debug!(
            tape = %path.display(),
            exchange = ordinal,
            "replaying exchange"
        );

        let exchange = tape.exchanges[ordinal].clone();
        let rng = self
            .rng
            .get_or_insert_with(|| StdRng::seed_from_u64(tape.meta.seed));

        let error_rate = if self.error_rate > 0 {
            self.error_rate
        } else {
            tape.meta.error_rate
        };
        let latency = if matches!(self.latency, LatencyPolicy::Recorded) {
            match tape.meta.latency {
                Some(LatencySpec::Fixed(ms)) => LatencyPolicy::Fixed(ms),
                Some(LatencySpec::Range(lo, hi)) => LatencyPolicy::Uniform(lo, hi),
                None => LatencyPolicy::Recorded,
            }
        } else {
            self.latency.clone()
        };

        let chunks: Vec<Vec<u8>> = exchange
            .output
            .chunks
            .iter()
            .map(|c| c.data().unwrap_or_default())
            .collect();
        let delays: Vec<u64> = exchange
            .output
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| match &latency {
                LatencyPolicy::Recorded => c.delay_ms,
                LatencyPolicy::Fixed(ms) => *ms,
                LatencyPolicy::Uniform(lo, hi) => rng.random_range(*lo..=*hi),
                LatencyPolicy::Custom(f) => f.delay_ms(i, c.delay_ms),
            })
            .collect();

        let injection = if error_rate > 0 && rng.random_range(0..100u32) < error_rate as u32 {
            if rng.random_range(0..2u32) == 0 {
                Some(Injection::Timeout {
                    prefix: rng.random_range(0..=chunks.len()),
                })
            } else {
                Some(Injection::Exit { code: 1 })
            }
        } else {
            None
        };
        if let Some(injection) = injection {
            debug!(?injection, "fault injected for this exchange");
        }

        let buf = self.buf.clone();
        let cancel = self.cancel.child_token();
        let exit = exchange.exit.clone();
        self.pacer = Some(tokio::spawn(async move {
            let limit = match injection {
                Some(Injection::Timeout { prefix }) => prefix,
                _ => chunks.len(),
            };
            for (data, delay) in chunks.into_iter().zip(delays).take(limit) {
                if delay > 0 {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {},
                    }
                }
                if cancel.is_cancelled() {
                    return;
                }
                buf.push(&data);
            }
            match injection {
                Some(Injection::Timeout { prefix }) => {
                    buf.set_injected(InjectedFault::Timeout {
                        streamed_chunks: prefix,
                    });
                },
                Some(Injection::Exit { code }) => {
                    buf.close(
                        Some(ExitInfo { code, signal: None }),
                        Some(InjectedFault::Exit),
                    );
                },
                None => {
                    if let Some(exit) = exit {
                        buf.close(Some(exit), None);
                    }
                },
            }
        }));

        Ok(data.len())
    }

    pub async fn expect(
        &mut self,
        patterns: &[Regex],
        timeout: Duration,
    ) -> Result<ExpectOutcome> {
        if self.closed {
            return Err(EngineError::SessionClosed);
        }
        let (outcome, _) = self.buf.expect(patterns, timeout).await?;
        self.last_prompt = outcome.matched_text.clone();
        Ok(outcome)
    }

    pub fn is_alive(&self) -> bool {
        !self.closed && !self.buf.is_eof()
    }

    /// Stop the pacer and release buffers. Returns the recorded exit code
    /// when the replayed session ended with one.
    pub fn close(&mut self) -> Option<i32> {
        self.closed = true;
        self.cancel.cancel();
        if let Some(pacer) = self.pacer.take() {
            pacer.abort();
        }
        self.buf.recorded_exit().map(|e| e.code)
    }
}
