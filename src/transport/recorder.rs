// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Exchange-boundary state machine around the chunk sink.
//!
//! ```text
//! idle --on_send--> capturing --on_exchange_end--> (flush) --> idle
//!                              `-on_process_exit-> terminal
//! ```
//!
//! Flushing computes the first-chunk delay relative to send completion and
//! intermediate delays relative to the previous chunk, runs the output
//! decorator and the redactor, and appends the exchange to the in-memory
//! tape. The tape decorator runs once at finalization.

use std::{path::PathBuf, sync::Arc, time::Instant};

use serde_json::Value;
use tracing::debug;

use crate::{
    cfg::{
        config::{Decorator, TapeDecorator},
        enums::InputKind,
    },
    errors::{EngineError, Result},
    redact::Redactor,
    tape::model::{
        Chunk, Exchange, ExitInfo, Input, Meta, Output, PreState, SessionInfo, Tape,
    },
    transport::{common::RawChunk, sink::ChunkSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecorderState {
    Idle,
    Capturing,
    Terminal,
}

struct OpenExchange {
    input: Input,
    pre: PreState,
    send_at: Instant,
}

pub struct Recorder {
    state: RecorderState,
    sink: ChunkSink,
    tape: Tape,
    rel_path: PathBuf,
    redactor: Arc<Redactor>,
    output_decorator: Option<Arc<dyn Decorator>>,
    tape_decorator: Option<Arc<dyn TapeDecorator>>,
    open: Option<OpenExchange>,
    taken: bool,
}

impl Recorder {
    pub fn new(
        meta: Meta,
        session: SessionInfo,
        rel_path: PathBuf,
        redactor: Arc<Redactor>,
        output_decorator: Option<Arc<dyn Decorator>>,
        tape_decorator: Option<Arc<dyn TapeDecorator>>,
        spill_ceiling: usize,
    ) -> Self {
        Self {
            state: RecorderState::Idle,
            sink: ChunkSink::new(spill_ceiling),
            tape: Tape {
                schema_version: crate::tape::model::SCHEMA_VERSION,
                meta,
                session,
                exchanges: Vec::new(),
                extra: serde_json::Map::new(),
            },
            rel_path,
            redactor,
            output_decorator,
            tape_decorator,
            open: None,
            taken: false,
        }
    }

    /// Sink tap for the PTY pump. Accepted in every state; bytes that never
    /// land inside an exchange are discarded at the next send boundary.
    pub fn on_chunk(&mut self, chunk: RawChunk) {
        if self.state == RecorderState::Terminal {
            return;
        }
        if let Err(e) = self.sink.push(chunk) {
            debug!("chunk sink spill failed, dropping chunk: {e}");
        }
    }

    /// Open a new exchange. The previous one must have been closed by an
    /// `expect`; a bare second send is a caller bug.
    pub fn on_send(
        &mut self,
        data: &[u8],
        kind: InputKind,
        pre_prompt: &str,
        state_hash: Option<String>,
    ) -> Result<()> {
        match self.state {
            RecorderState::Terminal => Err(EngineError::SessionClosed),
            RecorderState::Capturing => Err(EngineError::RecorderReentrancy),
            RecorderState::Idle => {
                self.sink.discard_until(self.sink.end_offset())?;
                self.open = Some(OpenExchange {
                    input: Input::from_bytes(kind, data),
                    pre: PreState {
                        prompt: pre_prompt.to_string(),
                        state_hash,
                    },
                    send_at: Instant::now(),
                });
                self.state = RecorderState::Capturing;
                Ok(())
            },
        }
    }

    /// Close the open exchange at the byte where `expect` matched. Bytes
    /// past the boundary stay in the sink and open the next exchange's
    /// output.
    pub fn on_exchange_end(
        &mut self,
        until_abs: u64,
        annotations: Option<serde_json::Map<String, Value>>,
    ) -> Result<()> {
        if self.state != RecorderState::Capturing {
            return Ok(());
        }
        self.flush(Some(until_abs), None, annotations)
    }

    /// `expect` timed out: the exchange still closes, with everything
    /// captured so far and a timeout annotation.
    pub fn on_timeout(&mut self) -> Result<()> {
        if self.state != RecorderState::Capturing {
            return Ok(());
        }
        let mut annotations = serde_json::Map::new();
        annotations.insert("timeout".to_string(), Value::Bool(true));
        self.flush(None, None, Some(annotations))
    }

    /// The child ended. Recorded on the current exchange when one is open,
    /// otherwise on the last one; afterwards the recorder only accepts
    /// finalization.
    pub fn on_process_exit(&mut self, exit: ExitInfo) {
        if self.state == RecorderState::Capturing {
            let _ = self.flush(None, Some(exit), None);
        } else if let Some(last) = self.tape.exchanges.last_mut()
            && last.exit.is_none()
        {
            last.exit = Some(exit);
        }
        self.state = RecorderState::Terminal;
    }

    fn flush(
        &mut self,
        until_abs: Option<u64>,
        exit: Option<ExitInfo>,
        annotations: Option<serde_json::Map<String, Value>>,
    ) -> Result<()> {
        let open = self.open.take().ok_or(EngineError::SessionClosed)?;
        let raw = match until_abs {
            Some(abs) => self.sink.freeze_until(abs)?,
            None => self.sink.freeze_all()?,
        };

        let mut chunks = Vec::with_capacity(raw.len());
        let mut prev_at = open.send_at;
        for (at, bytes) in raw {
            let delay_ms = at.saturating_duration_since(prev_at).as_millis() as u64;
            prev_at = at;
            let decorated = match &self.output_decorator {
                Some(d) => d.apply(&bytes),
                None => bytes.to_vec(),
            };
            let clean = self.redactor.redact(&decorated);
            chunks.push(Chunk::from_bytes(delay_ms, &clean));
        }

        let dur_ms = open.send_at.elapsed().as_millis() as u64;
        debug!(
            chunks = chunks.len(),
            dur_ms, "exchange closed"
        );
        self.tape.exchanges.push(Exchange {
            pre: open.pre,
            input: open.input,
            output: Output { chunks },
            exit,
            dur_ms,
            annotations,
        });
        self.state = RecorderState::Idle;
        Ok(())
    }

    /// Promote the builder to a finished tape. Returns `None` when nothing
    /// was captured (no file gets written) or when already taken.
    pub fn take_tape(&mut self) -> Option<(PathBuf, Tape)> {
        if self.taken || self.tape.exchanges.is_empty() {
            return None;
        }
        self.taken = true;
        let mut tape = self.tape.clone();
        if let Some(decorator) = &self.tape_decorator {
            decorator.apply(&mut tape);
        }
        Some((self.rel_path.clone(), tape))
    }
}
