// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared plumbing between the live and replay transports: the output
//! buffer `expect` consumes from, and the expect loop itself.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use bytes::Bytes;
use regex::bytes::Regex;
use tokio::sync::Notify;

use crate::{
    errors::{EngineError, Result},
    tape::model::ExitInfo,
    utils::tail_lines,
};

/// Lines of buffer tail attached to timeout and process-exit diagnostics.
pub const DIAGNOSTIC_TAIL_LINES: usize = 50;

/// One contiguous PTY read with its monotonic arrival time.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub at: Instant,
    pub bytes: Bytes,
}

/// Result of a successful `expect`.
#[derive(Debug, Clone)]
pub struct ExpectOutcome {
    /// Index of the first pattern (in argument order) that matched.
    pub index: usize,
    pub matched_text: String,
    /// Unconsumed buffer text after the match, for diagnostics.
    pub tail: String,
}

/// Fault planted by the replay pacer's error injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    Timeout { streamed_chunks: usize },
    Exit,
}

#[derive(Default)]
struct BufState {
    data: Vec<u8>,
    /// Absolute offset of `data[0]` within everything ever pushed.
    consumed: u64,
    eof: bool,
    injected: Option<InjectedFault>,
    exit: Option<ExitInfo>,
}

/// Byte buffer between the producer (PTY pump or replay pacer) and
/// `expect`. A single mutex guards the bytes; a `Notify` wakes waiters on
/// every push and on close.
#[derive(Default)]
pub struct OutputBuffer {
    state: Mutex<BufState>,
    notify: Notify,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, bytes: &[u8]) {
        {
            let mut st = self.state.lock().expect("output buffer poisoned");
            st.data.extend_from_slice(bytes);
        }
        self.notify.notify_waiters();
    }

    /// Producer is done: either the PTY hit EOF or the replay exchange
    /// carried an exit record.
    pub fn close(&self, exit: Option<ExitInfo>, injected: Option<InjectedFault>) {
        {
            let mut st = self.state.lock().expect("output buffer poisoned");
            st.eof = true;
            if st.exit.is_none() {
                st.exit = exit;
            }
            if injected.is_some() {
                st.injected = injected;
            }
        }
        self.notify.notify_waiters();
    }

    /// Plant an injected-timeout fault without closing the stream.
    pub fn set_injected(&self, fault: InjectedFault) {
        {
            let mut st = self.state.lock().expect("output buffer poisoned");
            st.injected = Some(fault);
        }
        self.notify.notify_waiters();
    }

    pub fn recorded_exit(&self) -> Option<ExitInfo> {
        self.state
            .lock()
            .expect("output buffer poisoned")
            .exit
            .clone()
    }

    pub fn is_eof(&self) -> bool {
        self.state.lock().expect("output buffer poisoned").eof
    }

    /// Wait until one of `patterns` matches the accumulated bytes. On a
    /// match the buffer is consumed through the match end and the absolute
    /// end offset is returned alongside the outcome; bytes past the match
    /// stay buffered. On timeout the buffer is left untouched.
    pub async fn expect(
        &self,
        patterns: &[Regex],
        timeout: Duration,
    ) -> Result<(ExpectOutcome, u64)> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();

            match self.try_match(patterns) {
                Step::Matched(outcome, abs_end) => return Ok((outcome, abs_end)),
                Step::Failed(err) => return Err(err),
                Step::Pending => {},
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // One last look: bytes may have landed right at the wire.
                return match self.try_match(patterns) {
                    Step::Matched(outcome, abs_end) => Ok((outcome, abs_end)),
                    Step::Failed(err) => Err(err),
                    Step::Pending => Err(EngineError::Timeout {
                        waited_ms: started.elapsed().as_millis() as u64,
                        tail: self.diagnostic_tail(),
                    }),
                };
            }
        }
    }

    fn try_match(&self, patterns: &[Regex]) -> Step {
        let mut st = self.state.lock().expect("output buffer poisoned");

        for (index, pattern) in patterns.iter().enumerate() {
            if let Some(m) = pattern.find(&st.data) {
                let matched_text =
                    String::from_utf8_lossy(&st.data[m.start()..m.end()]).into_owned();
                let end = m.end();
                let rest: Vec<u8> = st.data.split_off(end);
                let tail = tail_lines(
                    &String::from_utf8_lossy(&rest),
                    DIAGNOSTIC_TAIL_LINES,
                );
                st.data = rest;
                st.consumed += end as u64;
                return Step::Matched(
                    ExpectOutcome {
                        index,
                        matched_text,
                        tail,
                    },
                    st.consumed,
                );
            }
        }

        if let Some(InjectedFault::Timeout { streamed_chunks }) = st.injected {
            return Step::Failed(EngineError::SimulatedTimeout {
                streamed_chunks,
                tail: tail_of(&st.data),
            });
        }
        if st.eof {
            if matches!(st.injected, Some(InjectedFault::Exit)) {
                let code = st.exit.as_ref().map(|e| e.code).unwrap_or(1);
                return Step::Failed(EngineError::SimulatedExit { code });
            }
            return Step::Failed(EngineError::Process {
                code: st.exit.as_ref().map(|e| e.code),
                signal: st.exit.as_ref().and_then(|e| e.signal.clone()),
                tail: tail_of(&st.data),
            });
        }
        Step::Pending
    }

    fn diagnostic_tail(&self) -> String {
        let st = self.state.lock().expect("output buffer poisoned");
        tail_of(&st.data)
    }
}

enum Step {
    Matched(ExpectOutcome, u64),
    Failed(EngineError),
    Pending,
}

fn tail_of(data: &[u8]) -> String {
    tail_lines(&String::from_utf8_lossy(data), DIAGNOSTIC_TAIL_LINES)
}
