// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Live transport: a child process on a PTY.
//!
//! A dedicated thread owns the blocking PTY read loop and forwards chunks
//! over a bounded channel; an async pump fans them into the recorder tap
//! and the output buffer `expect` consumes from. Cancellation is channel
//! close.

use std::{
    collections::BTreeMap,
    io::{Read, Write},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use regex::bytes::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::SpawnSpec,
    errors::{EngineError, Result},
    tape::model::ExitInfo,
    transport::{
        common::{ExpectOutcome, OutputBuffer, RawChunk},
        recorder::Recorder,
    },
};

const READ_BUF: usize = 8 * 1024;
const CHUNK_CHANNEL: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

pub struct LiveTransport {
    buf: Arc<OutputBuffer>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    // The PTY closes when the master drops; hold it for the session.
    _master: Box<dyn MasterPty + Send>,
    cancel: CancellationToken,
}

impl LiveTransport {
    /// Open a PTY, spawn the program into it and start the reader thread
    /// plus pump task. `recorder`, when present, taps every chunk before it
    /// reaches the output buffer.
    pub fn spawn(
        spec: &SpawnSpec,
        program_path: &std::path::Path,
        env: &BTreeMap<String, String>,
        recorder: Option<Arc<Mutex<Recorder>>>,
    ) -> Result<Self> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_error(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(program_path);
        cmd.args(&spec.args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_error(format!("spawn {program_path:?} failed: {e}")))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_error(format!("pty reader unavailable: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_error(format!("pty writer unavailable: {e}")))?;

        let buf = Arc::new(OutputBuffer::new());
        let cancel = CancellationToken::new();

        let (tx, mut rx) = mpsc::channel::<RawChunk>(CHUNK_CHANNEL);

        // Reader thread: blocking PTY reads, nothing else.
        {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                let mut tmp = [0u8; READ_BUF];
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match reader.read(&mut tmp) {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = RawChunk {
                                at: Instant::now(),
                                bytes: Bytes::copy_from_slice(&tmp[..n]),
                            };
                            if tx.blocking_send(chunk).is_err() {
                                break;
                            }
                        },
                        Err(e) => {
                            debug!("pty reader finished: {e}");
                            break;
                        },
                    }
                }
            });
        }

        // Pump: recorder tap first so the sink is never behind the buffer
        // offsets `expect` reports.
        {
            let buf = buf.clone();
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    if let Some(rec) = &recorder {
                        match rec.lock() {
                            Ok(mut rec) => rec.on_chunk(chunk.clone()),
                            Err(_) => warn!("recorder poisoned; chunk dropped"),
                        }
                    }
                    buf.push(&chunk.bytes);
                }
                buf.close(None, None);
            });
        }

        Ok(Self {
            buf,
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(child),
            _master: pair.master,
            cancel,
        })
    }

    pub fn buffer(&self) -> Arc<OutputBuffer> {
        self.buf.clone()
    }

    /// Write input to the PTY. Returns the number of bytes accepted.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let mut guard = self.writer.lock().expect("pty writer poisoned");
        let writer = guard.as_mut().ok_or(EngineError::SessionClosed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(data.len())
    }

    /// Wait for a pattern over the output buffer. A process that ends
    /// without matching reports its exit status.
    pub async fn expect(
        &self,
        patterns: &[Regex],
        timeout: Duration,
    ) -> Result<(ExpectOutcome, u64)> {
        match self.buf.expect(patterns, timeout).await {
            Err(EngineError::Process { tail, .. }) => {
                let exit = self.try_exit_status();
                Err(EngineError::Process {
                    code: exit.as_ref().map(|e| e.code),
                    signal: exit.and_then(|e| e.signal),
                    tail,
                })
            },
            other => other,
        }
    }

    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock().expect("child poisoned");
        matches!(child.try_wait(), Ok(None))
    }

    fn try_exit_status(&self) -> Option<ExitInfo> {
        let mut child = self.child.lock().expect("child poisoned");
        match child.try_wait() {
            Ok(Some(status)) => Some(ExitInfo {
                code: status.exit_code() as i32,
                signal: None,
            }),
            _ => None,
        }
    }

    /// Close stdin (or kill with `force`), wait briefly for the child and
    /// tear the reader down. Returns the exit code when the child ended.
    pub async fn close(&self, force: bool) -> Result<Option<i32>> {
        {
            let mut guard = self.writer.lock().expect("pty writer poisoned");
            if let Some(writer) = guard.as_mut() {
                // EOT: the master side stays open, so line-disciplined
                // children only see EOF through a ^D at line start.
                let _ = writer.write_all(&[0x04]);
                let _ = writer.flush();
            }
            guard.take();
        }
        if force {
            let mut child = self.child.lock().expect("child poisoned");
            let _ = child.kill();
        }

        let deadline = Instant::now() + CLOSE_GRACE;
        let code = loop {
            {
                let mut child = self.child.lock().expect("child poisoned");
                match child.try_wait() {
                    Ok(Some(status)) => break Some(status.exit_code() as i32),
                    Ok(None) => {},
                    Err(e) => {
                        debug!("child wait failed: {e}");
                        break None;
                    },
                }
            }
            if Instant::now() >= deadline {
                let mut child = self.child.lock().expect("child poisoned");
                let _ = child.kill();
                break None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        self.cancel.cancel();
        Ok(code)
    }
}

fn spawn_error(message: String) -> EngineError {
    EngineError::Process {
        code: None,
        signal: None,
        tail: message,
    }
}
