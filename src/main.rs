// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fs;

use anyhow::{Context, Result};
use pty_tape_rs::{
    cfg::{
        config::{SessionConfig, SpawnSpec},
        enums::{FallbackMode, RecordMode},
        logger::{LogConfig, init_logger},
    },
    transport::session::Session,
};
use regex::bytes::Regex;
use tracing::info;

const DEMO_PROGRAM: &str = r#"#!/bin/sh
printf '> '
while IFS= read -r line; do
  printf 'READY:%s\n> ' "$line"
done
"#;

/// Smoke driver: record one scripted round into a temp tape root, then
/// replay it without launching the program again.
#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logger(&LogConfig::default())?;

    let dir = tempfile::tempdir().context("failed to create demo dir")?;
    let script = dir.path().join("echo-prompt");
    fs::write(&script, DEMO_PROGRAM)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&script)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms)?;
    }

    let cfg = SessionConfig {
        record: RecordMode::New,
        fallback: FallbackMode::NotFound,
        allow_env: vec!["TERM".to_string()],
        ..SessionConfig::new(dir.path().join("tapes"))
    };
    let spec =
        || SpawnSpec::new(script.to_string_lossy()).env("TERM", "dumb");
    let prompt = Regex::new(r"> ")?;
    let ready = Regex::new(r"READY:hello\r?\n> ")?;

    // Pass 1: live, recording.
    let session = Session::start(cfg.clone(), spec()).await?;
    session.expect(std::slice::from_ref(&prompt), Some(5_000)).await?;
    session.send_line("hello").await?;
    let live = session.expect(std::slice::from_ref(&ready), Some(5_000)).await?;
    info!(matched = %live.matched_text, "live round complete");
    session.close(false).await?;

    // Pass 2: same identity; `record=new` finds the tape and replays it.
    let session = Session::start(cfg, spec()).await?;
    session.expect(std::slice::from_ref(&prompt), Some(5_000)).await?;
    session.send_line("hello").await?;
    let replayed = session.expect(std::slice::from_ref(&ready), Some(5_000)).await?;
    info!(matched = %replayed.matched_text, "replayed round complete");
    session.close(false).await?;

    Ok(())
}
