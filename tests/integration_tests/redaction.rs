// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, os::unix::fs::PermissionsExt};

use anyhow::Result;
use pty_tape_rs::{
    cfg::enums::RecordMode, redact::Redactor, tape::codec,
    transport::session::Session,
};

use crate::integration_tests::common::{Sandbox, pattern, prompt_pattern};

const LEAKY_PROGRAM: &str = r#"#!/bin/sh
printf '> '
while IFS= read -r line; do
  printf 'token=abcdef1234567890abcdef1234567890\n> '
done
"#;

#[tokio::test]
async fn test_secrets_never_reach_disk() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let leaky = sandbox.dir.path().join("leaky");
    fs::write(&leaky, LEAKY_PROGRAM)?;
    let mut perms = fs::metadata(&leaky)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&leaky, perms)?;

    let cfg = pty_tape_rs::cfg::config::SessionConfig {
        record: RecordMode::New,
        ..sandbox.config()
    };
    let spec = pty_tape_rs::cfg::config::SpawnSpec::new(leaky.to_string_lossy())
        .env("TERM", "dumb");

    let session = Session::start(cfg, spec).await?;
    session.expect(&[prompt_pattern()], Some(5_000)).await?;
    session.send_line("show").await?;
    // The live session still sees the real secret; only persistence is
    // redacted.
    let outcome = session
        .expect(&[pattern(r"token=\S+\r?\n> ")], Some(5_000))
        .await?;
    assert!(outcome.matched_text.contains("abcdef1234567890"));
    session.close(false).await?;

    let tapes = sandbox.tape_files();
    assert_eq!(tapes.len(), 1);
    let text = fs::read_to_string(&tapes[0])?;
    let tape = codec::decode(&tapes[0], &text)?;
    let persisted = tape.exchanges[0].concat_output();
    let persisted_text = String::from_utf8_lossy(&persisted);
    assert!(
        persisted_text.contains("token=<REDACTED:TOKEN>"),
        "persisted bytes must be masked, got {persisted_text}"
    );
    assert!(!persisted_text.contains("abcdef1234567890"));

    // The validation scan agrees the tape is clean.
    let redactor = Redactor::new(&[])?;
    assert!(redactor.scan(&persisted).is_empty());
    Ok(())
}
