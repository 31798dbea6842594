// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use pty_tape_rs::{
    cfg::enums::{FallbackMode, RecordMode},
    tape::codec,
    transport::session::Session,
};

use crate::integration_tests::common::{Sandbox, prompt_pattern, ready_pattern};

#[tokio::test]
async fn test_record_then_replay_is_byte_identical() -> Result<()> {
    let sandbox = Sandbox::new()?;

    // Pass 1: live, recording.
    let cfg = pty_tape_rs::cfg::config::SessionConfig {
        record: RecordMode::New,
        fallback: FallbackMode::NotFound,
        ..sandbox.config()
    };
    let session = Session::start(cfg, sandbox.spec()).await?;
    session
        .expect(&[prompt_pattern()], Some(5_000))
        .await?;
    session.send_line("hello").await?;
    let live = session
        .expect(&[ready_pattern("hello")], Some(5_000))
        .await?;
    assert!(session.is_alive().await);
    session.close(false).await?;

    let tapes = sandbox.tape_files();
    assert_eq!(tapes.len(), 1, "one tape after recording");
    let tape = codec::decode(&tapes[0], &std::fs::read_to_string(&tapes[0])?)?;
    assert_eq!(tape.exchanges.len(), 1);
    let recorded_output = tape.exchanges[0].concat_output();

    // Pass 2: replay only; the real program must not run.
    let cfg = pty_tape_rs::cfg::config::SessionConfig {
        record: RecordMode::Disabled,
        fallback: FallbackMode::NotFound,
        ..sandbox.config()
    };
    let session = Session::start(cfg, sandbox.spec()).await?;
    session
        .expect(&[prompt_pattern()], Some(5_000))
        .await?;
    session.send_line("hello").await?;

    // Anchor on the entire recorded output: replay must reproduce it
    // byte for byte, in order.
    let full = crate::integration_tests::common::pattern(&regex::escape(
        &String::from_utf8(recorded_output.clone())?,
    ));
    let replayed = session.expect(&[full], Some(5_000)).await?;
    assert_eq!(replayed.matched_text.as_bytes(), recorded_output.as_slice());
    session.close(false).await?;

    // No second tape appeared and the echoed response matches the live run.
    assert_eq!(sandbox.tape_files().len(), 1);
    assert!(live.matched_text.contains("READY:hello"));
    Ok(())
}

#[tokio::test]
async fn test_multi_exchange_session_replays_in_order() -> Result<()> {
    let sandbox = Sandbox::new()?;

    let cfg = pty_tape_rs::cfg::config::SessionConfig {
        record: RecordMode::New,
        ..sandbox.config()
    };
    let session = Session::start(cfg, sandbox.spec()).await?;
    session.expect(&[prompt_pattern()], Some(5_000)).await?;
    for input in ["one", "two", "three"] {
        session.send_line(input).await?;
        session
            .expect(&[ready_pattern(input)], Some(5_000))
            .await?;
    }
    session.close(false).await?;

    let tapes = sandbox.tape_files();
    let tape = codec::decode(&tapes[0], &std::fs::read_to_string(&tapes[0])?)?;
    assert_eq!(tape.exchanges.len(), 3);

    // Replay the same script; `record=new` sees the tape and serves it.
    let cfg = pty_tape_rs::cfg::config::SessionConfig {
        record: RecordMode::New,
        ..sandbox.config()
    };
    let session = Session::start(cfg, sandbox.spec()).await?;
    session.expect(&[prompt_pattern()], Some(5_000)).await?;
    for input in ["one", "two", "three"] {
        session.send_line(input).await?;
        let outcome = session
            .expect(&[ready_pattern(input)], Some(5_000))
            .await?;
        assert!(outcome.matched_text.contains(&format!("READY:{input}")));
    }
    session.close(false).await?;
    assert_eq!(sandbox.tape_files().len(), 1, "replay writes nothing");
    Ok(())
}
