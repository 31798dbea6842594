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
async fn test_proxy_runs_live_and_records_second_tape() -> Result<()> {
    let sandbox = Sandbox::new()?;

    // Seed the store with a `hello` recording.
    let cfg = pty_tape_rs::cfg::config::SessionConfig {
        record: RecordMode::New,
        ..sandbox.config()
    };
    let session = Session::start(cfg, sandbox.spec()).await?;
    session.expect(&[prompt_pattern()], Some(5_000)).await?;
    session.send_line("hello").await?;
    session
        .expect(&[ready_pattern("hello")], Some(5_000))
        .await?;
    session.close(false).await?;
    assert_eq!(sandbox.tape_files().len(), 1);

    // Same identity, unseen input, proxy fallback: the replay transport
    // surrenders to a live session and the new exchange is recorded.
    let cfg = pty_tape_rs::cfg::config::SessionConfig {
        record: RecordMode::New,
        fallback: FallbackMode::Proxy,
        ..sandbox.config()
    };
    let session = Session::start(cfg, sandbox.spec()).await?;
    session.expect(&[prompt_pattern()], Some(5_000)).await?;
    session.send_line("world").await?;
    let outcome = session
        .expect(&[ready_pattern("world")], Some(5_000))
        .await?;
    assert!(outcome.matched_text.contains("READY:world"));
    assert!(session.is_alive().await, "proxy swapped in a live child");
    session.close(false).await?;

    let tapes = sandbox.tape_files();
    assert_eq!(tapes.len(), 2, "proxy run persisted a second tape");

    // Exactly one of the tapes holds the single `world` exchange.
    let mut world_tapes = 0;
    for path in &tapes {
        let tape = codec::decode(path, &std::fs::read_to_string(path)?)?;
        if tape.exchanges[0].input.text.as_deref() == Some("world") {
            world_tapes += 1;
            assert_eq!(tape.exchanges.len(), 1);
        }
    }
    assert_eq!(world_tapes, 1);
    Ok(())
}

#[tokio::test]
async fn test_proxy_without_tape_goes_live_without_recording() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let cfg = pty_tape_rs::cfg::config::SessionConfig {
        record: RecordMode::Disabled,
        fallback: FallbackMode::Proxy,
        ..sandbox.config()
    };
    let session = Session::start(cfg, sandbox.spec()).await?;
    session.expect(&[prompt_pattern()], Some(5_000)).await?;
    session.send_line("ad-hoc").await?;
    session
        .expect(&[ready_pattern("ad-hoc")], Some(5_000))
        .await?;
    session.close(false).await?;
    assert!(sandbox.tape_files().is_empty(), "record=disabled writes nothing");
    Ok(())
}
