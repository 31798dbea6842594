// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::BTreeMap, fs, sync::Arc, time::Instant};

use anyhow::Result;
use pty_tape_rs::{
    cfg::{
        config::{LatencyPolicy, SessionConfig},
        enums::{InputKind, RecordMode},
    },
    errors::EngineError,
    tape::{
        codec,
        model::{
            Chunk, Exchange, ExitInfo, Input, LatencySpec, Meta, Output, PreState,
            PtyDims, SCHEMA_VERSION, SessionInfo, Tape,
        },
        store::TapeStore,
    },
    transport::replay::ReplayTransport,
};
use regex::bytes::Regex;

fn tape(seed: u64, error_rate: u8, delays: &[u64]) -> Tape {
    Tape {
        schema_version: SCHEMA_VERSION,
        meta: Meta {
            created_at: "2024-01-01T00:00:00Z".to_string(),
            program: "fake".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: "/work".to_string(),
            pty: PtyDims { rows: 24, cols: 80 },
            tag: None,
            latency: None,
            error_rate,
            seed,
        },
        session: SessionInfo {
            recorder: "test".to_string(),
            platform: "linux".to_string(),
        },
        exchanges: vec![Exchange {
            pre: PreState {
                prompt: String::new(),
                state_hash: None,
            },
            input: Input::from_bytes(InputKind::Line, b"ping\n"),
            output: Output {
                chunks: delays
                    .iter()
                    .enumerate()
                    .map(|(i, d)| Chunk::from_bytes(*d, format!("part{i};").as_bytes()))
                    .collect(),
            },
            exit: None,
            dur_ms: delays.iter().sum(),
            annotations: None,
        }],
        extra: serde_json::Map::new(),
    }
}

fn store_with(tape: &Tape) -> Result<(tempfile::TempDir, Arc<TapeStore>)> {
    let root = tempfile::tempdir()?;
    fs::write(root.path().join("t.json5"), codec::encode(tape)?)?;
    let store = TapeStore::load(root.path(), Default::default());
    Ok((root, store))
}

fn replay_for(store: Arc<TapeStore>, cfg: &SessionConfig) -> ReplayTransport {
    ReplayTransport::new(
        store,
        cfg,
        "fake".to_string(),
        vec![],
        BTreeMap::new(),
        "/work".to_string(),
    )
}

fn cfg_with(latency: LatencyPolicy, error_rate: u8) -> SessionConfig {
    SessionConfig {
        record: RecordMode::Disabled,
        latency,
        error_rate,
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn test_replay_serves_recorded_bytes_in_order() -> Result<()> {
    let (_root, store) = store_with(&tape(0, 0, &[0, 0, 0]))?;
    let mut replay = replay_for(store, &cfg_with(LatencyPolicy::Fixed(0), 0));

    let n = replay.send(b"ping\n", InputKind::Line).await?;
    assert_eq!(n, 5);

    let pats = [Regex::new(r"part0;part1;part2;")?];
    let outcome = replay
        .expect(&pats, std::time::Duration::from_secs(2))
        .await?;
    assert_eq!(outcome.matched_text, "part0;part1;part2;");
    Ok(())
}

#[tokio::test]
async fn test_latency_zero_paces_flat_out() -> Result<()> {
    let (_root, store) = store_with(&tape(0, 0, &[0, 50, 50]))?;
    let mut replay = replay_for(store, &cfg_with(LatencyPolicy::Fixed(0), 0));

    let started = Instant::now();
    replay.send(b"ping\n", InputKind::Line).await?;
    let pats = [Regex::new(r"part2;")?];
    replay.expect(&pats, std::time::Duration::from_secs(2)).await?;
    assert!(
        started.elapsed().as_millis() < 60,
        "flat-out replay must ignore recorded delays, took {:?}",
        started.elapsed()
    );
    Ok(())
}

#[tokio::test]
async fn test_latency_override_replaces_recorded_delays() -> Result<()> {
    let (_root, store) = store_with(&tape(0, 0, &[0, 50, 50]))?;
    let mut replay = replay_for(store, &cfg_with(LatencyPolicy::Fixed(100), 0));

    let started = Instant::now();
    replay.send(b"ping\n", InputKind::Line).await?;
    let pats = [Regex::new(r"part2;")?];
    replay
        .expect(&pats, std::time::Duration::from_secs(5))
        .await?;
    let elapsed = started.elapsed().as_millis();
    assert!(
        (250..=600).contains(&elapsed),
        "three chunks at 100 ms each, took {elapsed} ms"
    );
    Ok(())
}

#[tokio::test]
async fn test_recorded_delays_used_when_no_override() -> Result<()> {
    let (_root, store) = store_with(&tape(0, 0, &[0, 40, 40]))?;
    let mut replay = replay_for(store, &cfg_with(LatencyPolicy::Recorded, 0));

    let started = Instant::now();
    replay.send(b"ping\n", InputKind::Line).await?;
    let pats = [Regex::new(r"part2;")?];
    replay
        .expect(&pats, std::time::Duration::from_secs(5))
        .await?;
    let elapsed = started.elapsed().as_millis();
    assert!(elapsed >= 70, "recorded delays must pace, took {elapsed} ms");
    Ok(())
}

#[tokio::test]
async fn test_tape_miss_lists_nearest_inputs() -> Result<()> {
    let (_root, store) = store_with(&tape(0, 0, &[0]))?;
    let mut replay = replay_for(store, &cfg_with(LatencyPolicy::Fixed(0), 0));

    let err = replay
        .send(b"pong\n", InputKind::Line)
        .await
        .expect_err("no such exchange");
    match err {
        EngineError::TapeMiss { nearest, .. } => {
            assert_eq!(nearest, vec!["ping".to_string()]);
        },
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_error_injection_is_deterministic_per_seed() -> Result<()> {
    let recorded = tape(1, 0, &[0, 0, 0]);

    let mut kinds = Vec::new();
    for _ in 0..2 {
        let (_root, store) = store_with(&recorded)?;
        let mut replay = replay_for(store, &cfg_with(LatencyPolicy::Fixed(0), 100));
        replay.send(b"ping\n", InputKind::Line).await?;
        // A pattern the recorded bytes can never satisfy, so the injected
        // fault is what surfaces.
        let pats = [Regex::new(r"NEVER")?];
        let outcome = replay
            .expect(&pats, std::time::Duration::from_secs(2))
            .await;
        kinds.push(match outcome {
            Ok(_) => "match".to_string(),
            Err(e) => format!("{e}"),
        });
    }
    assert_eq!(kinds[0], kinds[1], "same seed must inject the same fault");
    assert!(
        kinds[0].contains("simulated-timeout") || kinds[0].contains("simulated-exit"),
        "errorRate=100 must inject a fault, got {}",
        kinds[0]
    );
    Ok(())
}

#[tokio::test]
async fn test_recorded_exit_surfaces_after_drain() -> Result<()> {
    let mut recorded = tape(0, 0, &[0]);
    recorded.exchanges[0].exit = Some(ExitInfo {
        code: 7,
        signal: None,
    });
    let (_root, store) = store_with(&recorded)?;
    let mut replay = replay_for(store, &cfg_with(LatencyPolicy::Fixed(0), 0));

    replay.send(b"ping\n", InputKind::Line).await?;
    let pats = [Regex::new(r"part0;")?];
    replay
        .expect(&pats, std::time::Duration::from_secs(2))
        .await?;

    // Once drained, the replayed process is gone with the recorded code.
    let err = replay
        .expect(&[Regex::new(r"more")?], std::time::Duration::from_millis(200))
        .await
        .expect_err("nothing further");
    match err {
        EngineError::Process { code, .. } => assert_eq!(code, Some(7)),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!replay.is_alive());
    assert_eq!(replay.close(), Some(7));
    Ok(())
}

#[tokio::test]
async fn test_tape_level_latency_spec_applies() -> Result<()> {
    let mut recorded = tape(0, 0, &[0, 0, 0]);
    recorded.meta.latency = Some(LatencySpec::Fixed(0));
    let (_root, store) = store_with(&recorded)?;
    // Session leaves latency at Recorded; the tape's own spec wins.
    let mut replay = replay_for(store, &cfg_with(LatencyPolicy::Recorded, 0));

    replay.send(b"ping\n", InputKind::Line).await?;
    let pats = [Regex::new(r"part2;")?];
    replay
        .expect(&pats, std::time::Duration::from_secs(2))
        .await?;
    Ok(())
}
