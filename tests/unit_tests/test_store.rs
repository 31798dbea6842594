// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::Result;
use pty_tape_rs::{
    cfg::enums::InputKind,
    matcher::{MatchContext, MatchRules},
    tape::{
        codec,
        model::{
            Chunk, Exchange, Input, Meta, Output, PreState, PtyDims, SCHEMA_VERSION,
            SessionInfo, Tape,
        },
        store::TapeStore,
    },
};

fn tape_with_inputs(program: &str, inputs: &[&str]) -> Tape {
    Tape {
        schema_version: SCHEMA_VERSION,
        meta: Meta {
            created_at: "2024-01-01T00:00:00Z".to_string(),
            program: program.to_string(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: "/work".to_string(),
            pty: PtyDims { rows: 24, cols: 80 },
            tag: None,
            latency: None,
            error_rate: 0,
            seed: 0,
        },
        session: SessionInfo {
            recorder: "test".to_string(),
            platform: "linux".to_string(),
        },
        exchanges: inputs
            .iter()
            .map(|input| Exchange {
                pre: PreState {
                    prompt: String::new(),
                    state_hash: None,
                },
                input: Input::from_bytes(InputKind::Line, input.as_bytes()),
                output: Output {
                    chunks: vec![Chunk::from_bytes(
                        0,
                        format!("READY:{input}\n> ").as_bytes(),
                    )],
                },
                exit: None,
                dur_ms: 1,
                annotations: None,
            })
            .collect(),
        extra: serde_json::Map::new(),
    }
}

fn key_for(rules: &MatchRules, program: &str, input: &str) -> String {
    MatchContext::build(
        rules,
        program,
        &[],
        &BTreeMap::new(),
        "/work",
        "",
        input.as_bytes(),
        InputKind::Line,
        None,
    )
    .key()
}

#[test]
fn test_recursive_load_and_lookup() -> Result<()> {
    let root = tempfile::tempdir()?;
    let nested = root.path().join("prog/deeper");
    fs::create_dir_all(&nested)?;
    fs::write(
        nested.join("a.json5"),
        codec::encode(&tape_with_inputs("prog", &["hello"]))?,
    )?;

    let rules = MatchRules::default();
    let store = TapeStore::load(root.path(), rules.clone());

    let key = key_for(&rules, "prog", "hello");
    let (tape, ordinal, _) = store.lookup(&key).expect("indexed exchange");
    assert_eq!(ordinal, 0);
    assert_eq!(tape.meta.program, "prog");
    Ok(())
}

#[test]
fn test_invalid_tapes_are_skipped() -> Result<()> {
    let root = tempfile::tempdir()?;
    fs::write(root.path().join("broken.json5"), "{not valid at all")?;
    fs::write(
        root.path().join("good.json5"),
        codec::encode(&tape_with_inputs("prog", &["hello"]))?,
    )?;

    let rules = MatchRules::default();
    let store = TapeStore::load(root.path(), rules.clone());

    assert!(store.lookup(&key_for(&rules, "prog", "hello")).is_some());
    Ok(())
}

#[test]
fn test_duplicate_keys_shadow_last_loaded() -> Result<()> {
    let root = tempfile::tempdir()?;
    // Identical identity and exchange key; files load in sorted order.
    let mut first = tape_with_inputs("prog", &["hello"]);
    first.meta.tag = Some("first".to_string());
    let mut second = tape_with_inputs("prog", &["hello"]);
    second.meta.tag = Some("second".to_string());
    fs::write(root.path().join("a.json5"), codec::encode(&first)?)?;
    fs::write(root.path().join("b.json5"), codec::encode(&second)?)?;

    let rules = MatchRules::default();
    let store = TapeStore::load(root.path(), rules.clone());

    let (tape, _, path) = store
        .lookup(&key_for(&rules, "prog", "hello"))
        .expect("shadowed key still resolves");
    assert_eq!(tape.meta.tag.as_deref(), Some("second"));
    assert!(path.ends_with("b.json5"));
    Ok(())
}

#[test]
fn test_write_tape_is_atomic_and_indexed() -> Result<()> {
    let root = tempfile::tempdir()?;
    let rules = MatchRules::default();
    let store = TapeStore::load(root.path(), rules.clone());

    let written = store.write_tape(
        Path::new("prog/fresh.json5"),
        &tape_with_inputs("prog", &["hello"]),
    )?;
    assert!(written.exists());
    assert!(!written.with_file_name("fresh.json5.tmp").exists());

    // The written file parses back and the index serves it immediately.
    let text = fs::read_to_string(&written)?;
    codec::decode(&written, &text)?;
    assert!(store.lookup(&key_for(&rules, "prog", "hello")).is_some());
    assert!(store.has_identity(
        &pty_tape_rs::matcher::IdentityContext::build(
            &rules,
            "prog",
            &[],
            &BTreeMap::new(),
            "/work",
        )
        .key()
    ));
    Ok(())
}

#[test]
fn test_write_rejects_escaping_paths() -> Result<()> {
    let root = tempfile::tempdir()?;
    let store = TapeStore::load(root.path(), MatchRules::default());
    let tape = tape_with_inputs("prog", &["hello"]);

    assert!(store.write_tape(Path::new("/abs/t.json5"), &tape).is_err());
    assert!(store.write_tape(Path::new("../t.json5"), &tape).is_err());
    assert!(store.write_tape(Path::new("t.json"), &tape).is_err());
    Ok(())
}

#[test]
fn test_summary_sets_are_disjoint() -> Result<()> {
    let root = tempfile::tempdir()?;
    fs::write(
        root.path().join("used.json5"),
        codec::encode(&tape_with_inputs("prog", &["hello"]))?,
    )?;
    fs::write(
        root.path().join("unused.json5"),
        codec::encode(&tape_with_inputs("other", &["bye"]))?,
    )?;

    let rules = MatchRules::default();
    let store = TapeStore::load(root.path(), rules.clone());
    store
        .lookup(&key_for(&rules, "prog", "hello"))
        .expect("hit marks used");
    store.write_tape(
        Path::new("fresh.json5"),
        &tape_with_inputs("third", &["new"]),
    )?;

    let summary = store.summary();
    assert_eq!(summary.new_tapes.len(), 1);
    assert!(summary.new_tapes[0].ends_with("fresh.json5"));
    assert_eq!(summary.unused_tapes.len(), 1);
    assert!(summary.unused_tapes[0].ends_with("unused.json5"));
    Ok(())
}

#[test]
fn test_nearest_inputs_by_edit_distance() -> Result<()> {
    let root = tempfile::tempdir()?;
    fs::write(
        root.path().join("t.json5"),
        codec::encode(&tape_with_inputs("prog", &["hello", "help", "status"]))?,
    )?;

    let store = TapeStore::load(root.path(), MatchRules::default());
    let nearest = store.nearest_inputs("hell", 2);
    assert_eq!(nearest, vec!["hello", "help"]);
    Ok(())
}

#[test]
fn test_index_is_deterministic_across_loads() -> Result<()> {
    let root = tempfile::tempdir()?;
    fs::write(
        root.path().join("a.json5"),
        codec::encode(&tape_with_inputs("prog", &["one", "two"]))?,
    )?;
    fs::write(
        root.path().join("b.json5"),
        codec::encode(&tape_with_inputs("other", &["three"]))?,
    )?;

    let rules = MatchRules::default();
    let first = TapeStore::load(root.path(), rules.clone());
    let second = TapeStore::load(root.path(), rules.clone());
    for input in ["one", "two"] {
        let key = key_for(&rules, "prog", input);
        let (_, ord_a, path_a) = first.lookup(&key).expect("first load");
        let (_, ord_b, path_b) = second.lookup(&key).expect("second load");
        assert_eq!(ord_a, ord_b);
        assert_eq!(path_a, path_b);
    }
    Ok(())
}
