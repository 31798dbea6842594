// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-wide tape store: recursive load, in-memory match index, atomic
//! writes under advisory file locks, and per-session usage accounting.
//!
//! Readers share the index behind a reader/writer lock; writers to distinct
//! paths proceed in parallel and writers to one path serialize on the file
//! lock. The only per-session mutable state is the used/new accounting.

use std::{
    collections::{HashMap, HashSet},
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use dashmap::DashSet;
use fs2::FileExt;
use tracing::{debug, warn};

use crate::{
    errors::{EngineError, Result},
    matcher::{IdentityContext, MatchContext, MatchRules},
    tape::{
        codec::{self, SchemaCheck},
        model::Tape,
        naming::{self, StoreSummary},
    },
};

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_POLL: Duration = Duration::from_millis(50);

/// Index entry: which tape and which exchange a key resolves to.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub path: PathBuf,
    pub exchange: usize,
}

#[derive(Default)]
struct Index {
    tapes: HashMap<PathBuf, Arc<Tape>>,
    by_key: HashMap<String, IndexEntry>,
    /// Session-identity key -> a tape carrying that identity (last loaded).
    identities: HashMap<String, PathBuf>,
    /// Key -> the input text behind it, for nearest-miss diagnostics.
    inputs: HashMap<String, String>,
}

pub struct TapeStore {
    root: PathBuf,
    rules: MatchRules,
    schema_check: Option<Arc<dyn SchemaCheck>>,
    index: RwLock<Index>,
    used: DashSet<PathBuf>,
    fresh: DashSet<PathBuf>,
}

impl TapeStore {
    /// Builds the store by recursively loading every `*.json5` under
    /// `root`. Tapes that fail to parse or validate are skipped with a
    /// warning; the store stays usable.
    pub fn load(root: impl Into<PathBuf>, rules: MatchRules) -> Arc<Self> {
        Self::load_with_check(root, rules, None)
    }

    pub fn load_with_check(
        root: impl Into<PathBuf>,
        rules: MatchRules,
        schema_check: Option<Arc<dyn SchemaCheck>>,
    ) -> Arc<Self> {
        let root = root.into();
        let started = Instant::now();
        let mut files = Vec::new();
        collect_tape_files(&root, &mut files);
        files.sort();

        let mut index = Index::default();
        let store = Self {
            root,
            rules,
            schema_check,
            index: RwLock::new(Index::default()),
            used: DashSet::new(),
            fresh: DashSet::new(),
        };

        for path in files {
            match fs::read_to_string(&path) {
                Ok(text) => match codec::decode(&path, &text) {
                    Ok(tape) => {
                        if let Some(check) = &store.schema_check
                            && let Err(e) = check.check(&path, &tape)
                        {
                            warn!("skipping tape {}: {e}", path.display());
                            continue;
                        }
                        store.index_tape(&mut index, path, Arc::new(tape));
                    },
                    Err(e) => warn!("skipping tape {}: {e}", path.display()),
                },
                Err(e) => warn!("skipping unreadable tape {}: {e}", path.display()),
            }
        }

        debug!(
            tapes = index.tapes.len(),
            keys = index.by_key.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tape store loaded"
        );
        *store.index.write().expect("index lock poisoned") = index;
        Arc::new(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules(&self) -> &MatchRules {
        &self.rules
    }

    fn index_tape(&self, index: &mut Index, path: PathBuf, tape: Arc<Tape>) {
        let meta = &tape.meta;
        let identity = IdentityContext::build(
            &self.rules,
            &meta.program,
            &meta.args,
            &meta.env,
            &meta.cwd,
        );
        index.identities.insert(identity.key(), path.clone());

        for (ordinal, exchange) in tape.exchanges.iter().enumerate() {
            let input = exchange.input.matching_text();
            let ctx = MatchContext::build(
                &self.rules,
                &meta.program,
                &meta.args,
                &meta.env,
                &meta.cwd,
                &exchange.pre.prompt,
                input.as_bytes(),
                exchange.input.kind,
                exchange.pre.state_hash.clone(),
            );
            let key = ctx.key();
            if let Some(previous) = index.by_key.get(&key)
                && previous.path != path
            {
                warn!(
                    "match key {} of {} exchange {} shadows {} exchange {}",
                    key,
                    path.display(),
                    ordinal,
                    previous.path.display(),
                    previous.exchange,
                );
            }
            index.inputs.insert(key.clone(), input);
            index.by_key.insert(
                key,
                IndexEntry {
                    path: path.clone(),
                    exchange: ordinal,
                },
            );
        }
        index.tapes.insert(path, tape);
    }

    /// O(1) lookup; a hit marks the backing tape as used.
    pub fn lookup(&self, key: &str) -> Option<(Arc<Tape>, usize, PathBuf)> {
        let index = self.index.read().expect("index lock poisoned");
        let entry = index.by_key.get(key)?;
        let tape = index.tapes.get(&entry.path)?.clone();
        self.used.insert(entry.path.clone());
        Some((tape, entry.exchange, entry.path.clone()))
    }

    /// Whether any loaded tape matches this session-identity key.
    pub fn has_identity(&self, identity_key: &str) -> bool {
        self.index
            .read()
            .expect("index lock poisoned")
            .identities
            .contains_key(identity_key)
    }

    /// The recorded pre-prompt of the first exchange for this identity, if
    /// any. Replay seeds its output buffer with it so callers that expect a
    /// greeting before the first send keep working.
    pub fn first_prompt_for_identity(&self, identity_key: &str) -> Option<String> {
        let index = self.index.read().expect("index lock poisoned");
        let path = index.identities.get(identity_key)?;
        let tape = index.tapes.get(path)?;
        tape.exchanges.first().map(|e| e.pre.prompt.clone())
    }

    /// Recorded inputs closest to `input` by edit distance, for `tape-miss`
    /// diagnostics.
    pub fn nearest_inputs(&self, input: &str, limit: usize) -> Vec<String> {
        let index = self.index.read().expect("index lock poisoned");
        let mut candidates: Vec<&String> = index
            .inputs
            .values()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        candidates.sort_by_key(|candidate| {
            (strsim::levenshtein(input, candidate), (*candidate).clone())
        });
        candidates
            .into_iter()
            .take(limit)
            .map(|s| s.to_string())
            .collect()
    }

    /// Writes `tape` at `rel` under the root with the atomic-rename pattern,
    /// holding an exclusive advisory lock on the target for the duration.
    /// Waits up to 30 s for the lock, then fails with `store-busy`.
    pub fn write_tape(&self, rel: &Path, tape: &Tape) -> Result<PathBuf> {
        naming::validate_rel_path(rel)?;
        let target = self.root.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = codec::encode(tape)?;

        let existed = target.exists();
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&target)?;

        let started = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if started.elapsed() < LOCK_TIMEOUT => {
                    std::thread::sleep(LOCK_POLL);
                },
                Err(_) => {
                    if !existed {
                        let _ = fs::remove_file(&target);
                    }
                    return Err(EngineError::StoreBusy {
                        path: target,
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                },
            }
        }

        let tmp = tmp_path(&target);
        let write_result = (|| -> Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &target)?;
            Ok(())
        })();
        let _ = FileExt::unlock(&lock_file);
        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp);
            if !existed {
                let _ = fs::remove_file(&target);
            }
            return Err(e);
        }

        let mut index = self.index.write().expect("index lock poisoned");
        self.index_tape(&mut index, target.clone(), Arc::new(tape.clone()));
        drop(index);
        self.fresh.insert(target.clone());
        Ok(target)
    }

    /// Explicitly mark a tape path as consumed this session.
    pub fn mark_used(&self, path: &Path) {
        self.used.insert(path.to_path_buf());
    }

    /// Two disjoint sorted sets: tapes created this session and tapes that
    /// were loaded but never matched.
    pub fn summary(&self) -> StoreSummary {
        let index = self.index.read().expect("index lock poisoned");
        let mut new_tapes: Vec<PathBuf> =
            self.fresh.iter().map(|p| p.key().clone()).collect();
        new_tapes.sort();

        let mut unused_tapes: Vec<PathBuf> = index
            .tapes
            .keys()
            .filter(|p| !self.used.contains(*p) && !self.fresh.contains(*p))
            .cloned()
            .collect();
        unused_tapes.sort();

        StoreSummary {
            new_tapes,
            unused_tapes,
        }
    }

}

fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".tmp");
    target.with_file_name(name)
}

fn collect_tape_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_tape_files(&path, out);
        } else if path.extension().and_then(|e| e.to_str()) == Some("json5") {
            out.push(path);
        }
    }
}
