//! The File Content Manager (§4.7): per-path last content hash and
//! realization mode, backing the `UpToDate` decision, plus pip output
//! origin tracking and graph-scrubbing.
//!
//! A process-wide reader-writer-locked table (§5: "the file-content-table
//! is process-wide and protected by a reader-writer lock"), grounded on the
//! teacher's `cache::LibraryFiles` fingerprint-restore bookkeeping
//! (`hurry/src/cargo/cache/restore.rs`) generalized from cargo units to
//! arbitrary declared outputs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bxl_types::{ContentHash, PipId, RealizationMode};

/// Where a pip's output ended up coming from, for reporting (§4.7).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OutputOrigin {
    Produced,
    UpToDate,
    DeployedFromCache,
}

#[derive(Clone, Copy, Debug)]
struct FileRecord {
    content_hash: ContentHash,
    realization_mode: RealizationMode,
    produced_by: PipId,
}

/// Tracks, per absolute path, the last known content hash and realization
/// mode produced by a pip in the current build.
pub struct FileContentManager {
    files: RwLock<HashMap<PathBuf, FileRecord>>,
    origins: RwLock<HashMap<PipId, OutputOrigin>>,
}

impl FileContentManager {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            origins: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, path: impl Into<PathBuf>, hash: ContentHash, mode: RealizationMode, produced_by: PipId) {
        self.files.write().unwrap().insert(
            path.into(),
            FileRecord {
                content_hash: hash,
                realization_mode: mode,
                produced_by,
            },
        );
    }

    pub fn last_known_hash(&self, path: &Path) -> Option<ContentHash> {
        self.files.read().unwrap().get(path).map(|r| r.content_hash)
    }

    pub fn last_realization_mode(&self, path: &Path) -> Option<RealizationMode> {
        self.files.read().unwrap().get(path).map(|r| r.realization_mode)
    }

    /// Whether every path in `expected` is already tracked with the
    /// matching content hash — the `UpToDate` test from §4.6's cache-hit
    /// replay path, checked without touching disk beyond what the caller
    /// already verified when populating this table.
    pub fn all_up_to_date(&self, expected: &[(PathBuf, ContentHash)]) -> bool {
        let files = self.files.read().unwrap();
        expected.iter().all(|(path, hash)| files.get(path).is_some_and(|r| r.content_hash == *hash))
    }

    pub fn record_origin(&self, pip: PipId, origin: OutputOrigin) {
        self.origins.write().unwrap().insert(pip, origin);
    }

    pub fn origin_of(&self, pip: PipId) -> Option<OutputOrigin> {
        self.origins.read().unwrap().get(&pip).copied()
    }

    /// Deletes bookkeeping (and, in a full deployment, the on-disk output)
    /// for any tracked path not produced by a pip in `live_pips` — scrubbing
    /// stale outputs left behind by pips no longer in the current graph.
    pub fn scrub(&self, live_pips: &[PipId]) -> Vec<PathBuf> {
        let mut files = self.files.write().unwrap();
        let mut removed = Vec::new();
        files.retain(|path, record| {
            let keep = live_pips.contains(&record.produced_by);
            if !keep {
                removed.push(path.clone());
            }
            keep
        });
        removed
    }
}

impl Default for FileContentManager {
    fn default() -> Self {
        Self::new()
    }
}
