//! File and directory artifacts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A file artifact: an absolute path paired with a write count.
///
/// Write-count `0` marks a source file; `>0` marks an output produced by some
/// pip (the count distinguishes multiple pips writing the same logical path
/// across rewrite scopes).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct FileArtifact {
    pub path: PathBuf,
    pub write_count: u32,
}

impl FileArtifact {
    pub fn source(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_count: 0,
        }
    }

    pub fn output(path: impl Into<PathBuf>, write_count: u32) -> Self {
        Self {
            path: path.into(),
            write_count,
        }
    }

    pub fn is_source(&self) -> bool {
        self.write_count == 0
    }
}

/// A directory artifact: an absolute path, a partial-seal id, and whether it
/// is a shared opaque directory.
///
/// `partial_seal_id = 0` denotes the canonical directory; non-zero ids
/// distinguish multiple overlapping seals of the same path. Shared opaque
/// directories admit multiple writers and their contents are known only
/// post-execution.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct DirectoryArtifact {
    pub path: PathBuf,
    pub partial_seal_id: u32,
    pub is_shared_opaque: bool,
}

impl DirectoryArtifact {
    pub fn sealed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            partial_seal_id: 0,
            is_shared_opaque: false,
        }
    }

    pub fn shared_opaque(path: impl Into<PathBuf>, partial_seal_id: u32) -> Self {
        Self {
            path: path.into(),
            partial_seal_id,
            is_shared_opaque: true,
        }
    }
}

/// Existence requirement for a declared output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ExistenceAttribute {
    /// Must exist after a successful execution or the pip fails validation.
    Required,
    /// May be absent; recorded as [`crate::ContentHash::ABSENT`] in the cache
    /// entry when missing.
    Optional,
    /// Excluded from the cache entry even when present on disk.
    Temporary,
}
