//! How a cached file lands on disk.

use serde::{Deserialize, Serialize};

/// The relationship between a CAS blob and a materialized path on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum RealizationMode {
    /// Byte copy (or copy-on-write where the filesystem supports it).
    Copy,
    /// Hardlink from the CAS entry; fails if the link cannot be created.
    HardLink,
    /// Attempt a hardlink; fall back to copy on failure.
    HardLinkOrCopy,
}
