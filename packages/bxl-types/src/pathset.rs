//! Path set entries and observed inputs.
//!
//! Canonicalization and hashing live in `bxl-fingerprint`; this module only
//! carries the data shapes, matching `bxl-types`' "pure data, no I/O" role.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The kind of access observed against a path.
///
/// Forms a join-semilattice `AbsentPathProbe < ExistenceProbe <
/// {DirectoryEnumeration, FileContentRead}`: when the same path is observed
/// more than once with different access types, the entries collapse to their
/// join (the "strongest" access implies the weaker ones were also
/// satisfied).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum AccessType {
    AbsentPathProbe,
    ExistenceProbe,
    DirectoryEnumeration,
    FileContentRead,
}

impl AccessType {
    /// Combine two access types observed for the same path into their join.
    ///
    /// `DirectoryEnumeration` and `FileContentRead` are incomparable siblings
    /// above `ExistenceProbe`; when both are observed for the same path we
    /// keep `FileContentRead` since it's strictly more informative for
    /// fingerprinting (it carries content, not just member names).
    pub fn join(self, other: Self) -> Self {
        use AccessType::*;
        match (self, other) {
            (FileContentRead, _) | (_, FileContentRead) => FileContentRead,
            (DirectoryEnumeration, _) | (_, DirectoryEnumeration) => DirectoryEnumeration,
            (ExistenceProbe, _) | (_, ExistenceProbe) => ExistenceProbe,
            (AbsentPathProbe, AbsentPathProbe) => AbsentPathProbe,
        }
    }
}

/// A single entry in a path set: a path paired with the access type observed
/// against it. Entries are sorted by `(path, access_type)` and deduplicated
/// by joining access types for the same path.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct PathSetEntry {
    pub path: PathBuf,
    pub access_type: AccessType,
}

/// The re-observed (or recorded) value for a path-set entry.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ObservedValue {
    /// Content hash at observation time (`FileContentRead`).
    Content(crate::hash::ContentHash),
    /// Fingerprint of the directory's sorted member names, with the pip's
    /// optional regex filter already applied (`DirectoryEnumeration`).
    Enumeration(crate::hash::ContentHash),
    /// Present/absent flag (`ExistenceProbe`).
    Existence(bool),
    /// The path did not exist (`AbsentPathProbe`); the value is always the
    /// constant absent marker.
    Absent,
}

/// A path-set entry zipped with its observed value.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ObservedInput {
    pub entry: PathSetEntry,
    pub value: ObservedValue,
}
