//! Path-set canonicalization (§4.3).

use bxl_types::{MountTable, pathset::PathSetEntry};

use crate::stable_hash::stable_hash_256;

/// Canonicalize a raw list of observed path-set entries:
/// - optionally tokenize paths rooted in a declared mount (triggered by
///   `ProducesPathIndependentOutputs`, so this enables reroot-independent
///   fingerprints when the caller opts in);
/// - sort by `(path, access_type)`;
/// - collapse duplicate paths by joining their access types.
///
/// Deterministic across OSes and mounts given the same raw entries and mount
/// table, satisfying the round-trip/idempotence property
/// `canonicalize(P) == canonicalize(canonicalize(P))`.
pub fn canonicalize(
    mut entries: Vec<PathSetEntry>,
    mounts: Option<&MountTable>,
) -> Vec<PathSetEntry> {
    if let Some(mounts) = mounts {
        for entry in &mut entries {
            if let Some(tokenized) = mounts.tokenize(&entry.path) {
                entry.path = tokenized;
            }
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path).then(a.access_type.cmp(&b.access_type)));

    let mut out: Vec<PathSetEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match out.last_mut() {
            Some(last) if last.path == entry.path => {
                last.access_type = last.access_type.join(entry.access_type);
            }
            _ => out.push(entry),
        }
    }
    out
}

/// Hash a canonicalized path set deterministically. Callers MUST pass an
/// already-canonicalized path set — the hash is a pure function of the
/// canonicalized path set (spec §3 invariant), not of the raw observations.
pub fn path_set_hash(canonical: &[PathSetEntry]) -> [u8; 32] {
    stable_hash_256(&canonical)
}
