//! Cache entries and cache-site bookkeeping.

use serde::{Deserialize, Serialize};

use crate::fingerprint::StrongFingerprint;
use crate::hash::ContentHash;

/// Where a content hash is known to be stored. A monotone bitmask: additions
/// only move a hash "up" (None -> Local|Remote -> Local&Remote); evictions
/// are the only way a site bit is cleared.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct CacheSite(u8);

impl CacheSite {
    pub const NONE: CacheSite = CacheSite(0);
    pub const LOCAL: CacheSite = CacheSite(1 << 0);
    pub const REMOTE: CacheSite = CacheSite(1 << 1);

    pub fn contains(self, site: CacheSite) -> bool {
        self.0 & site.0 == site.0
    }

    pub fn union(self, other: CacheSite) -> CacheSite {
        CacheSite(self.0 | other.0)
    }

    pub fn remove(self, site: CacheSite) -> CacheSite {
        CacheSite(self.0 & !site.0)
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    pub fn is_local(self) -> bool {
        self.contains(Self::LOCAL)
    }

    pub fn is_remote(self) -> bool {
        self.contains(Self::REMOTE)
    }
}

impl std::ops::BitOr for CacheSite {
    type Output = CacheSite;
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// A published cache entry: a strong fingerprint's output manifest.
///
/// Metadata encodes output paths, stdio hashes, warnings, and file existence
/// attributes; kept as a separately-hashed blob (`metadata_hash`) so the
/// entry itself stays small and uniform-sized for the TPFS index.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub strong_fingerprint: StrongFingerprint,
    pub output_hashes: Vec<ContentHash>,
    pub metadata_hash: ContentHash,
}

/// Metadata blob referenced by [`CacheEntry::metadata_hash`].
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct CacheEntryMetadata {
    pub output_paths: Vec<std::path::PathBuf>,
    pub stdout_hash: Option<ContentHash>,
    pub stderr_hash: Option<ContentHash>,
    pub warnings: Vec<String>,
    pub output_existence: Vec<crate::artifact::ExistenceAttribute>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cache_site_union_and_remove() {
        let sites = CacheSite::LOCAL | CacheSite::REMOTE;
        assert!(sites.is_local());
        assert!(sites.is_remote());

        let local_only = sites.remove(CacheSite::REMOTE);
        assert!(local_only.is_local());
        assert!(!local_only.is_remote());
    }

    #[test]
    fn cache_site_none_is_empty() {
        assert!(CacheSite::NONE.is_none());
        assert_eq!(CacheSite::default(), CacheSite::NONE);
    }
}
