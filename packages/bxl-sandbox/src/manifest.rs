//! The per-pip file-access manifest (§4.5.4): a trie of path scopes, each
//! annotated with permitted operation bitmasks, plus untracked scopes and
//! allowlists.
//!
//! Grounded on `bxl_types::MountTable::containing`'s longest-prefix-match
//! shape, generalized from a flat mount list to a scope trie with per-scope
//! permission bits.

use std::path::{Path, PathBuf};

use lazy_regex::Regex;
use serde::{Deserialize, Serialize};

use crate::event::{EventKind, SandboxEvent};

/// Permitted-operation bitmask for one manifest scope.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct AccessMask(u8);

impl AccessMask {
    pub const NONE: AccessMask = AccessMask(0);
    pub const ALLOW_READ: AccessMask = AccessMask(1 << 0);
    pub const ALLOW_WRITE: AccessMask = AccessMask(1 << 1);
    pub const ALLOW_PROBE: AccessMask = AccessMask(1 << 2);
    pub const REPORT: AccessMask = AccessMask(1 << 3);
    pub const ALL: AccessMask = AccessMask(0b1111);

    pub fn contains(self, flag: AccessMask) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn union(self, other: AccessMask) -> AccessMask {
        AccessMask(self.0 | other.0)
    }
}

impl std::ops::BitOr for AccessMask {
    type Output = AccessMask;
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// One declared scope: a path prefix and the operations permitted under it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestScope {
    pub path_prefix: PathBuf,
    pub mask: AccessMask,
}

/// Whether a matched allowlist pattern downgrades a violation to a
/// cacheable or non-cacheable reportable event (§4.6 step 3).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AllowlistDisposition {
    Cacheable,
    NonCacheable,
}

pub struct AllowlistRule {
    pub pattern: Regex,
    pub disposition: AllowlistDisposition,
}

/// The per-pip manifest: a trie of path scopes (implemented as a sorted
/// `Vec` searched by longest-prefix match, same discipline as
/// `MountTable::containing`), untracked scopes, per-pip temp directories,
/// and allowlist patterns.
pub struct FileAccessManifest {
    scopes: Vec<ManifestScope>,
    untracked_scopes: Vec<PathBuf>,
    temp_directories: Vec<PathBuf>,
    allowlists: Vec<AllowlistRule>,
}

/// Outcome of checking one event against the manifest (§4.5.4).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AccessCheckResult {
    Allowed,
    Denied,
    AllowedWithWarning,
}

/// Finer-grained outcome the executor needs beyond the raw
/// `AccessCheckResult`: whether a denied access was downgraded by an
/// allowlist, and to what disposition (§4.6 step 3).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PolicyOutcome {
    Allowed,
    AllowedWithWarning,
    /// Untracked: neither reported nor enforced.
    Untracked,
    /// Denied and not downgraded by any allowlist: a fatal monitoring
    /// violation by default.
    Denied,
    /// Denied, but an allowlist downgraded it to a reportable access that
    /// may still be cached.
    ViolationCacheable,
    /// Denied, but an allowlist downgraded it to a reportable access that
    /// marks the pip perpetually dirty (never cacheable).
    ViolationDoNotCache,
}

impl FileAccessManifest {
    pub fn new() -> Self {
        Self {
            scopes: Vec::new(),
            untracked_scopes: Vec::new(),
            temp_directories: Vec::new(),
            allowlists: Vec::new(),
        }
    }

    pub fn with_scope(mut self, path_prefix: impl Into<PathBuf>, mask: AccessMask) -> Self {
        self.scopes.push(ManifestScope {
            path_prefix: path_prefix.into(),
            mask,
        });
        self
    }

    pub fn with_untracked_scope(mut self, path_prefix: impl Into<PathBuf>) -> Self {
        self.untracked_scopes.push(path_prefix.into());
        self
    }

    pub fn with_temp_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_directories.push(path.into());
        self
    }

    pub fn with_allowlist(mut self, pattern: Regex, disposition: AllowlistDisposition) -> Self {
        self.allowlists.push(AllowlistRule { pattern, disposition });
        self
    }

    pub fn is_untracked(&self, path: &Path) -> bool {
        self.untracked_scopes.iter().any(|scope| path.starts_with(scope)) || self.temp_directories.iter().any(|dir| path.starts_with(dir))
    }

    fn matching_scope(&self, path: &Path) -> Option<&ManifestScope> {
        self.scopes
            .iter()
            .filter(|s| path.starts_with(&s.path_prefix))
            .max_by_key(|s| s.path_prefix.as_os_str().len())
    }

    fn required_mask(kind: EventKind) -> AccessMask {
        match kind {
            EventKind::Open | EventKind::GenericRead | EventKind::ReadLink => AccessMask::ALLOW_READ,
            EventKind::GenericWrite | EventKind::Create | EventKind::Unlink | EventKind::Link => AccessMask::ALLOW_WRITE,
            EventKind::GenericProbe => AccessMask::ALLOW_PROBE,
            EventKind::Exec | EventKind::Clone => AccessMask::NONE,
        }
    }

    /// Raw check against scopes only, before allowlist downgrade.
    fn check_raw(&self, event: &SandboxEvent) -> AccessCheckResult {
        let required = Self::required_mask(event.kind);
        if required == AccessMask::NONE {
            return AccessCheckResult::Allowed;
        }
        match self.matching_scope(&event.source_path) {
            Some(scope) if scope.mask.contains(required) => {
                if scope.mask.contains(AccessMask::REPORT) {
                    AccessCheckResult::AllowedWithWarning
                } else {
                    AccessCheckResult::Allowed
                }
            }
            _ => AccessCheckResult::Denied,
        }
    }

    fn matching_allowlist(&self, event: &SandboxEvent) -> Option<&AllowlistRule> {
        let path_str = event.source_path.to_string_lossy();
        self.allowlists.iter().find(|rule| rule.pattern.is_match(&path_str))
    }

    /// Full policy evaluation for one event (§4.5.4 + §4.6 step 3): combines
    /// untracked-scope short-circuiting, the scope-trie check, and allowlist
    /// downgrade into the outcome the executor needs to decide cacheability.
    pub fn evaluate(&self, event: &SandboxEvent) -> PolicyOutcome {
        if self.is_untracked(&event.source_path) {
            return PolicyOutcome::Untracked;
        }

        match self.check_raw(event) {
            AccessCheckResult::Allowed => PolicyOutcome::Allowed,
            AccessCheckResult::AllowedWithWarning => PolicyOutcome::AllowedWithWarning,
            AccessCheckResult::Denied => match self.matching_allowlist(event) {
                Some(rule) => match rule.disposition {
                    AllowlistDisposition::Cacheable => PolicyOutcome::ViolationCacheable,
                    AllowlistDisposition::NonCacheable => PolicyOutcome::ViolationDoNotCache,
                },
                None => PolicyOutcome::Denied,
            },
        }
    }
}

impl Default for FileAccessManifest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn read_event(path: &str) -> SandboxEvent {
        SandboxEvent::new("openat", EventKind::Open, 1, 0, path)
    }

    fn write_event(path: &str) -> SandboxEvent {
        SandboxEvent::new("openat", EventKind::GenericWrite, 1, 0, path)
    }

    #[test]
    fn read_within_allowed_scope_is_allowed() {
        let manifest = FileAccessManifest::new().with_scope("/src", AccessMask::ALLOW_READ);
        assert_eq!(manifest.evaluate(&read_event("/src/main.rs")), PolicyOutcome::Allowed);
    }

    #[test]
    fn write_outside_any_scope_is_denied() {
        let manifest = FileAccessManifest::new().with_scope("/src", AccessMask::ALLOW_READ);
        assert_eq!(manifest.evaluate(&write_event("/etc/passwd")), PolicyOutcome::Denied);
    }

    #[test]
    fn untracked_scope_short_circuits_to_untracked() {
        let manifest = FileAccessManifest::new().with_untracked_scope("/tmp/cache");
        assert_eq!(manifest.evaluate(&write_event("/tmp/cache/x")), PolicyOutcome::Untracked);
    }

    #[test]
    fn longest_prefix_scope_wins() {
        let manifest = FileAccessManifest::new()
            .with_scope("/src", AccessMask::ALLOW_READ)
            .with_scope("/src/out", AccessMask::ALLOW_READ | AccessMask::ALLOW_WRITE);
        assert_eq!(manifest.evaluate(&write_event("/src/out/a.o")), PolicyOutcome::Allowed);
        assert_eq!(manifest.evaluate(&write_event("/src/other.rs")), PolicyOutcome::Denied);
    }

    #[test]
    fn cacheable_allowlist_downgrades_a_denied_write() {
        let manifest = FileAccessManifest::new().with_allowlist(Regex::new(r"\.tmp$").unwrap(), AllowlistDisposition::Cacheable);
        assert_eq!(manifest.evaluate(&write_event("/scratch/x.tmp")), PolicyOutcome::ViolationCacheable);
    }

    #[test]
    fn non_cacheable_allowlist_marks_perpetually_dirty() {
        let manifest = FileAccessManifest::new().with_allowlist(Regex::new(r"/proc/").unwrap(), AllowlistDisposition::NonCacheable);
        assert_eq!(manifest.evaluate(&read_event("/proc/self/status")), PolicyOutcome::ViolationDoNotCache);
    }

    #[test]
    fn reportable_scope_allows_with_warning() {
        let manifest = FileAccessManifest::new().with_scope("/src", AccessMask::ALLOW_READ | AccessMask::REPORT);
        assert_eq!(manifest.evaluate(&read_event("/src/main.rs")), PolicyOutcome::AllowedWithWarning);
    }

    #[test]
    fn exec_and_clone_require_no_mask() {
        let manifest = FileAccessManifest::new();
        let exec = SandboxEvent::new("execve", EventKind::Exec, 1, 0, "/usr/bin/cc");
        assert_eq!(manifest.evaluate(&exec), PolicyOutcome::Allowed);
    }
}
