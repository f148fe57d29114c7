//! Concurrency inside the injected sandbox (§4.5.6).
//!
//! The injected library is single-process, multi-threaded: its own state
//! (fd→path cache, manifest snapshot, program path) is either immutable
//! after init or protected by lock-free reads and a coarse write lock. This
//! module models the fd→path cache half of that contract — the piece the
//! supervisor-side driver in `bxl-engine` also needs when resolving
//! `*at`-family syscalls whose path argument is relative to a directory fd.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Maps an open file descriptor to the path it was opened against, so
/// `openat`/`fstatat`/`unlinkat`-family calls that pass a dir-fd plus a
/// relative path can still be reported with an absolute path.
///
/// Reset on fork (in the child) and whenever an fd is closed or
/// `dup`/`dup2`/`dup3`'d, per §4.5.6. Reads proceed under a shared lock;
/// writes (insert/remove) take the same lock exclusively — a single
/// `RwLock` stands in for "lock-free reads and a coarse write lock" since
/// fd-table churn is infrequent relative to read volume.
pub struct FdPathCache {
    entries: RwLock<HashMap<i32, PathBuf>>,
}

impl FdPathCache {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    pub fn record(&self, fd: i32, path: impl Into<PathBuf>) {
        self.entries.write().unwrap().insert(fd, path.into());
    }

    pub fn resolve(&self, fd: i32) -> Option<PathBuf> {
        self.entries.read().unwrap().get(&fd).cloned()
    }

    /// Resolve a dir-fd + relative path pair to an absolute path, falling
    /// back to the relative path unresolved if the dir-fd isn't cached
    /// (e.g. `AT_FDCWD`, which callers should special-case before calling
    /// in).
    pub fn resolve_relative(&self, dir_fd: i32, relative: &Path) -> PathBuf {
        match self.resolve(dir_fd) {
            Some(dir) => dir.join(relative),
            None => relative.to_path_buf(),
        }
    }

    /// `dup`/`dup2`/`dup3`: the new fd inherits the old fd's cached path.
    pub fn on_dup(&self, old_fd: i32, new_fd: i32) {
        if let Some(path) = self.resolve(old_fd) {
            self.record(new_fd, path);
        }
    }

    pub fn on_close(&self, fd: i32) {
        self.entries.write().unwrap().remove(&fd);
    }

    /// Reset on fork, in the child only (§4.5.6): the child starts with an
    /// empty cache and repopulates it lazily as it reuses inherited fds.
    pub fn reset_after_fork(&self) {
        self.entries.write().unwrap().clear();
    }
}

impl Default for FdPathCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn resolve_relative_joins_cached_dir_fd() {
        let cache = FdPathCache::new();
        cache.record(3, "/src/pkg");
        assert_eq!(cache.resolve_relative(3, Path::new("main.rs")), PathBuf::from("/src/pkg/main.rs"));
    }

    #[test]
    fn resolve_relative_falls_back_when_dir_fd_unknown() {
        let cache = FdPathCache::new();
        assert_eq!(cache.resolve_relative(99, Path::new("main.rs")), PathBuf::from("main.rs"));
    }

    #[test]
    fn dup_inherits_the_cached_path() {
        let cache = FdPathCache::new();
        cache.record(3, "/src/pkg");
        cache.on_dup(3, 4);
        assert_eq!(cache.resolve(4), Some(PathBuf::from("/src/pkg")));
    }

    #[test]
    fn close_removes_the_entry() {
        let cache = FdPathCache::new();
        cache.record(3, "/src/pkg");
        cache.on_close(3);
        assert_eq!(cache.resolve(3), None);
    }

    #[test]
    fn reset_after_fork_clears_everything() {
        let cache = FdPathCache::new();
        cache.record(3, "/src/pkg");
        cache.reset_after_fork();
        assert_eq!(cache.resolve(3), None);
    }
}
