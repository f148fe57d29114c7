//! The mount table: a collaborator input (§6) consumed by the core for path
//! tokenization and untracked-scope enforcement.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Mount {
    pub logical_name: String,
    pub absolute_root: PathBuf,
    pub readable: bool,
    pub writable: bool,
    pub trackable: bool,
}

/// Immutable after construction; consumed via traversal/lookup only.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MountTable {
    mounts: Vec<Mount>,
}

impl MountTable {
    pub fn new(mounts: Vec<Mount>) -> Self {
        Self { mounts }
    }

    /// Find the most specific (longest-prefix) mount containing `path`.
    pub fn containing(&self, path: &Path) -> Option<&Mount> {
        self.mounts
            .iter()
            .filter(|m| path.starts_with(&m.absolute_root))
            .max_by_key(|m| m.absolute_root.as_os_str().len())
    }

    /// Substitute a path's mount prefix with the mount's logical name, e.g.
    /// `/src/out/a.o` under mount `("out", /src/out)` becomes `out/a.o`.
    /// Returns `None` if no mount contains the path.
    pub fn tokenize(&self, path: &Path) -> Option<PathBuf> {
        let mount = self.containing(path)?;
        let relative = path.strip_prefix(&mount.absolute_root).ok()?;
        Some(PathBuf::from(&mount.logical_name).join(relative))
    }

    pub fn is_untracked(&self, path: &Path) -> bool {
        self.containing(path).is_some_and(|m| !m.trackable)
    }
}
