//! Access classification (§4.5.3): flag-based dispatch for `open`, and the
//! directory-subtree expansion for `rename`.

use std::path::{Path, PathBuf};

use bxl_types::pathset::AccessType;

use crate::event::{EventKind, PathResolution, SandboxEvent};

/// The subset of open(2) flag bits classification cares about. Modeled as a
/// plain struct of booleans rather than pulling `libc`'s raw constants
/// through this pure, OS-independent module — callers on the
/// syscall-intercepting side translate from real `O_*` values before calling
/// in.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct OpenFlags {
    pub creat: bool,
    pub trunc: bool,
    pub write_access: bool,
}

/// Open is classified by flags (§4.5.3): `O_CREAT|O_TRUNC` on an absent path
/// is a `Create`; on an existing path with write access it's a
/// `GenericWrite`; otherwise it's a read-shaped `Open`.
pub fn classify_open(flags: OpenFlags, path_exists: bool) -> EventKind {
    if flags.creat && flags.trunc && !path_exists {
        EventKind::Create
    } else if path_exists && flags.write_access {
        EventKind::GenericWrite
    } else {
        EventKind::Open
    }
}

/// `stat`/`access(2)`/`name_to_handle_at(2)` map to `GenericProbe`.
pub fn classify_probe() -> EventKind {
    EventKind::GenericProbe
}

/// `readdir`/`scandir` map to `DirectoryEnumeration`'s event-stream
/// counterpart — there is no dedicated `EventKind` for it because the
/// sandbox reports directory reads as probes carrying the
/// `DirectoryEnumeration` access type at the path-set layer (see
/// [`AccessType`]); the wire-level event stays a `GenericProbe`.
pub fn classify_directory_read() -> (EventKind, AccessType) {
    (EventKind::GenericProbe, AccessType::DirectoryEnumeration)
}

/// `readlink` maps to `ReadLink`, a probe carrying the no-follow resolution
/// flag.
pub fn classify_readlink() -> (EventKind, PathResolution) {
    (EventKind::ReadLink, PathResolution::ResolveNoFollow)
}

/// Maps an `EventKind` to the [`AccessType`] it contributes to the observed
/// path set, if any. Write-shaped events (`GenericWrite`, `Create`,
/// `Unlink`, `Link`) don't contribute path-set entries: writes are tracked
/// through declared outputs, not observed inputs (§3's path set is the set
/// of paths *read* during execution). Process-lifecycle events (`Exec`,
/// `Clone`) likewise carry no path-set entry of their own.
pub fn access_type_for(kind: EventKind) -> Option<AccessType> {
    match kind {
        EventKind::Open | EventKind::GenericRead => Some(AccessType::FileContentRead),
        EventKind::GenericProbe => Some(AccessType::ExistenceProbe),
        EventKind::ReadLink => Some(AccessType::ExistenceProbe),
        EventKind::GenericWrite | EventKind::Create | EventKind::Unlink | EventKind::Link | EventKind::Exec | EventKind::Clone => None,
    }
}

/// One entry discovered while enumerating a renamed directory's subtree.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RenameEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub is_directory: bool,
}

/// Expand a `rename(2)` of `source -> destination` into the paired
/// `(Unlink, Create)` events the sandbox must emit (§4.5.3).
///
/// For a source file this yields exactly one `(Unlink, Create)` pair. For a
/// source directory, the full subtree is enumerated first (in the order
/// `entries` were collected — the spec leaves enumeration order unspecified
/// and not consumer-observable, §9, so this function takes already-ordered
/// entries rather than reordering them) and a pair is emitted per entry.
/// The directory node itself is not a moved entry and gets no pair of its
/// own (§8 scenario 6: exactly one Unlink/Create per moved entry).
pub fn expand_rename(source_is_directory: bool, source: &Path, destination: &Path, subtree: &[RenameEntry]) -> Vec<SandboxEvent> {
    fn pair(source: PathBuf, destination: PathBuf) -> [SandboxEvent; 2] {
        [
            SandboxEvent::new("renameat", EventKind::Unlink, 0, 0, source.clone()).with_destination(destination.clone()),
            SandboxEvent::new("renameat", EventKind::Create, 0, 0, destination).with_destination(source),
        ]
    }

    let mut events = Vec::new();

    if source_is_directory {
        for entry in subtree {
            events.extend(pair(entry.source.clone(), entry.destination.clone()));
        }
    } else {
        events.extend(pair(source.to_path_buf(), destination.to_path_buf()));
    }

    events
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn creat_trunc_on_absent_path_is_create() {
        let flags = OpenFlags {
            creat: true,
            trunc: true,
            write_access: true,
        };
        assert_eq!(classify_open(flags, false), EventKind::Create);
    }

    #[test]
    fn write_access_on_existing_path_is_generic_write() {
        let flags = OpenFlags {
            creat: false,
            trunc: false,
            write_access: true,
        };
        assert_eq!(classify_open(flags, true), EventKind::GenericWrite);
    }

    #[test]
    fn read_only_open_on_existing_path_is_open() {
        let flags = OpenFlags::default();
        assert_eq!(classify_open(flags, true), EventKind::Open);
    }

    #[test]
    fn creat_trunc_on_existing_path_is_generic_write_not_create() {
        let flags = OpenFlags {
            creat: true,
            trunc: true,
            write_access: true,
        };
        assert_eq!(classify_open(flags, true), EventKind::GenericWrite);
    }

    #[test]
    fn single_file_rename_emits_exactly_one_unlink_create_pair() {
        let events = expand_rename(false, Path::new("/d/a"), Path::new("/d2/a"), &[]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Unlink);
        assert_eq!(events[0].source_path, PathBuf::from("/d/a"));
        assert_eq!(events[1].kind, EventKind::Create);
        assert_eq!(events[1].source_path, PathBuf::from("/d2/a"));
    }

    #[test]
    fn directory_rename_emits_exactly_one_pair_per_moved_entry() {
        let subtree = vec![
            RenameEntry {
                source: PathBuf::from("/D/a"),
                destination: PathBuf::from("/D2/a"),
                is_directory: false,
            },
            RenameEntry {
                source: PathBuf::from("/D/b"),
                destination: PathBuf::from("/D2/b"),
                is_directory: false,
            },
            RenameEntry {
                source: PathBuf::from("/D/c"),
                destination: PathBuf::from("/D2/c"),
                is_directory: false,
            },
        ];
        let events = expand_rename(true, Path::new("/D"), Path::new("/D2"), &subtree);
        // 3 subtree entries, each an (Unlink, Create) pair. The directory node
        // itself is not a moved entry and gets no pair.
        assert_eq!(events.len(), 6);
        let unlinks = events.iter().filter(|e| e.kind == EventKind::Unlink).count();
        let creates = events.iter().filter(|e| e.kind == EventKind::Create).count();
        assert_eq!(unlinks, 3);
        assert_eq!(creates, 3);
    }
}
