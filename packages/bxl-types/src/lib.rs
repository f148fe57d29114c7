//! Shared data model for the pip execution core.
//!
//! This crate carries no I/O: it is the vocabulary that `bxl-cas`,
//! `bxl-fingerprint`, `bxl-tpfs`, `bxl-sandbox`, and `bxl-engine` all build
//! against, the same role `clients` plays for `hurry`/`courier`.

pub mod artifact;
pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod hash;
pub mod mount;
pub mod pathset;
pub mod pip;
pub mod realization;
pub mod salts;

pub use artifact::{DirectoryArtifact, ExistenceAttribute, FileArtifact};
pub use cache::{CacheEntry, CacheSite};
pub use error::BuildError;
pub use fingerprint::{StrongFingerprint, WeakFingerprint};
pub use hash::ContentHash;
pub use mount::{Mount, MountTable};
pub use pathset::{AccessType, ObservedInput, ObservedValue, PathSetEntry};
pub use pip::{Pip, PipId, PipKind, ProcessOptions, ProcessPip};
pub use realization::RealizationMode;
pub use salts::{PreserveOutputsSalt, SandboxSafetyLevel};
