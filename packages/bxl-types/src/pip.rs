//! The pip variant set and process-specific declarations.

use std::path::PathBuf;
use std::time::Duration;

use bon::Builder;
use derive_more::{Debug, Display};
use serde::{Deserialize, Serialize};

use crate::artifact::{DirectoryArtifact, ExistenceAttribute, FileArtifact};

/// A pip's stable identity: a 64-bit hash assigned by the upstream graph
/// builder. Pips are frozen at scheduler start and never mutated thereafter,
/// so this is treated as an opaque, comparable handle rather than recomputed
/// here.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0:#018x}")]
pub struct PipId(pub u64);

/// Closed-bitmask process options.
///
/// Implemented as a manual bitmask over `u8` (matching [`crate::cache::CacheSite`])
/// rather than pulling in a bitflags crate for four flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct ProcessOptions(u8);

impl ProcessOptions {
    /// Outputs materialized by copy, never hardlink.
    pub const OUTPUTS_MUST_REMAIN_WRITABLE: ProcessOptions = ProcessOptions(1 << 0);
    /// Prior outputs retained as execution inputs when preserve-outputs mode
    /// is enabled.
    pub const ALLOW_PRESERVE_OUTPUTS: ProcessOptions = ProcessOptions(1 << 1);
    /// Fingerprint omits absolute roots.
    pub const PRODUCES_PATH_INDEPENDENT_OUTPUTS: ProcessOptions = ProcessOptions(1 << 2);
    /// Adopt process-wide untracked scopes and pass-through env vars.
    pub const REQUIRE_GLOBAL_DEPENDENCIES: ProcessOptions = ProcessOptions(1 << 3);

    pub const NONE: ProcessOptions = ProcessOptions(0);

    pub fn contains(self, flag: ProcessOptions) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn union(self, other: ProcessOptions) -> ProcessOptions {
        ProcessOptions(self.0 | other.0)
    }

    pub fn insert(&mut self, flag: ProcessOptions) {
        self.0 |= flag.0;
    }
}

impl std::ops::BitOr for ProcessOptions {
    type Output = ProcessOptions;
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// A declared output: an artifact plus its existence requirement.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct DeclaredOutput {
    pub artifact: FileArtifact,
    pub existence: ExistenceAttribute,
}

/// Fields specific to a `Process` pip.
///
/// Most callers only care about a handful of these (see `bxl-cli`'s `run`
/// command), so this derives a `bon` builder rather than forcing every call
/// site to spell out the full field list.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct ProcessPip {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    /// Explicitly declared environment variables.
    #[builder(default)]
    pub environment: Vec<(String, String)>,
    /// Names of ambient environment variables to pass through verbatim.
    #[builder(default)]
    pub pass_through_env: Vec<String>,
    pub working_dir: PathBuf,
    #[builder(default)]
    pub untracked_paths: Vec<PathBuf>,
    #[builder(default)]
    pub untracked_scopes: Vec<PathBuf>,
    #[builder(default = vec![0])]
    pub success_exit_codes: Vec<i32>,
    #[builder(default)]
    pub retry_exit_codes: Vec<i32>,
    #[builder(default)]
    pub uncacheable_exit_codes: Vec<i32>,
    pub warning_regex: Option<String>,
    pub error_regex: Option<String>,
    #[builder(default)]
    pub semaphore_requirements: Vec<(String, u32)>,
    pub timeout: Option<Duration>,
    #[builder(default = ProcessOptions::NONE)]
    pub options: ProcessOptions,
}

/// The pip-kind-specific payload. Closed set: `Process`, `CopyFile`,
/// `WriteFile`, `SealDirectory`, `Ipc`, `HashSourceFile`, `Value`, `SpecFile`,
/// `Module`.
///
/// A tagged enum stands in for the deep pip-class inheritance hierarchy in
/// the source system: the executor only ever needs `compute_weak_fingerprint`
/// / `execute` / `validate_outputs`-shaped operations, all of which dispatch
/// on this tag rather than virtual calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PipKind {
    Process(ProcessPip),
    CopyFile {
        source: FileArtifact,
        destination: FileArtifact,
    },
    WriteFile {
        destination: FileArtifact,
        contents: Vec<u8>,
    },
    SealDirectory {
        directory: DirectoryArtifact,
        contents: Vec<FileArtifact>,
    },
    Ipc {
        moniker: String,
        payload: Vec<u8>,
    },
    HashSourceFile {
        source: FileArtifact,
    },
    Value {
        name: String,
    },
    SpecFile {
        path: PathBuf,
    },
    Module {
        name: String,
    },
}

/// A single build action.
///
/// Carries identity, declared inputs/outputs, and kind-specific fields.
/// Frozen at scheduler start: nothing here is mutated after construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pip {
    pub id: PipId,
    pub declared_file_inputs: Vec<FileArtifact>,
    pub declared_directory_inputs: Vec<DirectoryArtifact>,
    /// Order-only dependencies: enforce scheduling order without
    /// contributing to the fingerprint or path set.
    pub order_only_dependencies: Vec<PipId>,
    pub declared_outputs: Vec<DeclaredOutput>,
    pub declared_directory_outputs: Vec<DirectoryArtifact>,
    pub kind: PipKind,
}

impl Pip {
    pub fn as_process(&self) -> Option<&ProcessPip> {
        match &self.kind {
            PipKind::Process(p) => Some(p),
            _ => None,
        }
    }
}
