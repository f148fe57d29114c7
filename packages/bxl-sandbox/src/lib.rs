//! The filesystem observation sandbox (§4.5): interception model, event
//! schema, access classification, policy manifest, wire transport, and the
//! driver abstraction over the two interception mechanisms.

pub mod classify;
pub mod driver;
pub mod event;
pub mod lifecycle;
pub mod manifest;
pub mod state;
pub mod transport;

pub use classify::{OpenFlags, RenameEntry, access_type_for, classify_directory_read, classify_open, classify_probe, classify_readlink, expand_rename};
pub use driver::{AutoSelectingDriver, NativeInterposition, ProcessSpec, PtraceFallback, SandboxDriver, SandboxRun, SimulatedSandbox};
pub use event::{EOM_SENTINEL, EventKind, PathResolution, SandboxEvent};
pub use manifest::{AccessCheckResult, AccessMask, AllowlistDisposition, FileAccessManifest, PolicyOutcome};
pub use state::FdPathCache;
