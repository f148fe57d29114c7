//! The closed error taxonomy propagated across component boundaries.
//!
//! Internal code keeps using `color_eyre::Result` + `.context(...)`, same as
//! the teacher throughout `hurry`/`courier`; `BuildError` is the typed sum at
//! the seams where the *kind* of failure changes propagation policy (retry,
//! fail-fast, mark-uncacheable). The teacher prefers plain enums over
//! `thiserror`, so this one implements `std::error::Error` by hand.

use std::fmt;

use crate::hash::ContentHash;

/// The operation a CAS failure occurred during, for diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CasOperation {
    Store,
    Load,
    Materialize,
    Put,
    Discard,
}

impl fmt::Display for CasOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CasOperation::Store => "store",
            CasOperation::Load => "load",
            CasOperation::Materialize => "materialize",
            CasOperation::Put => "put",
            CasOperation::Discard => "discard",
        };
        f.write_str(s)
    }
}

/// The closed error taxonomy for the pip execution core.
#[derive(Debug)]
pub enum BuildError {
    /// Pip declarations are internally inconsistent, path too long, or a
    /// precondition is violated (e.g., symlink where not permitted).
    /// User-facing; blocks the build.
    InvalidInput { message: String },
    /// A pip accessed a path outside its manifest. Either fatal (default) or
    /// downgraded per allowlist.
    MonitoringViolation { path: String, fatal: bool },
    /// A CAS or filesystem operation failed in a way the retry policy will
    /// re-attempt.
    TransientIO {
        hash: Option<ContentHash>,
        operation: CasOperation,
        source: String,
    },
    /// TPFS or CAS returned an unrecoverable error; the pip is executed as a
    /// miss and not cached.
    CacheFailure { message: String },
    /// The build was cancelled.
    Cancelled,
    /// An invariant was violated; the build aborts.
    InternalError { message: String },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::InvalidInput { message } => write!(f, "invalid input: {message}"),
            BuildError::MonitoringViolation { path, fatal } => {
                write!(f, "monitoring violation at {path} (fatal={fatal})")
            }
            BuildError::TransientIO {
                hash,
                operation,
                source,
            } => write!(
                f,
                "transient I/O error during {operation} of {}: {source}",
                hash.map(|h| h.to_hex()).unwrap_or_else(|| "<none>".into())
            ),
            BuildError::CacheFailure { message } => write!(f, "cache failure: {message}"),
            BuildError::Cancelled => write!(f, "build cancelled"),
            BuildError::InternalError { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for BuildError {}

impl BuildError {
    /// Whether this error, per §7's propagation policy, should be retried
    /// locally rather than propagated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BuildError::TransientIO { .. })
    }

    /// Whether this error must propagate immediately rather than being
    /// absorbed into a pip result.
    pub fn propagates_immediately(&self) -> bool {
        matches!(
            self,
            BuildError::InvalidInput { .. } | BuildError::InternalError { .. } | BuildError::Cancelled
        )
    }
}
