//! Fingerprint salts (§4.4).

use serde::{Deserialize, Serialize};

/// Regenerated per build session when preserve-outputs mode is enabled (and
/// when a pip doesn't opt into `AllowPreserveOutputs` while the mode is
/// globally enabled). Mixing a fresh salt into the weak fingerprint forces a
/// miss.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct PreserveOutputsSalt(pub [u8; 16]);

/// How strictly the sandbox enforces/reports accesses for a pip.
///
/// Ordered so that a stronger (safer) level is a strict refinement of a
/// weaker one: a pip cached under a safer level satisfies a lookup made
/// under an equal-or-weaker level ("the safer result subsumes"), but not
/// vice versa.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum SandboxSafetyLevel {
    Unmonitored,
    Monitored,
}

impl SandboxSafetyLevel {
    /// All levels that are safer-than-or-equal-to `self`, safest first.
    ///
    /// A cache lookup at `self` may accept an entry published under any of
    /// these levels.
    pub fn subsuming_levels(self) -> Vec<SandboxSafetyLevel> {
        use SandboxSafetyLevel::*;
        match self {
            Unmonitored => vec![Monitored, Unmonitored],
            Monitored => vec![Monitored],
        }
    }
}
