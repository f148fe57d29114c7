//! `BuildContext` (§9's "single `BuildContext` value instead of global
//! mutable environment"): the build-session-wide configuration and
//! collaborator handles every pip execution reads from.
//!
//! Grounded on the teacher's `DaemonContext`/`IdleState` shape
//! (`hurry/src/daemon.rs`): a small `Clone`able struct of `Arc`-wrapped
//! collaborators plus plain config flags, passed by value into async
//! workers rather than threaded through thread-locals or globals.

use std::sync::Arc;

use bxl_cas::Store as CasStore;
use bxl_tpfs::Store as TpfsStore;
use bxl_types::{MountTable, PreserveOutputsSalt, SandboxSafetyLevel};
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Build-session configuration flags (§4.6 step 3, §9).
#[derive(Clone, Copy, Debug)]
pub struct BuildFlags {
    pub monitor_file_accesses: bool,
    pub preserve_outputs_enabled: bool,
    pub unexpected_accesses_are_errors: bool,
    pub monitoring_violations_fatal: bool,
    pub warnings_cached: bool,
    pub trace_inputs: bool,
    /// Bounded retry count for `retry_exit_codes` (§4.6 step 3): each retry
    /// runs a fresh sandbox with no observations shared across attempts.
    pub max_retries: u32,
}

impl Default for BuildFlags {
    fn default() -> Self {
        Self {
            monitor_file_accesses: true,
            preserve_outputs_enabled: false,
            unexpected_accesses_are_errors: false,
            monitoring_violations_fatal: true,
            warnings_cached: true,
            trace_inputs: false,
            max_retries: 1,
        }
    }
}

/// Everything a pip execution needs beyond its own declaration: the CAS and
/// TPFS collaborators, the mount table, the session's salts and safety
/// level, per-resource semaphores, and a cancellation token (§5's
/// cancellation contract).
///
/// `Clone` is cheap: every field is an `Arc` or `Copy` value, matching the
/// teacher's preference for cheaply cloneable context structs passed into
/// spawned tasks by value.
#[derive(Clone)]
pub struct BuildContext {
    pub cas: Arc<CasStore>,
    pub tpfs: Arc<TpfsStore>,
    pub mounts: Arc<MountTable>,
    pub preserve_outputs_salt: PreserveOutputsSalt,
    pub sandbox_safety_level: SandboxSafetyLevel,
    pub flags: BuildFlags,
    /// Keyed by the pip's declared semaphore name (§6 `Process.semaphore_requirements`).
    semaphores: Arc<DashMap<String, Arc<Semaphore>>>,
    pub cancellation: CancellationToken,
}

impl BuildContext {
    pub fn new(
        cas: Arc<CasStore>,
        tpfs: Arc<TpfsStore>,
        mounts: Arc<MountTable>,
        preserve_outputs_salt: PreserveOutputsSalt,
        sandbox_safety_level: SandboxSafetyLevel,
        flags: BuildFlags,
    ) -> Self {
        Self {
            cas,
            tpfs,
            mounts,
            preserve_outputs_salt,
            sandbox_safety_level,
            flags,
            semaphores: Arc::new(DashMap::new()),
            cancellation: CancellationToken::new(),
        }
    }

    /// Returns the named semaphore, creating it with `count` permits on
    /// first use. A pip that later requests a different count for the same
    /// name keeps using whatever permit count was established first — the
    /// first declaration wins, matching a process-wide resource pool rather
    /// than a per-pip one.
    pub fn semaphore(&self, name: &str, count: u32) -> Arc<Semaphore> {
        self.semaphores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(count as usize)))
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn context() -> BuildContext {
        BuildContext::new(
            Arc::new(CasStore::new(bxl_cas::local::LocalCasSite::new(std::env::temp_dir()), None)),
            Arc::new(TpfsStore::new(bxl_tpfs::local::LocalTpfs::in_memory().unwrap(), None)),
            Arc::new(MountTable::default()),
            PreserveOutputsSalt::default(),
            SandboxSafetyLevel::Monitored,
            BuildFlags::default(),
        )
    }

    #[test]
    fn same_semaphore_name_returns_the_same_instance() {
        let ctx = context();
        let a = ctx.semaphore("network", 4);
        let b = ctx.semaphore("network", 4);
        assert_eq!(Arc::strong_count(&a), 3);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn fresh_context_is_not_cancelled() {
        let ctx = context();
        assert!(!ctx.is_cancelled());
    }
}
