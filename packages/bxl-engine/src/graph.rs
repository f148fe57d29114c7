//! The pip graph collaborator (§6): "an immutable collection of pips and
//! dependency edges. The core consumes traversal only."
//!
//! Modeled as a trait rather than a concrete graph type, per §9's redesign
//! note favoring "explicit channels and shared index tables" over the
//! upstream scheduler's own graph data structures — callers own their graph
//! representation and the pip executor only ever needs three operations.

use bxl_types::{Pip, PipId};

/// Read-only traversal over a frozen pip graph.
pub trait PipGraph: Send + Sync {
    fn pip(&self, id: PipId) -> Option<&Pip>;

    /// `order_only_dependencies` plus any input/output producer edges the
    /// caller's scheduler derived; the executor itself never computes edges,
    /// it only waits on whatever this reports.
    fn dependencies(&self, id: PipId) -> &[PipId];

    fn all_pip_ids(&self) -> Vec<PipId>;
}

/// A simple in-memory graph backed by a sorted `Vec`, sufficient for single-
/// process builds and for exercising the executor in tests without a real
/// scheduler.
pub struct InMemoryPipGraph {
    pips: Vec<Pip>,
    dependencies: std::collections::HashMap<PipId, Vec<PipId>>,
}

impl InMemoryPipGraph {
    pub fn new(pips: Vec<Pip>, dependencies: std::collections::HashMap<PipId, Vec<PipId>>) -> Self {
        Self { pips, dependencies }
    }
}

impl PipGraph for InMemoryPipGraph {
    fn pip(&self, id: PipId) -> Option<&Pip> {
        self.pips.iter().find(|p| p.id == id)
    }

    fn dependencies(&self, id: PipId) -> &[PipId] {
        self.dependencies.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn all_pip_ids(&self) -> Vec<PipId> {
        self.pips.iter().map(|p| p.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use bxl_types::pip::{PipKind, ProcessOptions, ProcessPip};
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_pip(id: u64) -> Pip {
        Pip {
            id: PipId(id),
            declared_file_inputs: vec![],
            declared_directory_inputs: vec![],
            order_only_dependencies: vec![],
            declared_outputs: vec![],
            declared_directory_outputs: vec![],
            kind: PipKind::Process(ProcessPip {
                executable: "/bin/true".into(),
                arguments: vec![],
                environment: vec![],
                pass_through_env: vec![],
                working_dir: "/".into(),
                untracked_paths: vec![],
                untracked_scopes: vec![],
                success_exit_codes: vec![0],
                retry_exit_codes: vec![],
                uncacheable_exit_codes: vec![],
                warning_regex: None,
                error_regex: None,
                semaphore_requirements: vec![],
                timeout: None,
                options: ProcessOptions::NONE,
            }),
        }
    }

    #[test]
    fn looks_up_pips_by_id() {
        let graph = InMemoryPipGraph::new(vec![sample_pip(1), sample_pip(2)], Default::default());
        assert!(graph.pip(PipId(1)).is_some());
        assert!(graph.pip(PipId(3)).is_none());
    }

    #[test]
    fn reports_declared_dependencies() {
        let mut deps = std::collections::HashMap::new();
        deps.insert(PipId(2), vec![PipId(1)]);
        let graph = InMemoryPipGraph::new(vec![sample_pip(1), sample_pip(2)], deps);
        assert_eq!(graph.dependencies(PipId(2)), &[PipId(1)]);
        assert_eq!(graph.dependencies(PipId(1)), &[] as &[PipId]);
    }
}
