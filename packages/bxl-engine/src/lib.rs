//! The Pip Executor and its supporting collaborators (§4.6, §4.7, §5, §6):
//! `BuildContext`, the `PipGraph`/`IpcProvider` collaborator traits, the
//! File Content Manager, the execution log, materialization fan-out, and
//! the executor state machine itself.

pub mod context;
pub mod executor;
pub mod file_content_manager;
pub mod graph;
pub mod ipc;
pub mod log;
pub mod worker_pool;

pub use context::{BuildContext, BuildFlags};
pub use executor::{CacheLookupStats, ExecutionOutcome, PipExecutionResult, PipState, execute_pip};
pub use file_content_manager::{FileContentManager, OutputOrigin};
pub use graph::{InMemoryPipGraph, PipGraph};
pub use ipc::{IpcProvider, StaticIpcProvider};
pub use worker_pool::{MaterializeRequest, materialize_all};
