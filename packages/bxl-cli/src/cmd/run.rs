//! `bxl run`: execute a single process pip through the full two-phase
//! fingerprint cache and report whether it was a cache hit, a fresh
//! execution, or a cache-deployed convergence.

use std::path::PathBuf;
use std::sync::Arc;

use bxl_cas::Store as CasStore;
use bxl_cas::local::LocalCasSite;
use bxl_engine::{BuildContext, BuildFlags, ExecutionOutcome, FileContentManager, execute_pip};
use bxl_sandbox::driver::{ProcessSpec, SandboxDriver, SandboxRun};
use bxl_sandbox::manifest::FileAccessManifest;
use bxl_tpfs::Store as TpfsStore;
use bxl_tpfs::local::LocalTpfs;
use bxl_types::pip::{DeclaredOutput, PipKind, ProcessPip};
use bxl_types::{ExistenceAttribute, FileArtifact, MountTable, Pip, PipId, PreserveOutputsSalt, SandboxSafetyLevel};
use clap::Args;
use color_eyre::Result;
use color_eyre::eyre::{Context as _, eyre};
use tracing::instrument;

use crate::cmd::StateOptions;

/// Options for `bxl run`.
#[derive(Clone, Args, Debug)]
pub struct Options {
    #[command(flatten)]
    pub state: StateOptions,

    /// File this invocation is expected to produce. May be repeated; every
    /// one must exist after the process exits or the pip fails validation.
    #[arg(long = "output", short = 'o')]
    pub outputs: Vec<PathBuf>,

    /// The program to run.
    pub executable: PathBuf,

    /// Arguments passed through to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub arguments: Vec<String>,
}

/// Runs the child process directly rather than through a loader-injected
/// interposition library: no `.so` ships with this binary, so every access
/// goes unreported and the pip is fingerprinted on its declared outputs
/// alone. Mirrors `bxl_sandbox::driver::PtraceFallback`'s documented
/// degrade-to-unsandboxed posture, minus the FIFO handshake neither side
/// would ever complete without a real interposition mechanism attached.
struct UnmonitoredDriver;

impl SandboxDriver for UnmonitoredDriver {
    async fn run(&self, spec: &ProcessSpec, _manifest: &FileAccessManifest, _fifo_dir: &std::path::Path, _pip_id: u64) -> color_eyre::Result<SandboxRun> {
        let mut command = tokio::process::Command::new(&spec.executable);
        command
            .args(&spec.arguments)
            .current_dir(&spec.working_dir)
            .envs(spec.environment.iter().cloned())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let wait = command.output();
        let (output, timed_out) = match spec.timeout {
            Some(duration) => match tokio::time::timeout(duration, wait).await {
                Ok(result) => (result.context("run process")?, false),
                Err(_) => {
                    return Ok(SandboxRun {
                        events: Vec::new(),
                        exit_code: None,
                        timed_out: true,
                        stdout: Vec::new(),
                        stderr: Vec::new(),
                    });
                }
            },
            None => (wait.await.context("run process")?, false),
        };

        Ok(SandboxRun {
            events: Vec::new(),
            exit_code: output.status.code(),
            timed_out,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<()> {
    tokio::fs::create_dir_all(&options.state.state_dir).await.context("create state dir")?;
    let cas_dir = options.state.state_dir.join("cas");
    let tpfs_path = options.state.state_dir.join("tpfs.sqlite3");

    let cas = Arc::new(CasStore::new(LocalCasSite::new(cas_dir), None));
    let tpfs = Arc::new(TpfsStore::new(LocalTpfs::open(&tpfs_path).context("open tpfs store")?, None));
    let ctx = BuildContext::new(cas, tpfs, Arc::new(MountTable::default()), PreserveOutputsSalt::default(), SandboxSafetyLevel::Monitored, BuildFlags::default());

    let pip = Pip {
        id: PipId(1),
        declared_file_inputs: Vec::new(),
        declared_directory_inputs: Vec::new(),
        order_only_dependencies: Vec::new(),
        declared_outputs: options
            .outputs
            .iter()
            .map(|path| DeclaredOutput {
                artifact: FileArtifact::output(path.clone(), 1),
                existence: ExistenceAttribute::Required,
            })
            .collect(),
        declared_directory_outputs: Vec::new(),
        kind: PipKind::Process(
            ProcessPip::builder()
                .executable(options.executable)
                .arguments(options.arguments)
                .pass_through_env(vec!["PATH".into()])
                .working_dir(std::env::current_dir().context("resolve working dir")?)
                .build(),
        ),
    };

    let manifest = FileAccessManifest::new();
    let driver = UnmonitoredDriver;
    let fcm = FileContentManager::new();

    let result = execute_pip(&ctx, &pip, None, &manifest, &driver, &fcm, &options.state.state_dir).await;

    match result.outcome {
        ExecutionOutcome::Succeeded => println!("succeeded (cacheable = {})", result.cacheable),
        ExecutionOutcome::UpToDate => println!("up to date, nothing ran"),
        ExecutionOutcome::DeployedFromCache => println!("deployed from cache"),
        ExecutionOutcome::Failed => {
            let message = result.error.map(|e| e.to_string()).unwrap_or_else(|| "pip failed".into());
            return Err(eyre!(message));
        }
    }

    println!(
        "cache lookup visited {} entries ({} absent)",
        result.cache_stats.visited_entries, result.cache_stats.visited_absent_entries
    );
    Ok(())
}
