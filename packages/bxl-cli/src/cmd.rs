use clap::Args;

pub mod cache;
pub mod run;

/// Options shared across commands that need a build session: where the CAS
/// and TPFS state lives on disk.
#[derive(Clone, Args, Debug)]
pub struct StateOptions {
    /// Directory holding the content-addressed store and the two-phase
    /// fingerprint store. Created on first use.
    #[arg(long = "state-dir", env = "BXL_STATE_DIR", default_value = ".bxl")]
    pub state_dir: std::path::PathBuf,
}
