use clap::Subcommand;
use color_eyre::Result;
use color_eyre::eyre::Context as _;
use humansize::{DECIMAL, format_size};
use tracing::instrument;

use crate::cmd::StateOptions;

#[derive(Clone, Subcommand)]
pub enum Command {
    /// Report on-disk size of the content-addressed store and the
    /// two-phase fingerprint store.
    Show(StateOptions),
}

#[instrument]
pub async fn show(options: StateOptions) -> Result<()> {
    let cas_dir = options.state_dir.join("cas");
    let tpfs_path = options.state_dir.join("tpfs.sqlite3");

    let (cas_entries, cas_bytes) = directory_totals(&cas_dir).await.context("inspect cas directory")?;
    let tpfs_bytes = tokio::fs::metadata(&tpfs_path).await.map(|m| m.len()).unwrap_or(0);

    println!("state dir: {}", options.state_dir.display());
    println!("cas: {} blobs, {}", cas_entries, format_size(cas_bytes, DECIMAL));
    println!("tpfs store: {}", format_size(tpfs_bytes, DECIMAL));
    Ok(())
}

async fn directory_totals(dir: &std::path::Path) -> Result<(u64, u64)> {
    if !dir.exists() {
        return Ok((0, 0));
    }

    let mut entries = 0u64;
    let mut bytes = 0u64;
    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            entries += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok((entries, bytes))
}
