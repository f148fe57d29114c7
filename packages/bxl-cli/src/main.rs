//! The binary entrypoint for `bxl`, a reference pip executor: the two-phase
//! fingerprint cache plus a filesystem observation sandbox, wired up as a
//! single-pip command-line runner.

use clap::{Parser, Subcommand, crate_version};
use color_eyre::Result;
use git_version::git_version;
use tracing::instrument;
use tracing_subscriber::util::SubscriberInitExt;

mod cmd;
mod log;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "bxl",
    about = "Hermetic pip execution: cache lookup, sandboxed execution, cache publish",
    version = format!("v{} commit {}", crate_version!(), git_version!(args = ["--always"]))
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run a single process pip through the cache and sandbox.
    Run(cmd::run::Options),

    /// Inspect the on-disk cache.
    #[clap(subcommand)]
    Cache(cmd::cache::Command),
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    let logger = log::make_logger(std::io::stderr, top.color)?;
    logger.init();

    match top.command {
        Command::Run(options) => cmd::run::exec(options).await,
        Command::Cache(cmd) => match cmd {
            cmd::cache::Command::Show(options) => cmd::cache::show(options).await,
        },
    }
}
