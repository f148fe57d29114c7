use clap::ValueEnum;
use color_eyre::Result;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{Layer as _, fmt::MakeWriter, layer::SubscriberExt as _};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum WhenColor {
    Always,
    Never,
    Auto,
}

pub fn make_logger<W>(writer: W, color: WhenColor) -> Result<impl tracing::Subscriber>
where
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    let logger = tracing_subscriber::registry().with(ErrorLayer::default()).with({
        let layer = tracing_subscriber::fmt::layer()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(writer)
            .pretty();
        match color {
            WhenColor::Always => layer.with_ansi(true),
            WhenColor::Never => layer.with_ansi(false),
            WhenColor::Auto => layer,
        }
        .with_filter(tracing_subscriber::EnvFilter::builder().with_env_var("BXL_LOG").from_env_lossy())
    });

    Ok(logger)
}
