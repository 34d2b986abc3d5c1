//! Console logging setup.

use std::io;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Installs the tracing subscriber and the `log` crate bridge. The
/// `RUST_LOG` environment variable overrides the verbosity flag.
pub fn init(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(verbose)
                .with_filter(filter),
        )
        .try_init()?;
    tracing_log::LogTracer::init()?;
    Ok(())
}
