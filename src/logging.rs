use std::fs;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_DIRECTORY: &str = "logs";
const LOG_FILE_PREFIX: &str = "certd.log";

/// Set up logging to file and console. The returned guard must stay alive
/// for the lifetime of the process to keep the file writer flushing.
pub fn init(debug: bool, verbose: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(LOG_DIRECTORY).context("Failed to create logs directory")?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, LOG_DIRECTORY, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if debug {
        "certd=debug"
    } else if verbose {
        "certd=info"
    } else {
        "certd=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .init();
    Ok(guard)
}
