//! Logging initialization
//!
//! Events go to stderr; entry points that own a run additionally append to a
//! per-entry-point log file in the output directory so compute-node activity
//! survives the allocation.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

fn env_filter(verbose: bool) -> EnvFilter {
    let log_level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

/// Initialize tracing for this process.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            let file_layer = fmt::layer().with_ansi(false).with_writer(Arc::new(file));
            tracing_subscriber::registry()
                .with(env_filter(verbose))
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter(verbose))
                .with(stderr_layer)
                .init();
        }
    }
    Ok(())
}
