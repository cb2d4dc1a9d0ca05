use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::warn;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "uplift.log";

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "warn,uplift=debug"
    } else {
        "warn,uplift=info"
    }
}

pub fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(LOG_FILE_NAME)
}

/// Installs the global subscriber: stderr plus an append-only file under
/// `log_dir`. A log file that cannot be opened leaves stderr only.
pub fn init(log_dir: &Path, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let (file_layer, file_error) = match open_log_file(log_dir) {
        Ok(file) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Err(err) => (None, Some(err)),
    };
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("uplift: logging already initialized: {err}");
        return;
    }

    if let Some(err) = file_error {
        warn!(error = %format!("{err:#}"), "log file unavailable; logging to stderr only");
    }
}

fn open_log_file(log_dir: &Path) -> Result<File> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir: {}", log_dir.display()))?;
    let path = log_file_path(log_dir);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file: {}", path.display()))
}
