mod logging;
mod orchestrator;
mod self_repair;

use std::env;
use std::path::{Path, PathBuf};
use std::process::{self, Command};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{debug, error, info, warn};
use uplift_core::{ErrorCatalog, FailureKind, FailureRecord, UpgradeConfig, UpgradeFailure};
use uplift_installer::{Registrar, SchtasksScheduler, TaskScheduler, WindowsHost};
use uplift_state::{InstanceLock, LockOutcome, StateStore};

use crate::orchestrator::Orchestrator;

const CONFIG_ENV: &str = "UPLIFT_CONFIG";
const DEFAULT_EXE_NAME: &str = "uplift.exe";

#[derive(Parser, Debug)]
#[command(name = "uplift")]
#[command(about = "Unattended Windows 10 to Windows 11 in-place upgrade", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
    /// Configuration file; falls back to $UPLIFT_CONFIG, then the work dir
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let config_path = resolve_config_path(
        cli.config,
        env::var_os(CONFIG_ENV).map(PathBuf::from),
        UpgradeConfig::default_path(),
    );
    let loaded = match &config_path {
        Some(path) => UpgradeConfig::load(path),
        None => Ok(UpgradeConfig::default()),
    };
    let (config, config_error) = match loaded {
        Ok(config) => (config, None),
        Err(err) => (UpgradeConfig::default(), Some(err)),
    };

    logging::init(&config.log_dir(), cli.verbose);
    let scheduler = SchtasksScheduler;
    let entry = entry_command(config_path.as_deref());
    let fail = |context: &str, err: &anyhow::Error| {
        startup_failure(&config, &scheduler, &entry, context, err)
    };
    if let Some(err) = config_error {
        return fail("configuration could not be loaded", &err);
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "built-in defaults".to_string()),
        "uplift starting"
    );

    let catalog = match load_catalog(&config) {
        Ok(catalog) => catalog,
        Err(err) => return fail("error catalog could not be loaded", &err),
    };

    let store = StateStore::open(config.state_dir());
    let lock_file = store.layout().lock_file_path();
    let _lock = match InstanceLock::acquire(&config.lock_name, &lock_file, peer_instance_running) {
        Ok(LockOutcome::Acquired(lock)) => {
            debug!(lock = lock.describe(), "instance lock held");
            lock
        }
        Ok(LockOutcome::HeldElsewhere(holder)) => {
            info!(%holder, "another instance is running; exiting");
            return 0;
        }
        Err(err) => return fail("instance lock could not be acquired", &err),
    };

    let windows = match WindowsHost::new(&config) {
        Ok(windows) => windows,
        Err(err) => return fail("host services could not be initialized", &err),
    };
    let orchestrator = Orchestrator::new(&config, &catalog, &store, windows.host(), entry);

    let outcome = orchestrator.run_guarded();
    let exit_code = outcome.exit_code();
    info!(outcome = outcome.as_str(), exit_code, "run finished");
    exit_code
}

/// `--config`, then the environment, then the default file when it exists.
/// `None` means built-in defaults.
fn resolve_config_path(
    explicit: Option<PathBuf>,
    from_env: Option<PathBuf>,
    default_path: PathBuf,
) -> Option<PathBuf> {
    explicit
        .or_else(|| from_env.filter(|path| !path.as_os_str().is_empty()))
        .or_else(|| default_path.is_file().then_some(default_path))
}

fn load_catalog(config: &UpgradeConfig) -> Result<ErrorCatalog> {
    match ErrorCatalog::resolve(config.error_catalog_path.as_deref()) {
        Ok(catalog) => Ok(catalog),
        Err(err) => {
            warn!(
                error = %format!("{err:#}"),
                "external error catalog unusable; using the built-in one"
            );
            ErrorCatalog::builtin()
        }
    }
}

/// Records a failure that happened before the orchestrator could run and
/// leaves the boot-time trigger in place so the next boot tries again.
fn startup_failure(
    config: &UpgradeConfig,
    scheduler: &dyn TaskScheduler,
    entry: &str,
    context: &str,
    err: &anyhow::Error,
) -> i32 {
    let failure = UpgradeFailure::new(FailureKind::Unexpected, format!("{context}: {err:#}"));
    error!(error = %format!("{err:#}"), "{context}");
    let record = FailureRecord {
        failed_at: Utc::now(),
        reason: failure.to_string(),
        code: Some(failure.code),
    };
    if let Err(write_err) = StateStore::open(config.state_dir()).write_failure(&record) {
        error!(error = %format!("{write_err:#}"), "failed to write failure marker");
    }
    if let Err(register_err) =
        Registrar::new(config, scheduler, entry).register_post_reboot_validation()
    {
        warn!(
            error = %format!("{register_err:#}"),
            "post-reboot validation could not be registered"
        );
    }
    failure.code.as_exit_code()
}

/// Command line the scheduled triggers use to run this binary again.
fn entry_command(config_path: Option<&Path>) -> String {
    let exe = env::current_exe().unwrap_or_else(|err| {
        warn!(error = %err, "current executable path unavailable");
        PathBuf::from(DEFAULT_EXE_NAME)
    });
    let mut command = format!("\"{}\"", exe.display());
    if let Some(path) = config_path {
        command.push_str(&format!(" --config \"{}\"", path.display()));
    }
    command
}

/// Last-resort instance check used when neither the mutex nor the lock file
/// is available.
fn peer_instance_running() -> Result<bool> {
    let exe_name = env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_else(|| DEFAULT_EXE_NAME.to_string());

    let output = if cfg!(windows) {
        Command::new("tasklist")
            .args(["/FO", "CSV", "/NH", "/FI"])
            .arg(format!("IMAGENAME eq {exe_name}"))
            .output()
    } else {
        Command::new("pgrep").arg("-x").arg(&exe_name).output()
    }
    .context("failed to list running processes")?;

    let listing = String::from_utf8_lossy(&output.stdout);
    Ok(listing_has_peer(&listing, process::id()))
}

/// True when a process listing (`tasklist` CSV or one PID per line) names a
/// PID other than `own_pid`.
fn listing_has_peer(listing: &str, own_pid: u32) -> bool {
    listing
        .lines()
        .filter_map(|line| {
            line.split(',')
                .map(|field| field.trim().trim_matches('"'))
                .find_map(|field| field.parse::<u32>().ok())
        })
        .any(|pid| pid != own_pid)
}

#[cfg(test)]
mod tests;
