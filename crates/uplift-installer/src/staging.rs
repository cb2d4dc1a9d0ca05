use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use uplift_core::{
    is_setup_success_code, ErrorCatalog, ErrorCode, FailureKind, RepairAction,
    StagingDisposition, UpgradeConfig, UpgradeFailure,
};

use crate::download::discard_artifact;
use crate::host::{ImageMounter, InstallerProcess, RepairRunner, SetupLauncher, SystemProbe};

/// Keeps setup from restarting the machine on its own. Always passed; the
/// orchestrator decides on the restart after its triggers are registered.
pub const NO_REBOOT_FLAG: &str = "/noreboot";

const INSTALLER_CANDIDATES: [&str; 2] = ["setup.exe", "sources/setup.exe"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub exit_code: ErrorCode,
    pub attempts: u32,
    pub repairs: Vec<RepairAction>,
}

/// Unattended upgrade arguments. `auto_reboot` has no say here.
pub fn setup_arguments(config: &UpgradeConfig) -> Vec<String> {
    let dynamic_update = if config.dynamic_update {
        "enable"
    } else {
        "disable"
    };
    vec![
        "/auto".to_string(),
        "upgrade".to_string(),
        "/quiet".to_string(),
        "/eula".to_string(),
        "accept".to_string(),
        "/dynamicupdate".to_string(),
        dynamic_update.to_string(),
        "/copylogs".to_string(),
        config.setup_log_dir().display().to_string(),
        NO_REBOOT_FLAG.to_string(),
    ]
}

pub fn locate_installer(volume_root: &Path) -> Result<PathBuf> {
    INSTALLER_CANDIDATES
        .iter()
        .map(|candidate| volume_root.join(candidate))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            UpgradeFailure::new(
                FailureKind::InstallerMissing,
                format!("setup.exe not found on mounted volume {}", volume_root.display()),
            )
            .into()
        })
}

pub struct StagingExecutor<'a> {
    config: &'a UpgradeConfig,
    catalog: &'a ErrorCatalog,
    probe: &'a dyn SystemProbe,
    mounter: &'a dyn ImageMounter,
    launcher: &'a dyn SetupLauncher,
    repair: &'a dyn RepairRunner,
}

impl<'a> StagingExecutor<'a> {
    pub fn new(
        config: &'a UpgradeConfig,
        catalog: &'a ErrorCatalog,
        probe: &'a dyn SystemProbe,
        mounter: &'a dyn ImageMounter,
        launcher: &'a dyn SetupLauncher,
        repair: &'a dyn RepairRunner,
    ) -> Self {
        Self {
            config,
            catalog,
            probe,
            mounter,
            launcher,
            repair,
        }
    }

    /// Runs setup from `image` until it succeeds or the failure is final.
    ///
    /// A catalog entry decides what happens after a failed attempt:
    /// `Escalate` stops at once, `Redownload` discards the image and calls
    /// `reacquire` for a fresh one, and a recoverable entry with a repair
    /// action gets that repair once before the next attempt. Attempts never
    /// exceed `stage_attempts`.
    pub fn stage<F>(&self, image: &Path, mut reacquire: F) -> Result<StageReport>
    where
        F: FnMut() -> Result<PathBuf>,
    {
        let max_attempts = self.config.stage_attempts.max(1);
        let mut image = image.to_path_buf();
        let mut repaired_codes: Vec<ErrorCode> = Vec::new();
        let mut repairs = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(attempt, max_attempts, image = %image.display(), "staging attempt");
            let code = self.run_attempt(&image)?;
            if is_setup_success_code(code) {
                info!(attempt, exit_code = %code, "setup staged the upgrade");
                return Ok(StageReport {
                    exit_code: code,
                    attempts: attempt,
                    repairs,
                });
            }

            warn!(attempt, exit_code = %code, "setup failed: {}", self.catalog.describe(code));
            let entry = self.catalog.lookup(code);
            match entry.map(|entry| entry.disposition).unwrap_or_default() {
                StagingDisposition::Escalate => {
                    return Err(UpgradeFailure::with_code(
                        FailureKind::Escalated,
                        code,
                        "blocked by installed software or drivers; needs technician review",
                    )
                    .into());
                }
                StagingDisposition::Redownload => {
                    warn!("setup reported corrupt source media; discarding image");
                    discard_artifact(&image)?;
                    if attempt >= max_attempts {
                        return Err(UpgradeFailure::with_code(
                            FailureKind::Staging,
                            code,
                            format!(
                                "source media corrupt after {attempt} attempt(s); image discarded so the next run downloads it again"
                            ),
                        )
                        .into());
                    }
                    image = reacquire().context("failed to re-download corrupt image")?;
                    continue;
                }
                StagingDisposition::Standard => {}
            }

            let Some(action) = entry
                .filter(|entry| entry.recoverable)
                .and_then(|entry| entry.repair)
            else {
                return Err(UpgradeFailure::with_code(
                    FailureKind::Staging,
                    code,
                    format!("setup failed with a non-recoverable exit code on attempt {attempt}"),
                )
                .into());
            };
            if repaired_codes.contains(&code) {
                return Err(UpgradeFailure::with_code(
                    FailureKind::Staging,
                    code,
                    format!(
                        "setup failed again after repair '{}'; escalating",
                        action.as_str()
                    ),
                )
                .into());
            }
            if attempt >= max_attempts {
                return Err(UpgradeFailure::with_code(
                    FailureKind::Staging,
                    code,
                    format!("setup failed on the last of {max_attempts} attempt(s)"),
                )
                .into());
            }

            info!(action = action.as_str(), exit_code = %code, "running repair before retry");
            if let Err(err) = self.repair.run_repair(action) {
                return Err(UpgradeFailure::with_code(
                    FailureKind::Staging,
                    code,
                    format!("repair '{}' failed: {err:#}", action.as_str()),
                )
                .into());
            }
            repaired_codes.push(code);
            repairs.push(action);
            if !image.exists() {
                image = reacquire().context("failed to re-download image after repair")?;
            }
        }
    }

    fn run_attempt(&self, image: &Path) -> Result<ErrorCode> {
        let root = match self.mounter.mount(image) {
            Ok(root) => root,
            Err(err) => {
                return Err(UpgradeFailure::new(
                    FailureKind::MountFailed,
                    format!("failed to mount {}: {err:#}", image.display()),
                )
                .into());
            }
        };
        debug!(root = %root.display(), "image mounted");

        let outcome = self.launch_and_wait(&root);
        let dismount = self.mounter.dismount(image);

        match (outcome, dismount) {
            (Ok(code), Ok(())) => Ok(code),
            (Err(err), Ok(())) => Err(err),
            (Ok(code), Err(dismount_err)) => {
                warn!(error = %format!("{dismount_err:#}"), "failed to dismount image");
                Ok(code)
            }
            (Err(err), Err(dismount_err)) => {
                warn!(error = %format!("{dismount_err:#}"), "failed to dismount image");
                Err(err)
            }
        }
    }

    fn launch_and_wait(&self, volume_root: &Path) -> Result<ErrorCode> {
        let setup = locate_installer(volume_root)?;
        let log_dir = self.config.setup_log_dir();
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create setup log dir: {}", log_dir.display()))?;

        let args = setup_arguments(self.config);
        info!(program = %setup.display(), args = %args.join(" "), "launching setup");
        let mut process = self.launcher.launch(&setup, &args).map_err(|err| {
            UpgradeFailure::new(
                FailureKind::Staging,
                format!("failed to launch {}: {err:#}", setup.display()),
            )
        })?;
        self.wait_for_exit(process.as_mut())
    }

    /// Polls until setup exits. Neither the published progress nor the
    /// child's CPU time moving for the stall window kills the child.
    fn wait_for_exit(&self, process: &mut dyn InstallerProcess) -> Result<ErrorCode> {
        let stall_timeout = self.config.stage_stall_timeout();
        let poll_interval = self.config.stage_poll_interval();
        let mut last_progress = self.probe.setup_progress();
        let mut last_cpu = process.cpu_time();
        let mut last_activity = Instant::now();

        loop {
            if let Some(status) = process
                .try_wait()
                .context("failed to poll setup process")?
            {
                let code = ErrorCode::from_exit_status(status);
                info!(pid = process.id(), exit_code = %code, "setup exited");
                return Ok(code);
            }

            let progress = self.probe.setup_progress();
            let cpu = process.cpu_time();
            if progress != last_progress || cpu != last_cpu {
                if progress != last_progress {
                    if let Some(percent) = progress {
                        info!(percent, "setup progress");
                    }
                }
                last_progress = progress;
                last_cpu = cpu;
                last_activity = Instant::now();
            } else if last_activity.elapsed() >= stall_timeout {
                warn!(
                    pid = process.id(),
                    stalled_secs = last_activity.elapsed().as_secs(),
                    "setup shows no activity; killing it"
                );
                if let Err(err) = process.kill() {
                    warn!(error = %format!("{err:#}"), "failed to kill stalled setup");
                }
                return Err(UpgradeFailure::new(
                    FailureKind::StagingStalled,
                    format!(
                        "setup made no progress for {} minutes and was terminated",
                        stall_timeout.as_secs() / 60
                    ),
                )
                .into());
            }

            thread::sleep(poll_interval);
        }
    }
}
