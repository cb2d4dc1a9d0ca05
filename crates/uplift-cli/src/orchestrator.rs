use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uplift_core::{
    ErrorCatalog, ErrorCode, FailureKind, FailureRecord, PendingRebootRecord, Phase, PhaseRecord,
    ReminderMode, ScriptRunningRecord, UpgradeConfig, UpgradeFailure,
};
use uplift_installer::{
    check_hardware_requirements, check_security_agent, discard_artifact, ensure_disk_space,
    AgentCheck, Downloader, Host, Notice, Registrar, StageReport, StagingExecutor,
};
use uplift_state::StateStore;

use crate::self_repair;

const RESTART_REASON: &str = "Windows 11 upgrade staged; restarting to finish installation";

/// How one invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The machine already runs the target build; leftovers were removed.
    Completed,
    Staged { exit_code: ErrorCode },
    /// Staged earlier; still waiting for the user to reboot.
    AwaitingReboot,
    /// An interrupted run was detected and staged again.
    Repaired { exit_code: ErrorCode },
    /// A gate refused the upgrade.
    Blocked(UpgradeFailure),
    Failed(UpgradeFailure),
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Staged { .. } => "staged",
            Self::AwaitingReboot => "awaiting_reboot",
            Self::Repaired { .. } => "repaired",
            Self::Blocked(_) => "blocked",
            Self::Failed(_) => "failed",
        }
    }

    /// Process exit status: 0 for every non-failure, the catalog code
    /// otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Blocked(failure) | Self::Failed(failure) => failure.code.as_exit_code(),
            _ => 0,
        }
    }
}

/// Recovers the classified failure carried by `err`, or wraps the whole
/// error chain as an unexpected one.
pub(crate) fn classify(err: &anyhow::Error) -> UpgradeFailure {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<UpgradeFailure>())
        .cloned()
        .unwrap_or_else(|| UpgradeFailure::new(FailureKind::Unexpected, format!("{err:#}")))
}

/// Failure classes worth another attempt from the boot-time trigger.
fn retry_on_next_boot(kind: FailureKind) -> bool {
    matches!(
        kind,
        FailureKind::Unexpected | FailureKind::StateCorrupt | FailureKind::DownloadTransport
    )
}

pub struct Orchestrator<'a> {
    config: &'a UpgradeConfig,
    catalog: &'a ErrorCatalog,
    store: &'a StateStore,
    host: Host<'a>,
    registrar: Registrar<'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a UpgradeConfig,
        catalog: &'a ErrorCatalog,
        store: &'a StateStore,
        host: Host<'a>,
        entry_command: impl Into<String>,
    ) -> Self {
        Self {
            config,
            catalog,
            store,
            host,
            registrar: Registrar::new(config, host.scheduler, entry_command),
        }
    }

    /// Runs one invocation and settles every error or panic into a failure
    /// outcome. Never panics itself.
    pub fn run_guarded(&self) -> RunOutcome {
        let err = match panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(err)) => err,
            Err(payload) => anyhow!("orchestrator panicked: {}", panic_message(payload.as_ref())),
        };

        let failure = classify(&err);
        if failure.kind == FailureKind::Unexpected {
            error!(error = %format!("{err:#}"), "unexpected failure");
        } else {
            error!(
                kind = failure.kind.as_str(),
                code = %failure.code,
                detail = %failure.detail,
                "upgrade run failed"
            );
        }

        if panic::catch_unwind(AssertUnwindSafe(|| self.settle_failure(&failure))).is_err() {
            error!("failure handling panicked; exiting with the recorded code");
        }
        if failure.kind.is_gate() {
            RunOutcome::Blocked(failure)
        } else {
            RunOutcome::Failed(failure)
        }
    }

    /// One pass of the upgrade state machine. Classified failures come back
    /// as `Err` carrying an [`UpgradeFailure`].
    pub fn run(&self) -> Result<RunOutcome> {
        let current_boot = self.current_boot();
        let state = self
            .store
            .read_state()
            .map_err(|err| UpgradeFailure::new(FailureKind::StateCorrupt, format!("{err:#}")))?;
        debug!(phase = state.as_ref().map(|record| record.phase().as_str()), "state loaded");

        if let AgentCheck::Blocked(reason) =
            check_security_agent(self.host.probe, &self.config.security_agent)
        {
            return Err(UpgradeFailure::new(FailureKind::SecurityAgent, reason).into());
        }

        let state = match state {
            Some(PhaseRecord::UpgradeFailed(previous)) => {
                info!(reason = %previous.reason, "previous run failed; starting a clean triage");
                self.best_effort("failure cleanup", self.host.cleanup.failure_cleanup());
                self.store.clear_failure()?;
                None
            }
            other => other,
        };

        let build = self
            .host
            .probe
            .os_build()
            .context("failed to read the running OS build")?;
        if build >= self.config.target_build {
            info!(build, target = self.config.target_build, "target build reached");
            self.complete(state.is_some())?;
            return Ok(RunOutcome::Completed);
        }
        debug!(build, target = self.config.target_build, "upgrade still required");

        let tolerance = self.config.boot_tolerance();
        let outcome = match state {
            Some(PhaseRecord::PendingReboot(record)) => {
                if self_repair::needs_repair(
                    Phase::PendingReboot,
                    record.last_boot,
                    current_boot,
                    tolerance,
                ) {
                    self_repair::repair(self, Phase::PendingReboot, current_boot)?
                } else {
                    self.await_reboot(&record)
                }
            }
            Some(PhaseRecord::ScriptRunning(record))
                if self_repair::needs_repair(
                    Phase::ScriptRunning,
                    record.last_boot,
                    current_boot,
                    tolerance,
                ) =>
            {
                self_repair::repair(self, Phase::ScriptRunning, current_boot)?
            }
            _ => {
                let report = self.stage_pipeline(current_boot)?;
                self.finish_staging(current_boot)?;
                RunOutcome::Staged {
                    exit_code: report.exit_code,
                }
            }
        };

        if matches!(
            outcome,
            RunOutcome::Staged { .. } | RunOutcome::Repaired { .. }
        ) {
            self.maybe_restart();
        }
        Ok(outcome)
    }

    /// Gate, download and stage. Leaves `ScriptRunning` behind on failure;
    /// the caller records the failure.
    pub(crate) fn stage_pipeline(
        &self,
        current_boot: Option<DateTime<Utc>>,
    ) -> Result<StageReport> {
        self.store
            .write_state(&PhaseRecord::ScriptRunning(ScriptRunningRecord {
                started_at: Utc::now(),
                last_boot: current_boot,
                pid: std::process::id(),
            }))?;

        check_hardware_requirements(self.host.probe, self.config)?;

        let work_dir = &self.config.work_dir;
        fs::create_dir_all(work_dir)
            .with_context(|| format!("failed to create work dir: {}", work_dir.display()))?;
        ensure_disk_space(
            self.host.probe,
            self.host.cleanup,
            work_dir,
            self.config.min_free_space_bytes(),
        )?;

        let downloader = Downloader::new(
            self.config,
            self.host.probe,
            self.host.cleanup,
            self.host.primary_transport,
            self.host.fallback_transport,
        );
        let image = downloader.acquire()?;

        let executor = StagingExecutor::new(
            self.config,
            self.catalog,
            self.host.probe,
            self.host.mounter,
            self.host.launcher,
            self.host.repair,
        );
        let report = executor.stage(&image, || downloader.acquire())?;
        info!(
            exit_code = %report.exit_code,
            attempts = report.attempts,
            repairs = report.repairs.len(),
            "upgrade staged"
        );
        Ok(report)
    }

    /// Registers the reboot triggers and records `PendingReboot`.
    pub(crate) fn finish_staging(&self, current_boot: Option<DateTime<Utc>>) -> Result<()> {
        let interactive = self.host.probe.interactive_session();
        let reminder_mode = match self.registrar.register_reminders(interactive) {
            Ok(mode) => mode,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "reboot reminders could not be registered");
                if interactive {
                    ReminderMode::Daily
                } else {
                    ReminderMode::Logon
                }
            }
        };

        self.store
            .write_state(&PhaseRecord::PendingReboot(PendingRebootRecord {
                staged_at: Utc::now(),
                last_boot: current_boot,
                reminder_mode,
            }))?;

        self.best_effort(
            "post-reboot validation",
            self.registrar.register_post_reboot_validation(),
        );
        self.notify(
            Notice::UpgradeStaged,
            "The Windows 11 upgrade is ready. Restart to finish installing.",
        );
        Ok(())
    }

    /// Re-registers the triggers for a staged upgrade and leaves the state
    /// untouched.
    fn await_reboot(&self, record: &PendingRebootRecord) -> RunOutcome {
        match self.registrar.triggers_present() {
            Ok(true) => debug!("reboot triggers present"),
            Ok(false) => warn!("reboot triggers missing; registering them again"),
            Err(err) => warn!(error = %format!("{err:#}"), "could not query reboot triggers"),
        }

        let interactive = self.host.probe.interactive_session();
        self.best_effort(
            "reboot reminders",
            self.registrar.register_reminders(interactive).map(|_| ()),
        );
        self.best_effort(
            "post-reboot validation",
            self.registrar.register_post_reboot_validation(),
        );
        info!(
            staged_at = %record.staged_at.to_rfc3339(),
            reminder_mode = record.reminder_mode.as_str(),
            "upgrade staged; waiting for a reboot"
        );
        self.notify(
            Notice::RebootReminder,
            "Restart your computer to finish the Windows 11 upgrade.",
        );
        RunOutcome::AwaitingReboot
    }

    fn complete(&self, had_state: bool) -> Result<()> {
        self.best_effort("remove reminders", self.registrar.remove_reminders());
        self.best_effort(
            "remove post-reboot validation",
            self.registrar.remove_post_reboot_validation(),
        );
        self.store.clear_state()?;
        self.store.clear_failure()?;
        self.best_effort(
            "discard image",
            discard_artifact(&self.config.iso_path()),
        );
        self.best_effort("completion cleanup", self.host.cleanup.completion_cleanup());
        if had_state {
            self.notify(Notice::UpgradeCompleted, "Windows 11 upgrade complete.");
        }
        info!("completion cleanup finished");
        Ok(())
    }

    fn maybe_restart(&self) {
        if !self.config.auto_reboot {
            info!("automatic reboot disabled; waiting for the user to restart");
            return;
        }
        let delay = Duration::from_secs(self.config.reboot_delay_secs);
        match self.host.power.schedule_restart(delay, RESTART_REASON) {
            Ok(()) => info!(delay_secs = self.config.reboot_delay_secs, "restart scheduled"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to schedule restart"),
        }
    }

    /// Records `failure` and leaves the machine with a retry path. Every
    /// step is best-effort.
    fn settle_failure(&self, failure: &UpgradeFailure) {
        let record = FailureRecord {
            failed_at: Utc::now(),
            reason: failure.marker_text(self.catalog),
            code: Some(failure.code),
        };
        match self.store.write_failure(&record) {
            Ok(()) => info!(code = %failure.code, "failure marker written"),
            Err(err) => error!(error = %format!("{err:#}"), "failed to write failure marker"),
        }

        self.best_effort("remove reminders", self.registrar.remove_reminders());
        self.best_effort("failure cleanup", self.host.cleanup.failure_cleanup());
        if retry_on_next_boot(failure.kind) {
            self.best_effort(
                "post-reboot validation",
                self.registrar.register_post_reboot_validation(),
            );
        } else {
            self.best_effort(
                "remove post-reboot validation",
                self.registrar.remove_post_reboot_validation(),
            );
        }

        let notice = if failure.kind.is_gate() {
            Notice::UpgradeBlocked
        } else {
            Notice::UpgradeFailed
        };
        self.notify(notice, &record.reason);
    }

    pub(crate) fn cleanup_partials(&self) {
        self.best_effort("failure cleanup", self.host.cleanup.failure_cleanup());
    }

    fn current_boot(&self) -> Option<DateTime<Utc>> {
        match self.host.probe.last_boot_time() {
            Ok(boot) => Some(boot),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "last boot time unavailable");
                None
            }
        }
    }

    fn notify(&self, notice: Notice, detail: &str) {
        if let Err(err) = self.host.notifier.notify(notice, detail) {
            warn!(notice = notice.as_str(), error = %format!("{err:#}"), "notification failed");
        }
    }

    fn best_effort(&self, step: &str, result: Result<()>) {
        if let Err(err) = result {
            warn!(step, error = %format!("{err:#}"), "best-effort step failed");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}
