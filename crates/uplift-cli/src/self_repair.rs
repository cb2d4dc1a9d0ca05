use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uplift_core::{Phase, UpgradeFailure};

use crate::orchestrator::{classify, Orchestrator, RunOutcome};

/// True when an in-flight phase was entered before the current boot by more
/// than `tolerance`: the machine restarted and nothing advanced the state.
/// Missing boot times never trigger a repair.
pub fn needs_repair(
    phase: Phase,
    recorded_boot: Option<DateTime<Utc>>,
    current_boot: Option<DateTime<Utc>>,
    tolerance: Duration,
) -> bool {
    if !matches!(phase, Phase::ScriptRunning | Phase::PendingReboot) {
        return false;
    }
    let (Some(recorded), Some(current)) = (recorded_boot, current_boot) else {
        return false;
    };
    match current.signed_duration_since(recorded).to_std() {
        Ok(gap) => gap > tolerance,
        Err(_) => false,
    }
}

/// Cleans partial artifacts and runs the download and staging pipeline
/// again. A valid image on disk is reused by the downloader.
pub fn repair(
    orchestrator: &Orchestrator<'_>,
    interrupted: Phase,
    current_boot: Option<DateTime<Utc>>,
) -> Result<RunOutcome> {
    warn!(
        phase = interrupted.as_str(),
        "phase survived a reboot without advancing; running self-repair"
    );
    orchestrator.cleanup_partials();

    let report = orchestrator
        .stage_pipeline(current_boot)
        .map_err(|err| aggregate(interrupted, &err))?;
    orchestrator.finish_staging(current_boot)?;
    info!(
        phase = interrupted.as_str(),
        exit_code = %report.exit_code,
        "self-repair staged the upgrade"
    );
    Ok(RunOutcome::Repaired {
        exit_code: report.exit_code,
    })
}

fn aggregate(interrupted: Phase, err: &anyhow::Error) -> anyhow::Error {
    let failure = classify(err);
    UpgradeFailure::with_code(
        failure.kind,
        failure.code,
        format!(
            "self-repair after interrupted {} failed: {}",
            interrupted.as_str(),
            failure.detail
        ),
    )
    .into()
}
