use std::path::{Path, PathBuf};

use uplift_core::Phase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    state_dir: PathBuf,
}

impl StateLayout {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Committed marker for a phase. `UpgradeFailed.marker` doubles as the
    /// failure marker that external monitors watch.
    pub fn marker_path(&self, phase: Phase) -> PathBuf {
        self.state_dir.join(format!("{}.marker", marker_stem(phase)))
    }

    /// Fully written but not yet committed marker.
    pub fn pending_marker_path(&self, phase: Phase) -> PathBuf {
        self.state_dir.join(format!("{}.marker.tmp", marker_stem(phase)))
    }

    pub fn failure_marker_path(&self) -> PathBuf {
        self.marker_path(Phase::UpgradeFailed)
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.state_dir.join("uplift.lock")
    }
}

fn marker_stem(phase: Phase) -> &'static str {
    match phase {
        Phase::ScriptRunning => "ScriptRunning",
        Phase::PendingReboot => "PendingReboot",
        Phase::UpgradeFailed => "UpgradeFailed",
    }
}
