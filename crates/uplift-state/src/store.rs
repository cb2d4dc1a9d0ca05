use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};
use uplift_core::{FailureRecord, Phase, PhaseRecord};

use crate::fs_utils::{remove_file_if_exists, write_file_synced};
use crate::layout::StateLayout;
use crate::record::{parse_record, serialize_record};

/// Read precedence when markers disagree.
const READ_ORDER: [Phase; 3] = [
    Phase::UpgradeFailed,
    Phase::PendingReboot,
    Phase::ScriptRunning,
];

const ACTIVE_PHASES: [Phase; 2] = [Phase::ScriptRunning, Phase::PendingReboot];

/// Marker-file store for the upgrade lifecycle.
///
/// Every write goes through a fsynced `*.marker.tmp` file that is renamed
/// into place. Writing an active phase deletes the superseded markers
/// before the rename; writing a failure renames first and then clears the
/// active markers. A reader therefore sees either the old or the new phase:
/// a pending file next to a committed marker is an unfinished write and is
/// discarded, while a pending file with no committed marker is the only
/// surviving intent and is promoted.
#[derive(Debug, Clone)]
pub struct StateStore {
    layout: StateLayout,
}

impl StateStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn open(state_dir: impl AsRef<Path>) -> Self {
        Self::new(StateLayout::new(state_dir.as_ref()))
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn read_state(&self) -> Result<Option<PhaseRecord>> {
        self.recover_pending_writes()?;

        let committed = self.committed_phases();
        if committed.len() > 1 {
            warn!(
                markers = ?committed.iter().map(|phase| phase.as_str()).collect::<Vec<_>>(),
                "multiple phase markers present; using highest precedence"
            );
        }

        match committed.first() {
            Some(phase) => self.read_marker(*phase).map(Some),
            None => Ok(None),
        }
    }

    pub fn write_state(&self, record: &PhaseRecord) -> Result<()> {
        if let PhaseRecord::UpgradeFailed(failure) = record {
            return self.write_failure(failure);
        }

        let phase = record.phase();
        self.ensure_dir()?;
        let pending = self.layout.pending_marker_path(phase);
        write_file_synced(&pending, serialize_record(record).as_bytes())
            .with_context(|| format!("failed to write pending marker: {}", pending.display()))?;

        for other in READ_ORDER.into_iter().filter(|other| *other != phase) {
            self.remove_marker(other)?;
            self.remove_pending(other)?;
        }

        self.commit(phase)?;
        debug!(phase = phase.as_str(), "phase marker committed");
        Ok(())
    }

    /// Removes the active phase markers. The failure marker is left alone so
    /// monitors keep seeing it until `clear_failure`.
    pub fn clear_state(&self) -> Result<()> {
        for phase in ACTIVE_PHASES {
            self.remove_pending(phase)?;
            self.remove_marker(phase)?;
        }
        Ok(())
    }

    pub fn write_failure(&self, failure: &FailureRecord) -> Result<()> {
        self.ensure_dir()?;
        let record = PhaseRecord::UpgradeFailed(failure.clone());
        let pending = self.layout.pending_marker_path(Phase::UpgradeFailed);
        write_file_synced(&pending, serialize_record(&record).as_bytes())
            .with_context(|| format!("failed to write pending marker: {}", pending.display()))?;
        self.commit(Phase::UpgradeFailed)?;
        self.clear_state()?;
        debug!("failure marker committed");
        Ok(())
    }

    pub fn read_failure(&self) -> Result<Option<FailureRecord>> {
        if !self.layout.failure_marker_path().exists() {
            return Ok(None);
        }
        match self.read_marker(Phase::UpgradeFailed)? {
            PhaseRecord::UpgradeFailed(failure) => Ok(Some(failure)),
            other => Err(anyhow!(
                "failure marker holds a {} record",
                other.phase().as_str()
            )),
        }
    }

    pub fn clear_failure(&self) -> Result<()> {
        self.remove_pending(Phase::UpgradeFailed)?;
        self.remove_marker(Phase::UpgradeFailed)
    }

    /// Committed markers in read precedence order.
    pub fn committed_phases(&self) -> Vec<Phase> {
        READ_ORDER
            .into_iter()
            .filter(|phase| self.layout.marker_path(*phase).is_file())
            .collect()
    }

    fn recover_pending_writes(&self) -> Result<()> {
        let pending = READ_ORDER
            .into_iter()
            .filter(|phase| self.layout.pending_marker_path(*phase).is_file())
            .collect::<Vec<_>>();
        if pending.is_empty() {
            return Ok(());
        }

        if !self.committed_phases().is_empty() {
            for phase in pending {
                warn!(
                    phase = phase.as_str(),
                    "discarding uncommitted marker write"
                );
                self.remove_pending(phase)?;
            }
            return Ok(());
        }

        let mut promoted = false;
        for phase in pending {
            let path = self.layout.pending_marker_path(phase);
            let intact = fs::read_to_string(&path)
                .ok()
                .is_some_and(|raw| parse_record(&raw, phase).is_ok());
            if intact && !promoted {
                warn!(
                    phase = phase.as_str(),
                    "promoting interrupted marker write"
                );
                self.commit(phase)?;
                promoted = true;
            } else {
                self.remove_pending(phase)?;
            }
        }
        Ok(())
    }

    fn read_marker(&self, phase: Phase) -> Result<PhaseRecord> {
        let path = self.layout.marker_path(phase);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read state marker: {}", path.display()))?;
        parse_record(&raw, phase)
            .with_context(|| format!("corrupt state marker: {}", path.display()))
    }

    fn commit(&self, phase: Phase) -> Result<()> {
        let pending = self.layout.pending_marker_path(phase);
        let marker = self.layout.marker_path(phase);
        fs::rename(&pending, &marker).with_context(|| {
            format!(
                "failed to commit state marker {} -> {}",
                pending.display(),
                marker.display()
            )
        })
    }

    fn remove_marker(&self, phase: Phase) -> Result<()> {
        let path = self.layout.marker_path(phase);
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove state marker: {}", path.display()))
    }

    fn remove_pending(&self, phase: Phase) -> Result<()> {
        let path = self.layout.pending_marker_path(phase);
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove pending marker: {}", path.display()))
    }

    fn ensure_dir(&self) -> Result<()> {
        let dir = self.layout.state_dir();
        match fs::create_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to create state dir: {}", dir.display()))
            }
        }
    }
}
