mod catalog;
mod config;
mod failure;
mod phase;
mod version;

pub use catalog::{
    is_setup_success_code, CatalogEntry, ErrorCatalog, ErrorCode, RepairAction,
    StagingDisposition, CORRUPT_SOURCE_MEDIA, INCOMPATIBLE_APP_OR_DRIVER, SETUP_SUCCESS_CODES,
};
pub use config::{ReminderTime, SecurityAgentConfig, UpgradeConfig};
pub use failure::{FailureKind, UpgradeFailure};
pub use phase::{
    FailureRecord, PendingRebootRecord, Phase, PhaseRecord, ReminderMode, ScriptRunningRecord,
};
pub use version::DottedVersion;

#[cfg(test)]
mod tests;
