use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use crate::catalog::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    ScriptRunning,
    PendingReboot,
    UpgradeFailed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScriptRunning => "script_running",
            Self::PendingReboot => "pending_reboot",
            Self::UpgradeFailed => "upgrade_failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "script_running" => Ok(Self::ScriptRunning),
            "pending_reboot" => Ok(Self::PendingReboot),
            "upgrade_failed" => Ok(Self::UpgradeFailed),
            _ => Err(anyhow!("invalid phase: {value}")),
        }
    }
}

/// How the reboot reminders were registered for a staged upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderMode {
    Daily,
    Logon,
}

impl ReminderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Logon => "logon",
        }
    }

    pub fn parse_token(value: &str) -> Self {
        match value {
            "logon" => Self::Logon,
            _ => Self::Daily,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRunningRecord {
    pub started_at: DateTime<Utc>,
    pub last_boot: Option<DateTime<Utc>>,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRebootRecord {
    pub staged_at: DateTime<Utc>,
    pub last_boot: Option<DateTime<Utc>>,
    pub reminder_mode: ReminderMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub failed_at: DateTime<Utc>,
    pub reason: String,
    pub code: Option<ErrorCode>,
}

/// Durable lifecycle record; exactly one is visible to a reader at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseRecord {
    ScriptRunning(ScriptRunningRecord),
    PendingReboot(PendingRebootRecord),
    UpgradeFailed(FailureRecord),
}

impl PhaseRecord {
    pub fn phase(&self) -> Phase {
        match self {
            Self::ScriptRunning(_) => Phase::ScriptRunning,
            Self::PendingReboot(_) => Phase::PendingReboot,
            Self::UpgradeFailed(_) => Phase::UpgradeFailed,
        }
    }

    /// Boot time captured when the phase was entered. Failure records carry
    /// none: a failure is not resumed across reboots.
    pub fn last_boot(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::ScriptRunning(record) => record.last_boot,
            Self::PendingReboot(record) => record.last_boot,
            Self::UpgradeFailed(_) => None,
        }
    }
}
