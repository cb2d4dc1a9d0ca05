use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uplift_core::{RepairAction, ReminderTime};

/// Facts the compatibility gate needs about the machine. `None` means the
/// probe could not determine the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareReport {
    pub tpm_spec_version: Option<String>,
    pub secure_boot_enabled: Option<bool>,
    pub is_64bit: bool,
    pub total_memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentProbe {
    NotInstalled,
    /// The service exists; `version` is whatever the probe could read back.
    Installed { version: Option<String> },
}

/// Read-only view of the host.
pub trait SystemProbe {
    fn last_boot_time(&self) -> Result<DateTime<Utc>>;

    fn os_build(&self) -> Result<u32>;

    /// Free bytes on the volume holding `path`; `Ok(None)` when the volume
    /// reports nothing usable.
    fn free_space_bytes(&self, path: &Path) -> Result<Option<u64>>;

    fn hardware_report(&self) -> Result<HardwareReport>;

    fn security_agent(&self, service_name: &str) -> Result<AgentProbe>;

    fn interactive_session(&self) -> bool {
        true
    }

    /// Setup progress percentage as published by the installer, if any.
    fn setup_progress(&self) -> Option<u32> {
        None
    }
}

pub trait ImageMounter {
    /// Mounts the image and returns the root of the mounted volume.
    fn mount(&self, image: &Path) -> Result<PathBuf>;

    fn dismount(&self, image: &Path) -> Result<()>;
}

/// A running installer child.
pub trait InstallerProcess {
    fn id(&self) -> u32;

    /// Exit status once the process has finished.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    fn kill(&mut self) -> Result<()>;

    /// Accumulated CPU time, when the platform exposes it.
    fn cpu_time(&self) -> Option<Duration> {
        None
    }
}

pub trait SetupLauncher {
    fn launch(&self, program: &Path, args: &[String]) -> Result<Box<dyn InstallerProcess>>;
}

/// Named, OS-level triggers. Every `register_*` call replaces a prior
/// registration of the same name; `delete_*` treats a missing entry as done.
pub trait TaskScheduler {
    fn register_daily(&self, name: &str, at: ReminderTime, command_line: &str) -> Result<()>;

    fn register_logon(&self, name: &str, command_line: &str) -> Result<()>;

    /// Boot-time trigger running as the system account.
    fn register_startup(&self, name: &str, command_line: &str) -> Result<()>;

    fn delete_task(&self, name: &str) -> Result<()>;

    fn task_exists(&self, name: &str) -> Result<bool>;

    fn set_run_once(&self, value_name: &str, command_line: &str) -> Result<()>;

    fn delete_run_once(&self, value_name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    UpgradeStaged,
    RebootReminder,
    UpgradeBlocked,
    UpgradeFailed,
    UpgradeCompleted,
}

impl Notice {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpgradeStaged => "upgrade-staged",
            Self::RebootReminder => "reboot-reminder",
            Self::UpgradeBlocked => "upgrade-blocked",
            Self::UpgradeFailed => "upgrade-failed",
            Self::UpgradeCompleted => "upgrade-completed",
        }
    }
}

/// Fire-and-forget user notification. Errors are reported to the caller,
/// which logs them and carries on.
pub trait Notifier {
    fn notify(&self, _notice: Notice, _detail: &str) -> Result<()> {
        Ok(())
    }
}

/// Cleanup collaborator. Every hook defaults to doing nothing.
pub trait CleanupHooks {
    /// Tries to free disk space before the space gate gives up.
    fn reclaim_space(&self) -> Result<()> {
        Ok(())
    }

    /// Removes partial artifacts left by an interrupted or failed run.
    fn failure_cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn completion_cleanup(&self) -> Result<()> {
        Ok(())
    }
}

pub trait RepairRunner {
    fn run_repair(&self, action: RepairAction) -> Result<()>;
}

pub trait PowerControl {
    fn schedule_restart(&self, delay: Duration, reason: &str) -> Result<()>;
}

/// Moves the bytes at `url` into `dest`. Implementations write to a
/// temporary name and rename on success, so `dest` only ever holds a
/// complete transfer.
pub trait Transport {
    fn name(&self) -> &'static str;

    fn fetch(&self, url: &str, dest: &Path, stall_timeout: Duration) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCleanup;

impl CleanupHooks for NoopCleanup {}

/// Every collaborator one orchestrator run talks to.
#[derive(Clone, Copy)]
pub struct Host<'a> {
    pub probe: &'a dyn SystemProbe,
    pub mounter: &'a dyn ImageMounter,
    pub launcher: &'a dyn SetupLauncher,
    pub scheduler: &'a dyn TaskScheduler,
    pub notifier: &'a dyn Notifier,
    pub cleanup: &'a dyn CleanupHooks,
    pub repair: &'a dyn RepairRunner,
    pub power: &'a dyn PowerControl,
    pub primary_transport: &'a dyn Transport,
    pub fallback_transport: &'a dyn Transport,
}
