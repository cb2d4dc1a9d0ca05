use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};
use uplift_core::{ReminderMode, UpgradeConfig};

use crate::host::TaskScheduler;

/// Registers the reboot reminders and the post-reboot re-invocation of the
/// orchestrator.
pub struct Registrar<'a> {
    config: &'a UpgradeConfig,
    scheduler: &'a dyn TaskScheduler,
    entry_command: String,
}

impl<'a> Registrar<'a> {
    /// `entry_command` is the full command line that re-runs the
    /// orchestrator.
    pub fn new(
        config: &'a UpgradeConfig,
        scheduler: &'a dyn TaskScheduler,
        entry_command: impl Into<String>,
    ) -> Self {
        Self {
            config,
            scheduler,
            entry_command: entry_command.into(),
        }
    }

    pub fn entry_command(&self) -> &str {
        &self.entry_command
    }

    /// Daily reminders at the configured times, or logon reminders when no
    /// user is signed in to see a daily one.
    pub fn register_reminders(&self, interactive_session: bool) -> Result<ReminderMode> {
        let mode = if interactive_session {
            ReminderMode::Daily
        } else {
            info!("no interactive session; reminders will fire at next logon");
            ReminderMode::Logon
        };
        let command = self.reminder_command();

        for (name, at) in self
            .config
            .reminder_task_names
            .iter()
            .zip(self.config.reminder_times.iter().copied())
        {
            self.scheduler
                .delete_task(name)
                .with_context(|| format!("failed to replace reminder task '{name}'"))?;
            let registered = match mode {
                ReminderMode::Daily => self.scheduler.register_daily(name, at, command),
                ReminderMode::Logon => self.scheduler.register_logon(name, command),
            };
            registered.with_context(|| format!("failed to register reminder task '{name}'"))?;
            info!(task = %name, mode = mode.as_str(), at = %at, "reminder registered");
        }
        Ok(mode)
    }

    /// Removes every reminder; keeps going past individual failures.
    pub fn remove_reminders(&self) -> Result<()> {
        let mut failures = Vec::new();
        for name in &self.config.reminder_task_names {
            if let Err(err) = self.scheduler.delete_task(name) {
                warn!(task = %name, error = %format!("{err:#}"), "failed to remove reminder");
                failures.push(name.as_str());
            }
        }
        if failures.is_empty() {
            return Ok(());
        }
        Err(anyhow!(
            "failed to remove reminder task(s): {}",
            failures.join(", ")
        ))
    }

    /// Boot-time task as the system account plus a RunOnce entry as an
    /// independent second path. Either one succeeding is enough.
    pub fn register_post_reboot_validation(&self) -> Result<()> {
        let name = &self.config.validation_task_name;
        let task = self
            .scheduler
            .delete_task(name)
            .and_then(|()| self.scheduler.register_startup(name, &self.entry_command))
            .with_context(|| format!("failed to register validation task '{name}'"));

        let value = &self.config.run_once_value_name;
        let run_once = self
            .scheduler
            .delete_run_once(value)
            .and_then(|()| self.scheduler.set_run_once(value, &self.entry_command))
            .with_context(|| format!("failed to register RunOnce fallback '{value}'"));

        match (task, run_once) {
            (Ok(()), Ok(())) => {
                info!(task = %name, run_once = %value, "post-reboot validation registered");
                Ok(())
            }
            (Ok(()), Err(err)) | (Err(err), Ok(())) => {
                warn!(
                    error = %format!("{err:#}"),
                    "post-reboot validation registered on one path only"
                );
                Ok(())
            }
            (Err(task_err), Err(run_once_err)) => Err(anyhow!(
                "post-reboot validation could not be registered: {task_err:#}; {run_once_err:#}"
            )),
        }
    }

    pub fn remove_post_reboot_validation(&self) -> Result<()> {
        let name = &self.config.validation_task_name;
        let value = &self.config.run_once_value_name;
        let task = self.scheduler.delete_task(name);
        let run_once = self.scheduler.delete_run_once(value);
        match (task, run_once) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Err(task_err), Err(run_once_err)) => Err(anyhow!(
                "failed to remove validation task: {task_err:#}; additionally failed to remove RunOnce entry: {run_once_err:#}"
            )),
        }
    }

    /// True when both reminders and the validation task are registered.
    pub fn triggers_present(&self) -> Result<bool> {
        for name in self
            .config
            .reminder_task_names
            .iter()
            .chain(std::iter::once(&self.config.validation_task_name))
        {
            if !self.scheduler.task_exists(name)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// `notify_command`, or the entry command when none is configured.
    fn reminder_command(&self) -> &str {
        self.config
            .notify_command
            .as_deref()
            .unwrap_or(&self.entry_command)
    }
}
