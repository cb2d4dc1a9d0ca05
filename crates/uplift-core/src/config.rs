use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Process-wide settings for one invocation. Loaded once, then handed to
/// every component by reference; nothing reads configuration ambiently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpgradeConfig {
    pub iso_url: String,
    pub iso_sha256: Option<String>,
    pub iso_min_size_bytes: u64,
    pub iso_file_name: String,
    pub min_free_space_gb: u64,
    pub work_dir: PathBuf,
    pub state_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub target_build: u32,
    pub dynamic_update: bool,
    pub auto_reboot: bool,
    pub reboot_delay_secs: u64,
    pub reminder_times: Vec<ReminderTime>,
    pub reminder_task_names: Vec<String>,
    pub validation_task_name: String,
    pub run_once_value_name: String,
    pub security_agent: SecurityAgentConfig,
    pub download_attempts: u32,
    pub download_stall_timeout_secs: u64,
    pub stage_attempts: u32,
    pub stage_stall_timeout_secs: u64,
    pub stage_poll_interval_ms: u64,
    pub boot_tolerance_secs: u64,
    pub min_ram_gb: u64,
    /// Command the reminder tasks run. When unset they run this binary again,
    /// which in `PendingReboot` only re-registers triggers and sends the
    /// reboot reminder; nothing is downloaded or staged.
    pub notify_command: Option<String>,
    pub error_catalog_path: Option<PathBuf>,
    pub lock_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityAgentConfig {
    pub service_name: String,
    pub min_version: String,
}

impl Default for SecurityAgentConfig {
    fn default() -> Self {
        Self {
            service_name: "SentinelAgent".to_string(),
            min_version: "24.2.2.0".to_string(),
        }
    }
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            iso_url: String::new(),
            iso_sha256: None,
            iso_min_size_bytes: 4 * 1024 * 1024 * 1024,
            iso_file_name: "Win11.iso".to_string(),
            min_free_space_gb: 30,
            work_dir: default_work_dir(),
            state_dir: None,
            log_dir: None,
            target_build: 22000,
            dynamic_update: false,
            auto_reboot: false,
            reboot_delay_secs: 300,
            reminder_times: vec![ReminderTime::new(10, 0), ReminderTime::new(15, 0)],
            reminder_task_names: vec![
                "Uplift Reboot Reminder AM".to_string(),
                "Uplift Reboot Reminder PM".to_string(),
            ],
            validation_task_name: "Uplift Post-Reboot Validation".to_string(),
            run_once_value_name: "UpliftPostRebootValidation".to_string(),
            security_agent: SecurityAgentConfig::default(),
            download_attempts: 3,
            download_stall_timeout_secs: 300,
            stage_attempts: 2,
            stage_stall_timeout_secs: 45 * 60,
            stage_poll_interval_ms: 30_000,
            boot_tolerance_secs: 30,
            min_ram_gb: 4,
            notify_command: None,
            error_catalog_path: None,
            lock_name: "UpliftWin11Upgrade".to_string(),
        }
    }
}

fn default_work_dir() -> PathBuf {
    if cfg!(windows) {
        let program_data =
            std::env::var("ProgramData").unwrap_or_else(|_| r"C:\ProgramData".to_string());
        return PathBuf::from(program_data).join("Uplift");
    }
    PathBuf::from("/var/lib/uplift")
}

impl UpgradeConfig {
    pub fn from_json_str(input: &str) -> Result<Self> {
        let mut value: Value =
            serde_json::from_str(input).context("failed to parse configuration JSON")?;
        strip_placeholders(&mut value);
        let mut config: Self =
            serde_json::from_value(value).context("failed to map configuration fields")?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration: {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed to load configuration: {}", path.display()))
    }

    /// Location probed when neither the command line nor the environment
    /// names a configuration file.
    pub fn default_path() -> PathBuf {
        default_work_dir().join("config.json")
    }

    fn normalize(&mut self) {
        self.iso_sha256 = self
            .iso_sha256
            .take()
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty());
        self.notify_command = self
            .notify_command
            .take()
            .filter(|value| !value.trim().is_empty());
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_attempts == 0 {
            return Err(anyhow!("download_attempts must be at least 1"));
        }
        if self.stage_attempts == 0 {
            return Err(anyhow!("stage_attempts must be at least 1"));
        }
        if self.reminder_times.is_empty() {
            return Err(anyhow!("reminder_times must name at least one time"));
        }
        if self.reminder_times.len() != self.reminder_task_names.len() {
            return Err(anyhow!(
                "reminder_times ({}) and reminder_task_names ({}) must have the same length",
                self.reminder_times.len(),
                self.reminder_task_names.len()
            ));
        }
        if let Some(hash) = &self.iso_sha256 {
            if hash.len() != 64 || !hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(anyhow!(
                    "iso_sha256 must be 64 hex characters (got '{hash}')"
                ));
            }
        }
        if self.iso_file_name.contains(['/', '\\']) {
            return Err(anyhow!(
                "iso_file_name must be a bare file name (got '{}')",
                self.iso_file_name
            ));
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("state"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("logs"))
    }

    pub fn iso_path(&self) -> PathBuf {
        self.work_dir.join(&self.iso_file_name)
    }

    pub fn setup_log_dir(&self) -> PathBuf {
        self.log_dir().join("setup")
    }

    pub fn download_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.download_stall_timeout_secs)
    }

    pub fn stage_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_stall_timeout_secs)
    }

    pub fn stage_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stage_poll_interval_ms)
    }

    pub fn boot_tolerance(&self) -> Duration {
        Duration::from_secs(self.boot_tolerance_secs)
    }

    pub fn min_free_space_bytes(&self) -> u64 {
        self.min_free_space_gb.saturating_mul(1024 * 1024 * 1024)
    }
}

/// Removes unsubstituted `@token@` placeholders so the affected fields fall
/// back to their defaults. An array holding any placeholder is dropped whole.
fn strip_placeholders(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, entry| !is_placeholder_value(entry));
            for entry in map.values_mut() {
                strip_placeholders(entry);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                strip_placeholders(item);
            }
        }
        _ => {}
    }
}

fn is_placeholder_value(value: &Value) -> bool {
    match value {
        Value::String(text) => is_placeholder(text),
        Value::Array(items) => items
            .iter()
            .any(|item| matches!(item, Value::String(text) if is_placeholder(text))),
        _ => false,
    }
}

pub(crate) fn is_placeholder(text: &str) -> bool {
    let trimmed = text.trim();
    let Some(inner) = trimmed
        .strip_prefix('@')
        .and_then(|rest| rest.strip_suffix('@'))
    else {
        return false;
    };
    !inner.is_empty()
        && inner
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
}

/// Wall-clock time of day for a daily reminder, serialized as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReminderTime {
    hour: u8,
    minute: u8,
}

impl ReminderTime {
    pub const fn new(hour: u8, minute: u8) -> Self {
        Self { hour, minute }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let (hour, minute) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow!("reminder time must be HH:MM (got '{value}')"))?;
        let hour: u8 = hour
            .parse()
            .with_context(|| format!("invalid reminder hour in '{value}'"))?;
        let minute: u8 = minute
            .parse()
            .with_context(|| format!("invalid reminder minute in '{value}'"))?;
        if hour > 23 || minute > 59 {
            return Err(anyhow!("reminder time out of range: '{value}'"));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }
}

impl fmt::Display for ReminderTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for ReminderTime {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ReminderTime> for String {
    fn from(value: ReminderTime) -> Self {
        value.to_string()
    }
}
