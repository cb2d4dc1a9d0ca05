//! Host capabilities backed by stock Windows tooling: PowerShell, `schtasks`,
//! `reg` and `shutdown`.

use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uplift_core::{ReminderTime, UpgradeConfig};
use uplift_state::{parse_timestamp, remove_file_if_exists};

use crate::command::{
    escape_ps_single_quote, escape_ps_single_quote_path, parse_key_values, powershell,
    run_command, run_command_output,
};
use crate::host::{
    AgentProbe, CleanupHooks, HardwareReport, Host, ImageMounter, InstallerProcess, NoopNotifier,
    Notice, Notifier, PowerControl, SetupLauncher, SystemProbe, TaskScheduler,
};
use crate::repair::CommandRepairRunner;
use crate::transport::{direct_path, partial_path, CommandTransport, HttpTransport};

const RUN_ONCE_KEY: &str = r"HKLM\Software\Microsoft\Windows\CurrentVersion\RunOnce";
const SETUP_PROGRESS_KEY: &str = r"HKLM\SYSTEM\Setup\MoSetup\Volatile";

const HARDWARE_SCRIPT: &str = "$tpm = Get-CimInstance -Namespace 'root/cimv2/Security/MicrosoftTpm' -ClassName Win32_Tpm -ErrorAction SilentlyContinue; \
if ($tpm) { 'tpm=' + $tpm.SpecVersion }; \
try { 'secure_boot=' + (Confirm-SecureBootUEFI -ErrorAction Stop) } catch { }; \
'is_64bit=' + [Environment]::Is64BitOperatingSystem; \
'memory=' + (Get-CimInstance Win32_ComputerSystem).TotalPhysicalMemory";

#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsProbe;

impl SystemProbe for WindowsProbe {
    fn last_boot_time(&self) -> Result<DateTime<Utc>> {
        let output = run_command_output(
            &mut powershell(
                "(Get-CimInstance Win32_OperatingSystem).LastBootUpTime.ToUniversalTime().ToString('o')",
            ),
            "failed to query last boot time",
        )?;
        parse_timestamp(&output).context("last boot time is not a timestamp")
    }

    fn os_build(&self) -> Result<u32> {
        let output = run_command_output(
            &mut powershell(
                "(Get-ItemProperty 'HKLM:\\SOFTWARE\\Microsoft\\Windows NT\\CurrentVersion').CurrentBuildNumber",
            ),
            "failed to query OS build",
        )?;
        output
            .trim()
            .parse()
            .with_context(|| format!("unexpected OS build value '{output}'"))
    }

    fn free_space_bytes(&self, path: &Path) -> Result<Option<u64>> {
        let root = volume_root(path);
        let output = run_command_output(
            &mut powershell(&format!(
                "([System.IO.DriveInfo]'{}').AvailableFreeSpace",
                escape_ps_single_quote(&root)
            )),
            "failed to query free disk space",
        )?;
        Ok(output.trim().parse().ok())
    }

    fn hardware_report(&self) -> Result<HardwareReport> {
        let output = run_command_output(
            &mut powershell(HARDWARE_SCRIPT),
            "failed to query hardware facts",
        )?;
        Ok(parse_hardware_report(&output))
    }

    fn security_agent(&self, service_name: &str) -> Result<AgentProbe> {
        let name = escape_ps_single_quote(service_name);
        let script = format!(
            "$svc = Get-CimInstance Win32_Service -Filter \"Name='{name}'\" -ErrorAction SilentlyContinue; \
if (-not $svc) {{ 'installed=0'; exit 0 }}; 'installed=1'; \
$exe = ($svc.PathName -replace '^\"([^\"]+)\".*$', '$1') -replace '^(\\S+\\.exe).*$', '$1'; \
try {{ 'version=' + (Get-Item -LiteralPath $exe -ErrorAction Stop).VersionInfo.ProductVersion }} catch {{ }}"
        );
        let output = run_command_output(
            &mut powershell(&script),
            "failed to query security agent service",
        )?;
        Ok(parse_agent_probe(&output))
    }

    fn interactive_session(&self) -> bool {
        match run_command_output(
            &mut powershell("(Get-CimInstance Win32_ComputerSystem).UserName"),
            "failed to query interactive user",
        ) {
            Ok(user) => !user.trim().is_empty(),
            Err(err) => {
                debug!(error = %format!("{err:#}"), "interactive session probe failed");
                false
            }
        }
    }

    fn setup_progress(&self) -> Option<u32> {
        let mut command = Command::new("reg");
        command
            .arg("query")
            .arg(SETUP_PROGRESS_KEY)
            .arg("/v")
            .arg("SetupProgress");
        run_command_output(&mut command, "failed to read setup progress")
            .ok()
            .and_then(|output| parse_reg_dword(&output))
    }
}

fn volume_root(path: &Path) -> String {
    match path.components().next() {
        Some(Component::Prefix(prefix)) => format!("{}\\", prefix.as_os_str().to_string_lossy()),
        _ => std::env::var("SystemDrive")
            .map(|drive| format!("{drive}\\"))
            .unwrap_or_else(|_| "C:\\".to_string()),
    }
}

pub(crate) fn parse_hardware_report(output: &str) -> HardwareReport {
    let mut report = HardwareReport::default();
    for (key, value) in parse_key_values(output) {
        match key.as_str() {
            "tpm" if !value.is_empty() => report.tpm_spec_version = Some(value),
            "secure_boot" => report.secure_boot_enabled = parse_bool(&value),
            "is_64bit" => report.is_64bit = parse_bool(&value).unwrap_or(false),
            "memory" => report.total_memory_bytes = value.parse().ok(),
            _ => {}
        }
    }
    report
}

pub(crate) fn parse_agent_probe(output: &str) -> AgentProbe {
    let fields = parse_key_values(output);
    let installed = fields
        .iter()
        .any(|(key, value)| key == "installed" && value == "1");
    if !installed {
        return AgentProbe::NotInstalled;
    }
    let version = fields
        .into_iter()
        .find(|(key, _)| key == "version")
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty());
    AgentProbe::Installed { version }
}

/// Reads the value out of `reg query` output such as
/// `SetupProgress    REG_DWORD    0x2a`.
pub(crate) fn parse_reg_dword(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let _name = parts.next()?;
        if parts.next()? != "REG_DWORD" {
            return None;
        }
        let raw = parts.next()?;
        let hex = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))?;
        u32::from_str_radix(hex, 16).ok()
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiskImageMounter;

impl ImageMounter for DiskImageMounter {
    fn mount(&self, image: &Path) -> Result<PathBuf> {
        let image = escape_ps_single_quote_path(image);
        let letter = run_command_output(
            &mut powershell(&format!(
                "$img = Get-DiskImage -ImagePath '{image}'; \
if (-not $img.Attached) {{ $img = Mount-DiskImage -ImagePath '{image}' -PassThru }}; \
($img | Get-Volume).DriveLetter"
            )),
            "failed to mount disk image",
        )?;
        let letter = letter
            .lines()
            .map(str::trim)
            .find(|line| line.len() == 1)
            .ok_or_else(|| anyhow!("mounted image reported no drive letter (got '{letter}')"))?;
        Ok(PathBuf::from(format!("{letter}:\\")))
    }

    fn dismount(&self, image: &Path) -> Result<()> {
        run_command(
            &mut powershell(&format!(
                "Dismount-DiskImage -ImagePath '{}' | Out-Null",
                escape_ps_single_quote_path(image)
            )),
            "failed to dismount disk image",
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl SetupLauncher for ProcessLauncher {
    fn launch(&self, program: &Path, args: &[String]) -> Result<Box<dyn InstallerProcess>> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start {}", program.display()))?;
        Ok(Box::new(ChildProcess { child }))
    }
}

#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

impl InstallerProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        let status = self
            .child
            .try_wait()
            .context("failed to poll installer process")?;
        match status {
            None => Ok(None),
            Some(status) => status
                .code()
                .map(Some)
                .ok_or_else(|| anyhow!("installer terminated without an exit code")),
        }
    }

    fn kill(&mut self) -> Result<()> {
        self.child.kill().context("failed to kill installer")?;
        let _ = self.child.wait();
        Ok(())
    }

    fn cpu_time(&self) -> Option<Duration> {
        let output = run_command_output(
            &mut powershell(&format!(
                "[int64](Get-Process -Id {} -ErrorAction Stop).TotalProcessorTime.TotalMilliseconds",
                self.child.id()
            )),
            "failed to read installer CPU time",
        )
        .ok()?;
        output.trim().parse().ok().map(Duration::from_millis)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SchtasksScheduler;

impl SchtasksScheduler {
    pub(crate) fn daily_command(name: &str, at: ReminderTime, command_line: &str) -> Command {
        let mut command = create_task(name, command_line);
        command
            .arg("/SC")
            .arg("DAILY")
            .arg("/ST")
            .arg(at.to_string())
            .arg("/RU")
            .arg("SYSTEM");
        command
    }

    pub(crate) fn logon_command(name: &str, command_line: &str) -> Command {
        let mut command = create_task(name, command_line);
        command.arg("/SC").arg("ONLOGON").arg("/RU").arg("SYSTEM");
        command
    }

    pub(crate) fn startup_command(name: &str, command_line: &str) -> Command {
        let mut command = create_task(name, command_line);
        command
            .arg("/SC")
            .arg("ONSTART")
            .arg("/RU")
            .arg("SYSTEM")
            .arg("/RL")
            .arg("HIGHEST");
        command
    }
}

fn create_task(name: &str, command_line: &str) -> Command {
    let mut command = Command::new("schtasks");
    command
        .arg("/Create")
        .arg("/F")
        .arg("/TN")
        .arg(name)
        .arg("/TR")
        .arg(command_line);
    command
}

impl TaskScheduler for SchtasksScheduler {
    fn register_daily(&self, name: &str, at: ReminderTime, command_line: &str) -> Result<()> {
        run_command(
            &mut Self::daily_command(name, at, command_line),
            "failed to create daily task",
        )
    }

    fn register_logon(&self, name: &str, command_line: &str) -> Result<()> {
        run_command(
            &mut Self::logon_command(name, command_line),
            "failed to create logon task",
        )
    }

    fn register_startup(&self, name: &str, command_line: &str) -> Result<()> {
        run_command(
            &mut Self::startup_command(name, command_line),
            "failed to create startup task",
        )
    }

    fn delete_task(&self, name: &str) -> Result<()> {
        if !self.task_exists(name)? {
            return Ok(());
        }
        let mut command = Command::new("schtasks");
        command.arg("/Delete").arg("/F").arg("/TN").arg(name);
        run_command(&mut command, "failed to delete scheduled task")
    }

    fn task_exists(&self, name: &str) -> Result<bool> {
        let status = Command::new("schtasks")
            .arg("/Query")
            .arg("/TN")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("failed to query scheduled task: command failed to start")?;
        Ok(status.success())
    }

    fn set_run_once(&self, value_name: &str, command_line: &str) -> Result<()> {
        let mut command = Command::new("reg");
        command
            .arg("add")
            .arg(RUN_ONCE_KEY)
            .arg("/v")
            .arg(value_name)
            .arg("/t")
            .arg("REG_SZ")
            .arg("/d")
            .arg(command_line)
            .arg("/f");
        run_command(&mut command, "failed to set RunOnce entry")
    }

    fn delete_run_once(&self, value_name: &str) -> Result<()> {
        let present = Command::new("reg")
            .arg("query")
            .arg(RUN_ONCE_KEY)
            .arg("/v")
            .arg(value_name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("failed to query RunOnce entry: command failed to start")?
            .success();
        if !present {
            return Ok(());
        }
        let mut command = Command::new("reg");
        command
            .arg("delete")
            .arg(RUN_ONCE_KEY)
            .arg("/v")
            .arg(value_name)
            .arg("/f");
        run_command(&mut command, "failed to delete RunOnce entry")
    }
}

/// Runs the configured notification command detached, passing the notice
/// token and detail as trailing arguments.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command_line: String,
}

impl CommandNotifier {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
        }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, notice: Notice, detail: &str) -> Result<()> {
        let mut command = Command::new("cmd");
        command
            .arg("/C")
            .arg(&self.command_line)
            .arg(notice.as_str())
            .arg(detail)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
            .spawn()
            .with_context(|| format!("failed to start notifier '{}'", self.command_line))?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ShutdownPower;

impl PowerControl for ShutdownPower {
    fn schedule_restart(&self, delay: Duration, reason: &str) -> Result<()> {
        let mut command = Command::new("shutdown");
        command
            .arg("/r")
            .arg("/t")
            .arg(delay.as_secs().to_string())
            .arg("/c")
            .arg(reason);
        run_command(&mut command, "failed to schedule restart")
    }
}

/// Removes partial transfers from the work dir and, when space is short,
/// the Windows Update download cache.
#[derive(Debug, Clone)]
pub struct WorkDirCleanup {
    image: PathBuf,
}

impl WorkDirCleanup {
    pub fn new(config: &UpgradeConfig) -> Self {
        Self {
            image: config.iso_path(),
        }
    }

    fn remove_partials(&self) -> Result<()> {
        for path in [partial_path(&self.image), direct_path(&self.image)] {
            remove_file_if_exists(&path)
                .with_context(|| format!("failed to remove partial download: {}", path.display()))?;
        }
        Ok(())
    }
}

impl CleanupHooks for WorkDirCleanup {
    fn reclaim_space(&self) -> Result<()> {
        self.remove_partials()?;
        if let Err(err) = run_command(
            &mut powershell(
                "Get-ChildItem -Path (Join-Path $env:SystemRoot 'SoftwareDistribution\\Download') -Force -ErrorAction SilentlyContinue | Remove-Item -Recurse -Force -ErrorAction SilentlyContinue",
            ),
            "failed to clear update download cache",
        ) {
            warn!(error = %format!("{err:#}"), "update cache cleanup failed");
        }
        Ok(())
    }

    fn failure_cleanup(&self) -> Result<()> {
        self.remove_partials()
    }
}

/// Owns the command-backed capabilities for a real run.
pub struct WindowsHost {
    probe: WindowsProbe,
    mounter: DiskImageMounter,
    launcher: ProcessLauncher,
    scheduler: SchtasksScheduler,
    notifier: Box<dyn Notifier>,
    cleanup: WorkDirCleanup,
    repair: CommandRepairRunner,
    power: ShutdownPower,
    http: HttpTransport,
    direct: CommandTransport,
}

impl WindowsHost {
    pub fn new(config: &UpgradeConfig) -> Result<Self> {
        let notifier: Box<dyn Notifier> = match &config.notify_command {
            Some(command_line) => Box::new(CommandNotifier::new(command_line.clone())),
            None => Box::new(NoopNotifier),
        };
        Ok(Self {
            probe: WindowsProbe,
            mounter: DiskImageMounter,
            launcher: ProcessLauncher,
            scheduler: SchtasksScheduler,
            notifier,
            cleanup: WorkDirCleanup::new(config),
            repair: CommandRepairRunner,
            power: ShutdownPower,
            http: HttpTransport::new()?,
            direct: CommandTransport,
        })
    }

    pub fn host(&self) -> Host<'_> {
        Host {
            probe: &self.probe,
            mounter: &self.mounter,
            launcher: &self.launcher,
            scheduler: &self.scheduler,
            notifier: self.notifier.as_ref(),
            cleanup: &self.cleanup,
            repair: &self.repair,
            power: &self.power,
            primary_transport: &self.http,
            fallback_transport: &self.direct,
        }
    }
}
