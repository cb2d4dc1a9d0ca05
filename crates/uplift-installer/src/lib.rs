mod command;
mod download;
mod gate;
mod host;
mod repair;
mod scheduler;
mod staging;
mod transport;
mod windows;

pub use download::{discard_artifact, hash_sidecar_path, DownloadOutcome, Downloader};
pub use gate::{check_hardware_requirements, check_security_agent, ensure_disk_space, AgentCheck};
pub use host::{
    AgentProbe, CleanupHooks, HardwareReport, Host, ImageMounter, InstallerProcess, NoopCleanup,
    NoopNotifier, Notice, Notifier, PowerControl, RepairRunner, SetupLauncher, SystemProbe,
    TaskScheduler, Transport,
};
pub use repair::{repair_commands, run_repair_with_runner, CommandRepairRunner};
pub use scheduler::Registrar;
pub use staging::{locate_installer, setup_arguments, StageReport, StagingExecutor, NO_REBOOT_FLAG};
pub use transport::{direct_path, partial_path, CommandTransport, HttpTransport};
pub use windows::{
    ChildProcess, CommandNotifier, DiskImageMounter, ProcessLauncher, SchtasksScheduler,
    ShutdownPower, WindowsHost, WindowsProbe, WorkDirCleanup,
};
