use std::process::Command;

use anyhow::Result;
use tracing::info;
use uplift_core::RepairAction;

use crate::command::{powershell, run_command};
use crate::host::RepairRunner;

const RESET_UPDATE_COMPONENTS: &str = "$services = 'wuauserv','bits','cryptsvc'; \
Stop-Service -Name $services -Force -ErrorAction SilentlyContinue; \
$dist = Join-Path $env:SystemRoot 'SoftwareDistribution'; \
if (Test-Path $dist) { Remove-Item -LiteralPath $dist -Recurse -Force -ErrorAction Stop }; \
Start-Service -Name $services";

const CLEANUP_SETUP_LEFTOVERS: &str = "foreach ($dir in @('$WINDOWS.~BT', '$WINDOWS.~WS')) { \
$path = Join-Path $env:SystemDrive $dir; \
if (Test-Path -LiteralPath $path) { Remove-Item -LiteralPath $path -Recurse -Force -ErrorAction Stop } }";

/// Fixed command sequence behind each repair action.
pub fn repair_commands(action: RepairAction) -> Vec<Command> {
    match action {
        RepairAction::DismRestoreHealth => {
            vec![dism(&["/Online", "/Cleanup-Image", "/RestoreHealth"])]
        }
        RepairAction::SystemFileCheck => {
            let mut command = Command::new("sfc");
            command.arg("/scannow");
            vec![command]
        }
        RepairAction::ResetUpdateComponents => vec![powershell(RESET_UPDATE_COMPONENTS)],
        RepairAction::CleanupSetupLeftovers => vec![powershell(CLEANUP_SETUP_LEFTOVERS)],
        RepairAction::ComponentCleanup => vec![dism(&[
            "/Online",
            "/Cleanup-Image",
            "/StartComponentCleanup",
        ])],
    }
}

fn dism(args: &[&str]) -> Command {
    let mut command = Command::new("DISM.exe");
    command.args(args);
    command
}

pub fn run_repair_with_runner<RunCommand>(action: RepairAction, mut run: RunCommand) -> Result<()>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<()>,
{
    let context = format!("repair action '{}' failed", action.as_str());
    for mut command in repair_commands(action) {
        run(&mut command, &context)?;
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRepairRunner;

impl RepairRunner for CommandRepairRunner {
    fn run_repair(&self, action: RepairAction) -> Result<()> {
        info!(action = action.as_str(), "running repair action");
        run_repair_with_runner(action, run_command)
    }
}
