use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    run_command_output(command, context_message).map(|_| ())
}

/// Runs `command` to completion and returns its trimmed stdout.
pub(crate) fn run_command_output(command: &mut Command, context_message: &str) -> Result<String> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() {
        return Ok(stdout.trim().to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

pub(crate) fn powershell(script: &str) -> Command {
    let mut command = Command::new("powershell");
    command
        .arg("-NoProfile")
        .arg("-NonInteractive")
        .arg("-ExecutionPolicy")
        .arg("Bypass")
        .arg("-Command")
        .arg(script);
    command
}

pub(crate) fn escape_ps_single_quote(value: &str) -> String {
    value.replace('\'', "''")
}

pub(crate) fn escape_ps_single_quote_path(path: &Path) -> String {
    let mut os = OsString::new();
    os.push(path.as_os_str());
    os.to_string_lossy().replace('\'', "''")
}

/// Parses `key=value` lines printed by a probe script. Lines without `=`
/// are ignored.
pub(crate) fn parse_key_values(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect()
}
