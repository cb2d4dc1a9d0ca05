use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};
use uplift_core::{DottedVersion, FailureKind, SecurityAgentConfig, UpgradeConfig, UpgradeFailure};

use crate::host::{AgentProbe, CleanupHooks, HardwareReport, SystemProbe};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCheck {
    Compatible(DottedVersion),
    /// Agent absent or undetectable; the upgrade may proceed.
    NotInstalled,
    Blocked(String),
}

impl AgentCheck {
    pub fn allows_upgrade(&self) -> bool {
        !matches!(self, Self::Blocked(_))
    }
}

/// TPM 2.0, Secure Boot, a 64-bit OS and the configured memory floor. The
/// first failing predicate is reported as a `Hardware` failure.
pub fn check_hardware_requirements(probe: &dyn SystemProbe, config: &UpgradeConfig) -> Result<()> {
    let report = probe.hardware_report()?;
    if let Some(reason) = hardware_shortfall(&report, config.min_ram_gb) {
        return Err(UpgradeFailure::new(FailureKind::Hardware, reason).into());
    }
    info!("hardware requirements met");
    Ok(())
}

fn hardware_shortfall(report: &HardwareReport, min_ram_gb: u64) -> Option<String> {
    match report.tpm_spec_version.as_deref() {
        Some(version) if version.trim_start().starts_with('2') => {}
        Some(version) => return Some(format!("TPM 2.0 required (found spec version {version})")),
        None => return Some("TPM not present or not readable".to_string()),
    }
    match report.secure_boot_enabled {
        Some(true) => {}
        Some(false) => return Some("Secure Boot is disabled".to_string()),
        None => return Some("Secure Boot state unknown (legacy BIOS?)".to_string()),
    }
    if !report.is_64bit {
        return Some("64-bit operating system required".to_string());
    }
    let min_bytes = min_ram_gb.saturating_mul(GIB);
    match report.total_memory_bytes {
        Some(bytes) if bytes >= min_bytes => None,
        Some(bytes) => Some(format!(
            "at least {min_ram_gb} GB RAM required (found {:.1} GB)",
            bytes as f64 / GIB as f64
        )),
        None => Some("installed memory could not be determined".to_string()),
    }
}

/// A missing agent does not block. A detected agent whose version cannot
/// be read blocks, as does one below the configured minimum.
pub fn check_security_agent(probe: &dyn SystemProbe, agent: &SecurityAgentConfig) -> AgentCheck {
    let minimum = match DottedVersion::parse(&agent.min_version) {
        Ok(minimum) => minimum,
        Err(err) => {
            return AgentCheck::Blocked(format!(
                "configured minimum version for {} is invalid: {err:#}",
                agent.service_name
            ));
        }
    };

    let detected = match probe.security_agent(&agent.service_name) {
        Ok(AgentProbe::NotInstalled) => {
            info!(service = %agent.service_name, "security agent not installed; continuing");
            return AgentCheck::NotInstalled;
        }
        Ok(AgentProbe::Installed { version }) => version,
        Err(err) => {
            warn!(
                service = %agent.service_name,
                error = %format!("{err:#}"),
                "security agent lookup failed; treating as not installed"
            );
            return AgentCheck::NotInstalled;
        }
    };

    let raw = detected.unwrap_or_default();
    let version = match DottedVersion::parse(&raw) {
        Ok(version) => version,
        Err(_) => {
            warn!(
                service = %agent.service_name,
                version = %raw,
                "security agent detected but its version is unreadable"
            );
            return AgentCheck::Blocked(format!(
                "{} is installed but its version '{}' could not be read; minimum supported is {minimum}",
                agent.service_name, raw
            ));
        }
    };

    if version < minimum {
        return AgentCheck::Blocked(format!(
            "{} version {version} is below the minimum supported version {minimum}",
            agent.service_name
        ));
    }
    info!(service = %agent.service_name, %version, "security agent compatible");
    AgentCheck::Compatible(version)
}

/// Ensures `min_bytes` are free on the volume holding `path`, running the
/// cleanup hook once before giving up. Unknown free space is a failure.
pub fn ensure_disk_space(
    probe: &dyn SystemProbe,
    cleanup: &dyn CleanupHooks,
    path: &Path,
    min_bytes: u64,
) -> Result<u64> {
    let free = read_free_space(probe, path)?;
    if free >= min_bytes {
        return Ok(free);
    }

    warn!(
        free_gb = free / GIB,
        required_gb = min_bytes / GIB,
        "insufficient disk space; attempting cleanup"
    );
    if let Err(err) = cleanup.reclaim_space() {
        warn!(error = %format!("{err:#}"), "disk cleanup failed");
    }

    let free = read_free_space(probe, path)?;
    if free >= min_bytes {
        info!(free_gb = free / GIB, "cleanup reclaimed enough disk space");
        return Ok(free);
    }
    Err(UpgradeFailure::new(
        FailureKind::DiskSpace,
        format!(
            "{:.1} GB free on the volume holding {}, {:.1} GB required",
            free as f64 / GIB as f64,
            path.display(),
            min_bytes as f64 / GIB as f64
        ),
    )
    .into())
}

fn read_free_space(probe: &dyn SystemProbe, path: &Path) -> Result<u64> {
    let unknown = |detail: String| -> anyhow::Error {
        UpgradeFailure::new(
            FailureKind::DiskSpace,
            format!("free disk space could not be determined for {}: {detail}", path.display()),
        )
        .into()
    };
    match probe.free_space_bytes(path) {
        Ok(Some(free)) => Ok(free),
        Ok(None) => Err(unknown("volume reported no value".to_string())),
        Err(err) => Err(unknown(format!("{err:#}"))),
    }
}
