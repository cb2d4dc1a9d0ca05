use std::fmt;

use crate::catalog::{ErrorCatalog, ErrorCode};

/// Failure classes the orchestrator distinguishes. Each class without a
/// native Windows code owns an application code in the `0xA001xxxx` range,
/// and every one of them has an entry in the built-in catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Hardware,
    SecurityAgent,
    DiskSpace,
    DownloadTransport,
    DownloadValidation,
    DownloadHash,
    MountFailed,
    InstallerMissing,
    StagingStalled,
    Staging,
    Escalated,
    StateCorrupt,
    Unexpected,
}

impl FailureKind {
    pub fn default_code(self) -> ErrorCode {
        match self {
            Self::Hardware => ErrorCode::new(0xA001_0001),
            Self::SecurityAgent => ErrorCode::new(0xA001_0002),
            Self::DiskSpace => ErrorCode::new(0x8007_0070),
            Self::DownloadTransport => ErrorCode::new(0xA001_0010),
            Self::DownloadValidation => ErrorCode::new(0xA001_0011),
            Self::DownloadHash => ErrorCode::new(0xA001_0012),
            Self::MountFailed => ErrorCode::new(0xA001_0020),
            Self::InstallerMissing => ErrorCode::new(0xA001_0021),
            Self::StagingStalled => ErrorCode::new(0xA001_0022),
            Self::Staging | Self::Escalated => ErrorCode::new(0xA001_0023),
            Self::StateCorrupt => ErrorCode::new(0xA001_0030),
            Self::Unexpected => ErrorCode::new(0xA001_00FF),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::SecurityAgent => "security_agent",
            Self::DiskSpace => "disk_space",
            Self::DownloadTransport => "transport_unavailable",
            Self::DownloadValidation => "validation_failed",
            Self::DownloadHash => "hash_mismatch",
            Self::MountFailed => "mount_failed",
            Self::InstallerMissing => "installer_missing",
            Self::StagingStalled => "staging_stalled",
            Self::Staging => "staging",
            Self::Escalated => "escalated",
            Self::StateCorrupt => "state_corrupt",
            Self::Unexpected => "unexpected",
        }
    }

    /// Gate failures and technician escalations are not retried on the next
    /// run without something on the machine changing first.
    pub fn is_gate(self) -> bool {
        matches!(self, Self::Hardware | Self::SecurityAgent | Self::DiskSpace)
    }
}

/// A classified failure. Travels inside `anyhow::Error` and is recovered
/// with `downcast_ref` where the failure marker is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeFailure {
    pub kind: FailureKind,
    pub code: ErrorCode,
    pub detail: String,
}

impl UpgradeFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.default_code(),
            detail: detail.into(),
        }
    }

    pub fn with_code(kind: FailureKind, code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            detail: detail.into(),
        }
    }

    /// Text written to the failure marker: enough for a technician to act
    /// without opening the log.
    pub fn marker_text(&self, catalog: &ErrorCatalog) -> String {
        format!(
            "{} ({}): {}",
            catalog.describe(self.code),
            self.kind.as_str(),
            self.detail
        )
    }
}

impl fmt::Display for UpgradeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.kind.as_str(), self.code, self.detail)
    }
}

impl std::error::Error for UpgradeFailure {}
