use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Exit codes from Windows Setup that mean staging succeeded: plain success,
/// `ERROR_SUCCESS_REBOOT_REQUIRED` and `ERROR_SUCCESS_REBOOT_INITIATED`.
pub const SETUP_SUCCESS_CODES: [u32; 3] = [0, 3010, 1641];

/// `ERROR_INVALID_DATA`: setup could not read its own source media.
pub const CORRUPT_SOURCE_MEDIA: ErrorCode = ErrorCode::new(0x8007_000D);

/// Setup compatibility block raised by an installed application or driver.
pub const INCOMPATIBLE_APP_OR_DRIVER: ErrorCode = ErrorCode::new(0xC190_0208);

const BUILTIN_CATALOG: &str = include_str!("default_catalog.json");

pub fn is_setup_success_code(code: ErrorCode) -> bool {
    SETUP_SUCCESS_CODES.contains(&code.value())
}

/// A failure code normalized to its unsigned 32-bit form, so that the
/// decimal (`-1047526904`), unsigned (`3247440392`) and hex (`0xC1900208`)
/// spellings of the same HRESULT compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ErrorCode(u32);

impl ErrorCode {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn from_exit_status(status: i32) -> Self {
        Self(status as u32)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Process exit status carrying this code; Windows reads it back as the
    /// same unsigned DWORD.
    pub fn as_exit_code(self) -> i32 {
        self.0 as i32
    }

    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("error code is empty"));
        }

        if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            let wide = u64::from_str_radix(hex, 16)
                .with_context(|| format!("invalid hex error code '{input}'"))?;
            return Ok(Self((wide & 0xFFFF_FFFF) as u32));
        }

        let wide: i64 = trimmed
            .parse()
            .with_context(|| format!("invalid decimal error code '{input}'"))?;
        if wide < i64::from(i32::MIN) || wide > i64::from(u32::MAX) {
            return Err(anyhow!("error code out of 32-bit range: '{input}'"));
        }
        Ok(Self((wide & 0xFFFF_FFFF) as u32))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 > 0xFFFF {
            write!(f, "0x{:08X}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// In-process repair routines a catalog entry may request. Catalogs name
/// one of these tokens; free-form command strings are rejected at load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    DismRestoreHealth,
    SystemFileCheck,
    ResetUpdateComponents,
    CleanupSetupLeftovers,
    ComponentCleanup,
}

impl RepairAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DismRestoreHealth => "dism_restore_health",
            Self::SystemFileCheck => "system_file_check",
            Self::ResetUpdateComponents => "reset_update_components",
            Self::CleanupSetupLeftovers => "cleanup_setup_leftovers",
            Self::ComponentCleanup => "component_cleanup",
        }
    }
}

/// How the staging executor treats a failed attempt with this code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingDisposition {
    #[default]
    Standard,
    /// Source media is suspect: drop the artifact and its cached hash.
    Redownload,
    /// Needs a technician; never retried or repaired automatically.
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub code: ErrorCode,
    pub title: String,
    pub description: String,
    pub remediation: String,
    pub recoverable: bool,
    pub repair: Option<RepairAction>,
    pub disposition: StagingDisposition,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CodeToken {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawCatalogEntry {
    code: CodeToken,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    remediation: String,
    #[serde(default)]
    recoverable: bool,
    #[serde(default)]
    repair: Option<RepairAction>,
    #[serde(default)]
    repair_command: Option<String>,
    #[serde(default)]
    disposition: StagingDisposition,
}

#[derive(Debug, Deserialize)]
struct RawCatalogFile {
    #[serde(default = "catalog_file_version")]
    version: u32,
    #[serde(default)]
    entries: Vec<RawCatalogEntry>,
}

fn catalog_file_version() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorCatalog {
    entries: BTreeMap<ErrorCode, CatalogEntry>,
}

impl ErrorCatalog {
    pub fn builtin() -> Result<Self> {
        Self::from_json_str(BUILTIN_CATALOG).context("embedded error catalog is invalid")
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        let raw: RawCatalogFile =
            serde_json::from_str(input).context("failed to parse error catalog JSON")?;
        if raw.version != catalog_file_version() {
            return Err(anyhow!(
                "unsupported error catalog version {} (expected {})",
                raw.version,
                catalog_file_version()
            ));
        }

        let mut entries = BTreeMap::new();
        for raw_entry in raw.entries {
            let entry = convert_entry(raw_entry)?;
            entries.insert(entry.code, entry);
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read error catalog: {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed to load error catalog: {}", path.display()))
    }

    /// Built-in entries overlaid with an optional external catalog.
    pub fn resolve(external: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::builtin()?;
        if let Some(path) = external {
            catalog.merge(Self::load(path)?);
        }
        Ok(catalog)
    }

    pub fn merge(&mut self, other: ErrorCatalog) {
        self.entries.extend(other.entries);
    }

    pub fn lookup(&self, code: ErrorCode) -> Option<&CatalogEntry> {
        self.entries.get(&code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Technician-facing summary: code, title, description and remediation.
    pub fn describe(&self, code: ErrorCode) -> String {
        match self.lookup(code) {
            Some(entry) => {
                let mut text = format!("[{}] {}", entry.code, entry.title);
                if !entry.description.is_empty() {
                    text.push_str(&format!(": {}", entry.description));
                }
                if !entry.remediation.is_empty() {
                    text.push_str(&format!(" Remediation: {}", entry.remediation));
                }
                text
            }
            None => format!("[{code}] Unknown error code (not in catalog)"),
        }
    }
}

fn convert_entry(raw: RawCatalogEntry) -> Result<CatalogEntry> {
    let code = match &raw.code {
        CodeToken::Number(value) => ErrorCode::parse(&value.to_string())?,
        CodeToken::Text(value) => ErrorCode::parse(value)?,
    };
    if let Some(command) = raw.repair_command.filter(|value| !value.trim().is_empty()) {
        return Err(anyhow!(
            "catalog entry {code} uses repair_command '{command}'; free-form commands are not executed, name a repair action instead"
        ));
    }
    if raw.disposition == StagingDisposition::Escalate && (raw.recoverable || raw.repair.is_some())
    {
        return Err(anyhow!(
            "catalog entry {code} escalates to a technician and cannot also be recoverable"
        ));
    }

    Ok(CatalogEntry {
        code,
        title: raw.title,
        description: raw.description,
        remediation: raw.remediation,
        recoverable: raw.recoverable,
        repair: raw.repair,
        disposition: raw.disposition,
    })
}
