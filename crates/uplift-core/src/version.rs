use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context};

/// Dotted numeric version as reported by Windows services and file
/// metadata (`24.2.2.0`). Missing trailing components compare as zero.
#[derive(Debug, Clone, Eq)]
pub struct DottedVersion {
    parts: Vec<u32>,
}

impl DottedVersion {
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let trimmed = input.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(anyhow!("version string is empty"));
        }

        let parts = trimmed
            .split('.')
            .map(|part| {
                part.parse::<u32>()
                    .with_context(|| format!("invalid version component '{part}' in '{input}'"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[u32] {
        &self.parts
    }
}

impl FromStr for DottedVersion {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl fmt::Display for DottedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .parts
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&rendered)
    }
}

impl PartialEq for DottedVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for DottedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DottedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for idx in 0..len {
            let left = self.parts.get(idx).copied().unwrap_or(0);
            let right = other.parts.get(idx).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}
