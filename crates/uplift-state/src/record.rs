use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uplift_core::{
    ErrorCode, FailureRecord, PendingRebootRecord, Phase, PhaseRecord, ReminderMode,
    ScriptRunningRecord,
};

const RECORD_SCHEMA: u32 = 1;

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value.trim())
        .with_context(|| format!("invalid timestamp '{value}'"))?
        .with_timezone(&Utc))
}

pub fn serialize_record(record: &PhaseRecord) -> String {
    let mut payload = String::new();
    payload.push_str(&format!("schema={RECORD_SCHEMA}\n"));
    payload.push_str(&format!("phase={}\n", record.phase().as_str()));
    match record {
        PhaseRecord::ScriptRunning(running) => {
            payload.push_str(&format!(
                "started_at={}\n",
                format_timestamp(running.started_at)
            ));
            if let Some(boot) = running.last_boot {
                payload.push_str(&format!("last_boot={}\n", format_timestamp(boot)));
            }
            payload.push_str(&format!("pid={}\n", running.pid));
        }
        PhaseRecord::PendingReboot(pending) => {
            payload.push_str(&format!(
                "staged_at={}\n",
                format_timestamp(pending.staged_at)
            ));
            if let Some(boot) = pending.last_boot {
                payload.push_str(&format!("last_boot={}\n", format_timestamp(boot)));
            }
            payload.push_str(&format!(
                "reminder_mode={}\n",
                pending.reminder_mode.as_str()
            ));
        }
        PhaseRecord::UpgradeFailed(failure) => {
            payload.push_str(&format!(
                "failed_at={}\n",
                format_timestamp(failure.failed_at)
            ));
            if let Some(code) = failure.code {
                payload.push_str(&format!("code={code}\n"));
            }
            payload.push_str(&format!("reason={}\n", escape_value(&failure.reason)));
        }
    }
    payload
}

/// Parses a marker written for `expected`. Structural problems (bad schema,
/// phase mismatch, malformed values, missing entry timestamp) are errors;
/// optional attributes that are absent fall back to defaults and unknown keys
/// are ignored.
pub fn parse_record(raw: &str, expected: Phase) -> Result<PhaseRecord> {
    let mut fields = HashMap::new();
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("malformed state line: {line}"))?;
        fields.insert(key.trim().to_string(), value.to_string());
    }

    if let Some(schema) = fields.get("schema") {
        let schema: u32 = schema
            .trim()
            .parse()
            .with_context(|| format!("invalid schema value '{schema}'"))?;
        if schema != RECORD_SCHEMA {
            return Err(anyhow!(
                "unsupported state schema {schema} (expected {RECORD_SCHEMA})"
            ));
        }
    }
    if let Some(phase) = fields.get("phase") {
        let phase = Phase::parse(phase.trim())?;
        if phase != expected {
            return Err(anyhow!(
                "marker for {} holds a {} record",
                expected.as_str(),
                phase.as_str()
            ));
        }
    }

    let required_timestamp = |key: &str| -> Result<DateTime<Utc>> {
        let value = fields
            .get(key)
            .ok_or_else(|| anyhow!("missing state field: {key}"))?;
        parse_timestamp(value).with_context(|| format!("invalid state field: {key}"))
    };
    let optional_timestamp = |key: &str| -> Result<Option<DateTime<Utc>>> {
        fields
            .get(key)
            .filter(|value| !value.trim().is_empty())
            .map(|value| {
                parse_timestamp(value).with_context(|| format!("invalid state field: {key}"))
            })
            .transpose()
    };

    let record = match expected {
        Phase::ScriptRunning => PhaseRecord::ScriptRunning(ScriptRunningRecord {
            started_at: required_timestamp("started_at")?,
            last_boot: optional_timestamp("last_boot")?,
            pid: match fields.get("pid") {
                Some(pid) => pid
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid state field: pid ('{pid}')"))?,
                None => 0,
            },
        }),
        Phase::PendingReboot => PhaseRecord::PendingReboot(PendingRebootRecord {
            staged_at: required_timestamp("staged_at")?,
            last_boot: optional_timestamp("last_boot")?,
            reminder_mode: fields
                .get("reminder_mode")
                .map(|mode| ReminderMode::parse_token(mode.trim()))
                .unwrap_or(ReminderMode::Daily),
        }),
        Phase::UpgradeFailed => PhaseRecord::UpgradeFailed(FailureRecord {
            failed_at: required_timestamp("failed_at")?,
            reason: fields
                .get("reason")
                .map(|reason| unescape_value(reason))
                .transpose()?
                .unwrap_or_default(),
            code: fields
                .get("code")
                .map(|code| ErrorCode::parse(code))
                .transpose()
                .context("invalid state field: code")?,
        }),
    };
    Ok(record)
}

fn escape_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn unescape_value(value: &str) -> Result<String> {
    let mut out = String::new();
    let mut chars = value.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }

        let escaped = chars
            .next()
            .ok_or_else(|| anyhow!("unterminated escape sequence in state value"))?;
        match escaped {
            '\\' => out.push('\\'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            other => return Err(anyhow!("unsupported escape sequence: \\{other}")),
        }
    }

    Ok(out)
}
