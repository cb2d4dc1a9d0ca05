use super::*;

#[test]
fn error_code_normalizes_decimal_and_hex_forms() {
    let hex = ErrorCode::parse("0xC1900208").expect("hex must parse");
    let signed = ErrorCode::parse("-1047526904").expect("signed decimal must parse");
    let unsigned = ErrorCode::parse("3247440392").expect("unsigned decimal must parse");
    let sign_extended = ErrorCode::parse("0xFFFFFFFFC1900208").expect("masked hex must parse");

    assert_eq!(hex, INCOMPATIBLE_APP_OR_DRIVER);
    assert_eq!(signed, hex);
    assert_eq!(unsigned, hex);
    assert_eq!(sign_extended, hex);
    assert_eq!(hex.to_string(), "0xC1900208");
    assert_eq!(ErrorCode::parse("3010").expect("small code").to_string(), "3010");
}

#[test]
fn error_code_rejects_garbage() {
    assert!(ErrorCode::parse("").is_err());
    assert!(ErrorCode::parse("0xZZ").is_err());
    assert!(ErrorCode::parse("99999999999").is_err());
}

#[test]
fn setup_success_codes_cover_reboot_variants() {
    assert!(is_setup_success_code(ErrorCode::new(0)));
    assert!(is_setup_success_code(ErrorCode::new(3010)));
    assert!(is_setup_success_code(ErrorCode::new(1641)));
    assert!(!is_setup_success_code(INCOMPATIBLE_APP_OR_DRIVER));
}

#[test]
fn builtin_catalog_has_entries_for_every_failure_kind() {
    let catalog = ErrorCatalog::builtin().expect("embedded catalog must parse");
    for kind in [
        FailureKind::Hardware,
        FailureKind::SecurityAgent,
        FailureKind::DiskSpace,
        FailureKind::DownloadTransport,
        FailureKind::DownloadValidation,
        FailureKind::DownloadHash,
        FailureKind::MountFailed,
        FailureKind::InstallerMissing,
        FailureKind::StagingStalled,
        FailureKind::Staging,
        FailureKind::StateCorrupt,
        FailureKind::Unexpected,
    ] {
        assert!(
            catalog.lookup(kind.default_code()).is_some(),
            "missing catalog entry for {}",
            kind.as_str()
        );
    }
}

#[test]
fn builtin_catalog_marks_special_setup_codes() {
    let catalog = ErrorCatalog::builtin().expect("embedded catalog must parse");

    let blocked = catalog
        .lookup(INCOMPATIBLE_APP_OR_DRIVER)
        .expect("compat block entry");
    assert_eq!(blocked.disposition, StagingDisposition::Escalate);
    assert!(!blocked.recoverable);
    assert!(blocked.repair.is_none());

    let corrupt = catalog.lookup(CORRUPT_SOURCE_MEDIA).expect("corrupt media entry");
    assert_eq!(corrupt.disposition, StagingDisposition::Redownload);

    let store = catalog
        .lookup(ErrorCode::new(0x8007_3712))
        .expect("component store entry");
    assert!(store.recoverable);
    assert_eq!(store.repair, Some(RepairAction::DismRestoreHealth));
}

#[test]
fn catalog_accepts_numeric_codes_and_overrides_builtin() {
    let external = r#"{
        "version": 1,
        "entries": [
            { "code": -1047526904, "title": "Blocked by LOB app", "remediation": "Call desk", "disposition": "escalate" },
            { "code": "0x80240020", "title": "Custom", "recoverable": true, "repair": "reset_update_components" }
        ]
    }"#;
    let mut catalog = ErrorCatalog::builtin().expect("builtin");
    let before = catalog.len();
    catalog.merge(ErrorCatalog::from_json_str(external).expect("external must parse"));

    assert_eq!(catalog.len(), before + 1);
    assert_eq!(
        catalog
            .lookup(INCOMPATIBLE_APP_OR_DRIVER)
            .expect("overridden")
            .title,
        "Blocked by LOB app"
    );
    let describe = catalog.describe(INCOMPATIBLE_APP_OR_DRIVER);
    assert!(describe.contains("0xC1900208"), "{describe}");
    assert!(describe.contains("Call desk"), "{describe}");
}

#[test]
fn catalog_rejects_free_form_repair_commands() {
    let external = r#"{
        "entries": [
            { "code": "0x80070002", "title": "x", "recoverable": true, "repair_command": "cmd /c del C:\\*" }
        ]
    }"#;
    let err = ErrorCatalog::from_json_str(external).expect_err("command strings must be rejected");
    assert!(err.to_string().contains("repair_command"), "{err}");
}

#[test]
fn catalog_rejects_unknown_repair_token() {
    let external = r#"{ "entries": [ { "code": 5, "title": "x", "repair": "format_disk" } ] }"#;
    assert!(ErrorCatalog::from_json_str(external).is_err());
}

#[test]
fn catalog_rejects_recoverable_escalation() {
    let external = r#"{ "entries": [ { "code": 5, "title": "x", "recoverable": true, "disposition": "escalate" } ] }"#;
    assert!(ErrorCatalog::from_json_str(external).is_err());
}

#[test]
fn describe_unknown_code_still_names_code() {
    let catalog = ErrorCatalog::default();
    let text = catalog.describe(ErrorCode::new(0xDEAD_BEEF));
    assert!(text.contains("0xDEADBEEF"));
}

#[test]
fn config_defaults_apply_to_empty_document() {
    let config = UpgradeConfig::from_json_str("{}").expect("empty config must load");
    assert_eq!(config, UpgradeConfig::default());
    assert_eq!(config.download_attempts, 3);
    assert_eq!(config.stage_attempts, 2);
    assert_eq!(config.download_stall_timeout_secs, 300);
    assert_eq!(config.stage_stall_timeout_secs, 2700);
    assert_eq!(config.boot_tolerance_secs, 30);
    assert_eq!(config.state_dir(), config.work_dir.join("state"));
}

#[test]
fn config_placeholders_fall_back_to_defaults() {
    let raw = r#"{
        "iso_url": "@IsoUrl@",
        "iso_sha256": "@IsoHash@",
        "auto_reboot": true,
        "reminder_times": ["@ReminderAm@", "16:30"],
        "security_agent": { "service_name": "@AgentService@", "min_version": "25.1.0.0" },
        "notify_command": "C:\\Tools\\notify.exe"
    }"#;
    let config = UpgradeConfig::from_json_str(raw).expect("config with placeholders must load");
    let defaults = UpgradeConfig::default();

    assert_eq!(config.iso_url, defaults.iso_url);
    assert_eq!(config.iso_sha256, None);
    assert!(config.auto_reboot);
    assert_eq!(config.reminder_times, defaults.reminder_times);
    assert_eq!(config.security_agent.service_name, "SentinelAgent");
    assert_eq!(config.security_agent.min_version, "25.1.0.0");
    assert_eq!(config.notify_command.as_deref(), Some("C:\\Tools\\notify.exe"));
}

#[test]
fn config_normalizes_and_validates_hash() {
    let upper = "AB".repeat(32);
    let raw = format!(r#"{{ "iso_sha256": "{upper}" }}"#);
    let config = UpgradeConfig::from_json_str(&raw).expect("uppercase hash must load");
    assert_eq!(config.iso_sha256, Some("ab".repeat(32)));

    let err = UpgradeConfig::from_json_str(r#"{ "iso_sha256": "abc" }"#)
        .expect_err("short hash must fail");
    assert!(format!("{err:#}").contains("64 hex"), "{err:#}");

    let empty = UpgradeConfig::from_json_str(r#"{ "iso_sha256": "  " }"#).expect("blank hash");
    assert_eq!(empty.iso_sha256, None);
}

#[test]
fn config_rejects_mismatched_reminder_lists_and_bad_times() {
    let mismatched = r#"{ "reminder_times": ["09:00"], "reminder_task_names": ["a", "b"] }"#;
    assert!(UpgradeConfig::from_json_str(mismatched).is_err());

    let bad_time = r#"{ "reminder_times": ["25:00", "10:00"] }"#;
    assert!(UpgradeConfig::from_json_str(bad_time).is_err());

    let zero_attempts = r#"{ "download_attempts": 0 }"#;
    assert!(UpgradeConfig::from_json_str(zero_attempts).is_err());
}

#[test]
fn reminder_time_round_trips_as_text() {
    let time = ReminderTime::parse("7:05").expect("must parse");
    assert_eq!(time.to_string(), "07:05");
    assert_eq!(time.hour(), 7);
    assert_eq!(time.minute(), 5);
}

#[test]
fn dotted_version_orders_with_zero_padding() {
    let old = DottedVersion::parse("20.0.0.0").expect("parse");
    let min = DottedVersion::parse("24.2.2.0").expect("parse");
    let newer = DottedVersion::parse("24.2.10").expect("parse");

    assert!(old < min);
    assert!(newer > min);
    assert_eq!(
        DottedVersion::parse("24.2").expect("parse"),
        DottedVersion::parse("24.2.0.0").expect("parse")
    );
    assert_eq!(min.to_string(), "24.2.2.0");
    assert!(DottedVersion::parse("unknown").is_err());
    assert!(DottedVersion::parse("").is_err());
}

#[test]
fn failure_marker_text_includes_catalog_remediation() {
    let catalog = ErrorCatalog::builtin().expect("builtin");
    let failure =
        UpgradeFailure::new(FailureKind::DownloadHash, "sha256 mismatch after 3 attempts");
    let text = failure.marker_text(&catalog);

    assert!(text.contains("0xA0010012"), "{text}");
    assert!(text.contains("hash"), "{text}");
    assert!(text.contains("Remediation"), "{text}");
}

#[test]
fn phase_tokens_parse_back() {
    for phase in [Phase::ScriptRunning, Phase::PendingReboot, Phase::UpgradeFailed] {
        assert_eq!(Phase::parse(phase.as_str()).expect("token"), phase);
    }
    assert!(Phase::parse("completed").is_err());
    assert_eq!(ReminderMode::parse_token("logon"), ReminderMode::Logon);
    assert_eq!(ReminderMode::parse_token("weekly"), ReminderMode::Daily);
}
