use super::*;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use uplift_core::{
    ErrorCatalog, ErrorCode, FailureKind, FailureRecord, PendingRebootRecord, Phase, PhaseRecord,
    RepairAction, ReminderMode, ReminderTime, ScriptRunningRecord, UpgradeConfig,
};
use uplift_installer::{
    AgentProbe, CleanupHooks, HardwareReport, Host, ImageMounter, InstallerProcess, Notice,
    Notifier, PowerControl, RepairRunner, SetupLauncher, SystemProbe, TaskScheduler, Transport,
};
use uplift_state::StateStore;

use crate::orchestrator::{Orchestrator, RunOutcome};
use crate::self_repair::needs_repair;

static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

const PAYLOAD: &[u8] = b"windows-11-image-payload-bytes-0123456789";
const GIB: u64 = 1024 * 1024 * 1024;
const ENTRY: &str = "\"C:\\Program Files\\Uplift\\uplift.exe\"";
const WINDOWS_10_BUILD: u32 = 19045;
const WINDOWS_11_BUILD: u32 = 22631;

fn test_dir(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let seq = DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "uplift-cli-{label}-{}-{nanos}-{seq}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("must create test dir");
    dir
}

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, hour, minute, second)
        .single()
        .expect("fixture time")
}

fn boot() -> DateTime<Utc> {
    at(6, 0, 0)
}

struct FakeProbe {
    build: Cell<u32>,
    agent: AgentProbe,
    interactive: bool,
    panic_on_build: bool,
}

impl SystemProbe for FakeProbe {
    fn last_boot_time(&self) -> Result<DateTime<Utc>> {
        Ok(boot())
    }

    fn os_build(&self) -> Result<u32> {
        if self.panic_on_build {
            panic!("build probe exploded");
        }
        Ok(self.build.get())
    }

    fn free_space_bytes(&self, _path: &Path) -> Result<Option<u64>> {
        Ok(Some(100 * GIB))
    }

    fn hardware_report(&self) -> Result<HardwareReport> {
        Ok(HardwareReport {
            tpm_spec_version: Some("2.0, 0, 1.38".to_string()),
            secure_boot_enabled: Some(true),
            is_64bit: true,
            total_memory_bytes: Some(16 * GIB),
        })
    }

    fn security_agent(&self, _service_name: &str) -> Result<AgentProbe> {
        Ok(self.agent.clone())
    }

    fn interactive_session(&self) -> bool {
        self.interactive
    }
}

struct FakeMounter {
    root: PathBuf,
    dismounts: Cell<u32>,
}

impl ImageMounter for FakeMounter {
    fn mount(&self, _image: &Path) -> Result<PathBuf> {
        Ok(self.root.clone())
    }

    fn dismount(&self, _image: &Path) -> Result<()> {
        self.dismounts.set(self.dismounts.get() + 1);
        Ok(())
    }
}

struct ExitedProcess {
    exit: i32,
}

impl InstallerProcess for ExitedProcess {
    fn id(&self) -> u32 {
        4242
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(Some(self.exit))
    }

    fn kill(&mut self) -> Result<()> {
        Ok(())
    }
}

struct FakeLauncher {
    exits: RefCell<VecDeque<u32>>,
    launches: Cell<u32>,
}

impl FakeLauncher {
    fn exiting_with(codes: &[u32]) -> Self {
        Self {
            exits: RefCell::new(codes.iter().copied().collect()),
            launches: Cell::new(0),
        }
    }
}

impl SetupLauncher for FakeLauncher {
    fn launch(&self, _program: &Path, _args: &[String]) -> Result<Box<dyn InstallerProcess>> {
        self.launches.set(self.launches.get() + 1);
        let exit = self
            .exits
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("unexpected extra setup launch"))?;
        Ok(Box::new(ExitedProcess { exit: exit as i32 }))
    }
}

/// Keeps the registered triggers so `task_exists` answers like the real
/// scheduler.
#[derive(Default)]
struct FakeScheduler {
    tasks: RefCell<BTreeMap<String, String>>,
    run_once: RefCell<BTreeSet<String>>,
}

impl FakeScheduler {
    fn kind_of(&self, name: &str) -> Option<String> {
        self.tasks.borrow().get(name).cloned()
    }

    fn has_run_once(&self, value_name: &str) -> bool {
        self.run_once.borrow().contains(value_name)
    }
}

impl TaskScheduler for FakeScheduler {
    fn register_daily(&self, name: &str, at: ReminderTime, _command_line: &str) -> Result<()> {
        self.tasks
            .borrow_mut()
            .insert(name.to_string(), format!("daily@{at}"));
        Ok(())
    }

    fn register_logon(&self, name: &str, _command_line: &str) -> Result<()> {
        self.tasks
            .borrow_mut()
            .insert(name.to_string(), "logon".to_string());
        Ok(())
    }

    fn register_startup(&self, name: &str, command_line: &str) -> Result<()> {
        self.tasks
            .borrow_mut()
            .insert(name.to_string(), format!("startup:{command_line}"));
        Ok(())
    }

    fn delete_task(&self, name: &str) -> Result<()> {
        self.tasks.borrow_mut().remove(name);
        Ok(())
    }

    fn task_exists(&self, name: &str) -> Result<bool> {
        Ok(self.tasks.borrow().contains_key(name))
    }

    fn set_run_once(&self, value_name: &str, _command_line: &str) -> Result<()> {
        self.run_once.borrow_mut().insert(value_name.to_string());
        Ok(())
    }

    fn delete_run_once(&self, value_name: &str) -> Result<()> {
        self.run_once.borrow_mut().remove(value_name);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    notices: RefCell<Vec<(Notice, String)>>,
}

impl RecordingNotifier {
    fn kinds(&self) -> Vec<Notice> {
        self.notices.borrow().iter().map(|(notice, _)| *notice).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice, detail: &str) -> Result<()> {
        self.notices
            .borrow_mut()
            .push((notice, detail.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingCleanup {
    failure_cleanups: Cell<u32>,
    completion_cleanups: Cell<u32>,
}

impl CleanupHooks for RecordingCleanup {
    fn failure_cleanup(&self) -> Result<()> {
        self.failure_cleanups.set(self.failure_cleanups.get() + 1);
        Ok(())
    }

    fn completion_cleanup(&self) -> Result<()> {
        self.completion_cleanups
            .set(self.completion_cleanups.get() + 1);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRepair {
    runs: RefCell<Vec<RepairAction>>,
}

impl RepairRunner for RecordingRepair {
    fn run_repair(&self, action: RepairAction) -> Result<()> {
        self.runs.borrow_mut().push(action);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingPower {
    restarts: RefCell<Vec<Duration>>,
}

impl PowerControl for RecordingPower {
    fn schedule_restart(&self, delay: Duration, _reason: &str) -> Result<()> {
        self.restarts.borrow_mut().push(delay);
        Ok(())
    }
}

struct FakeTransport {
    payload: Option<&'static [u8]>,
    calls: Cell<u32>,
}

impl Transport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn fetch(&self, _url: &str, dest: &Path, _stall_timeout: Duration) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        match self.payload {
            Some(payload) => {
                fs::write(dest, payload)?;
                Ok(())
            }
            None => Err(anyhow!("connection refused")),
        }
    }
}

struct Fixture {
    dir: PathBuf,
    config: UpgradeConfig,
    catalog: ErrorCatalog,
    store: StateStore,
    probe: FakeProbe,
    mounter: FakeMounter,
    launcher: FakeLauncher,
    scheduler: FakeScheduler,
    notifier: RecordingNotifier,
    cleanup: RecordingCleanup,
    repair: RecordingRepair,
    power: RecordingPower,
    primary: FakeTransport,
    fallback: FakeTransport,
}

impl Fixture {
    fn new(label: &str) -> Self {
        let dir = test_dir(label);
        let volume = dir.join("volume");
        fs::create_dir_all(&volume).expect("volume dir");
        fs::write(volume.join("setup.exe"), b"MZ").expect("setup.exe fixture");

        let config = UpgradeConfig {
            iso_url: "https://downloads.example.test/Win11.iso".to_string(),
            iso_min_size_bytes: 16,
            min_free_space_gb: 1,
            work_dir: dir.join("work"),
            stage_poll_interval_ms: 1,
            ..UpgradeConfig::default()
        };
        let store = StateStore::open(config.state_dir());

        Self {
            config,
            catalog: ErrorCatalog::builtin().expect("built-in catalog"),
            store,
            probe: FakeProbe {
                build: Cell::new(WINDOWS_10_BUILD),
                agent: AgentProbe::NotInstalled,
                interactive: true,
                panic_on_build: false,
            },
            mounter: FakeMounter {
                root: volume,
                dismounts: Cell::new(0),
            },
            launcher: FakeLauncher::exiting_with(&[3010]),
            scheduler: FakeScheduler::default(),
            notifier: RecordingNotifier::default(),
            cleanup: RecordingCleanup::default(),
            repair: RecordingRepair::default(),
            power: RecordingPower::default(),
            primary: FakeTransport {
                payload: Some(PAYLOAD),
                calls: Cell::new(0),
            },
            fallback: FakeTransport {
                payload: None,
                calls: Cell::new(0),
            },
            dir,
        }
    }

    fn host(&self) -> Host<'_> {
        Host {
            probe: &self.probe,
            mounter: &self.mounter,
            launcher: &self.launcher,
            scheduler: &self.scheduler,
            notifier: &self.notifier,
            cleanup: &self.cleanup,
            repair: &self.repair,
            power: &self.power,
            primary_transport: &self.primary,
            fallback_transport: &self.fallback,
        }
    }

    fn run(&self) -> RunOutcome {
        Orchestrator::new(&self.config, &self.catalog, &self.store, self.host(), ENTRY)
            .run_guarded()
    }

    fn transfers(&self) -> u32 {
        self.primary.calls.get() + self.fallback.calls.get()
    }

    fn failure_reason(&self) -> String {
        self.store
            .read_failure()
            .expect("failure marker must parse")
            .expect("failure marker must exist")
            .reason
    }

    fn pending_reboot(&self, last_boot: DateTime<Utc>) -> PendingRebootRecord {
        let record = PendingRebootRecord {
            staged_at: at(9, 30, 0),
            last_boot: Some(last_boot),
            reminder_mode: ReminderMode::Daily,
        };
        self.store
            .write_state(&PhaseRecord::PendingReboot(record.clone()))
            .expect("seed pending reboot");
        record
    }

    fn validation_registered(&self) -> bool {
        self.scheduler
            .kind_of(&self.config.validation_task_name)
            .is_some_and(|kind| kind.starts_with("startup:"))
            && self.scheduler.has_run_once(&self.config.run_once_value_name)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn failure_of(outcome: &RunOutcome) -> &uplift_core::UpgradeFailure {
    match outcome {
        RunOutcome::Blocked(failure) | RunOutcome::Failed(failure) => failure,
        other => panic!("expected a failure outcome, got {other:?}"),
    }
}

#[test]
fn needs_repair_only_past_the_boot_tolerance() {
    let tolerance = Duration::from_secs(30);
    let recorded = boot();

    assert!(needs_repair(
        Phase::ScriptRunning,
        Some(recorded),
        Some(recorded + chrono::Duration::seconds(60)),
        tolerance
    ));
    assert!(!needs_repair(
        Phase::ScriptRunning,
        Some(recorded),
        Some(recorded + chrono::Duration::seconds(10)),
        tolerance
    ));
    assert!(needs_repair(
        Phase::PendingReboot,
        Some(recorded),
        Some(recorded + chrono::Duration::seconds(60)),
        tolerance
    ));
}

#[test]
fn needs_repair_ignores_failures_and_unknown_boot_times() {
    let tolerance = Duration::from_secs(30);
    let later = boot() + chrono::Duration::hours(1);

    assert!(!needs_repair(Phase::UpgradeFailed, Some(boot()), Some(later), tolerance));
    assert!(!needs_repair(Phase::ScriptRunning, None, Some(later), tolerance));
    assert!(!needs_repair(Phase::PendingReboot, Some(boot()), None, tolerance));
    assert!(!needs_repair(Phase::PendingReboot, Some(later), Some(boot()), tolerance));
}

#[test]
fn fresh_machine_stages_and_waits_for_reboot() {
    let fx = Fixture::new("fresh");

    let outcome = fx.run();

    assert_eq!(
        outcome,
        RunOutcome::Staged {
            exit_code: ErrorCode::new(3010)
        }
    );
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(fx.launcher.launches.get(), 1);
    assert_eq!(fx.mounter.dismounts.get(), 1);

    match fx.store.read_state().expect("state must read") {
        Some(PhaseRecord::PendingReboot(record)) => {
            assert_eq!(record.last_boot, Some(boot()));
            assert_eq!(record.reminder_mode, ReminderMode::Daily);
        }
        other => panic!("expected pending reboot, got {other:?}"),
    }
    for name in &fx.config.reminder_task_names {
        let kind = fx.scheduler.kind_of(name).expect("reminder registered");
        assert!(kind.starts_with("daily@"), "{name}: {kind}");
    }
    assert!(fx.validation_registered());
    assert_eq!(
        fx.scheduler.kind_of(&fx.config.validation_task_name),
        Some(format!("startup:{ENTRY}"))
    );
    assert_eq!(fx.notifier.kinds(), vec![Notice::UpgradeStaged]);
    assert!(fx.power.restarts.borrow().is_empty());
    assert!(fx.store.read_failure().expect("failure read").is_none());
}

#[test]
fn staging_without_a_session_registers_logon_reminders() {
    let mut fx = Fixture::new("headless");
    fx.probe.interactive = false;

    fx.run();

    for name in &fx.config.reminder_task_names {
        assert_eq!(fx.scheduler.kind_of(name).as_deref(), Some("logon"));
    }
    match fx.store.read_state().expect("state must read") {
        Some(PhaseRecord::PendingReboot(record)) => {
            assert_eq!(record.reminder_mode, ReminderMode::Logon)
        }
        other => panic!("expected pending reboot, got {other:?}"),
    }
}

#[test]
fn auto_reboot_restarts_only_after_staging() {
    let mut fx = Fixture::new("auto-reboot");
    fx.config.auto_reboot = true;
    fx.config.reboot_delay_secs = 120;

    fx.run();
    assert_eq!(*fx.power.restarts.borrow(), vec![Duration::from_secs(120)]);

    // Second run in the same boot is only a reminder.
    assert_eq!(fx.run(), RunOutcome::AwaitingReboot);
    assert_eq!(fx.power.restarts.borrow().len(), 1);
}

#[test]
fn target_build_runs_completion_cleanup_without_staging() {
    let fx = Fixture::new("completed");
    fx.probe.build.set(WINDOWS_11_BUILD);
    fx.pending_reboot(boot() - chrono::Duration::hours(2));
    for name in &fx.config.reminder_task_names {
        fx.scheduler
            .register_daily(name, ReminderTime::new(10, 0), ENTRY)
            .expect("seed reminder");
    }
    fx.scheduler
        .set_run_once(&fx.config.run_once_value_name, ENTRY)
        .expect("seed run once");
    fs::create_dir_all(&fx.config.work_dir).expect("work dir");
    fs::write(fx.config.iso_path(), PAYLOAD).expect("seed image");

    let outcome = fx.run();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(fx.transfers(), 0);
    assert_eq!(fx.launcher.launches.get(), 0);
    assert_eq!(fx.cleanup.completion_cleanups.get(), 1);
    assert!(fx.store.read_state().expect("state must read").is_none());
    assert!(fx.store.committed_phases().is_empty());
    assert!(!fx.config.iso_path().exists());
    assert!(fx.scheduler.tasks.borrow().is_empty());
    assert!(!fx.scheduler.has_run_once(&fx.config.run_once_value_name));
    assert_eq!(fx.notifier.kinds(), vec![Notice::UpgradeCompleted]);
}

#[test]
fn outdated_security_agent_blocks_and_removes_reminders() {
    let mut fx = Fixture::new("agent-blocked");
    fx.probe.agent = AgentProbe::Installed {
        version: Some("20.0.0.0".to_string()),
    };
    fx.pending_reboot(boot());
    for name in &fx.config.reminder_task_names {
        fx.scheduler
            .register_daily(name, ReminderTime::new(15, 0), ENTRY)
            .expect("seed reminder");
    }

    let outcome = fx.run();

    let failure = failure_of(&outcome);
    assert!(matches!(outcome, RunOutcome::Blocked(_)));
    assert_eq!(failure.kind, FailureKind::SecurityAgent);
    assert_eq!(
        outcome.exit_code(),
        FailureKind::SecurityAgent.default_code().as_exit_code()
    );
    let reason = fx.failure_reason();
    assert!(reason.contains("20.0.0.0"), "{reason}");
    assert!(reason.contains("24.2.2.0"), "{reason}");
    for name in &fx.config.reminder_task_names {
        assert!(fx.scheduler.kind_of(name).is_none(), "{name} still registered");
    }
    assert_eq!(
        fx.store.read_state().expect("state must read").map(|r| r.phase()),
        Some(Phase::UpgradeFailed)
    );
    assert_eq!(fx.transfers(), 0);
    assert_eq!(fx.launcher.launches.get(), 0);
    assert_eq!(fx.notifier.kinds(), vec![Notice::UpgradeBlocked]);
}

#[test]
fn pending_reboot_without_reboot_is_idempotent() {
    let fx = Fixture::new("pending");
    let record = fx.pending_reboot(boot());

    for _ in 0..2 {
        assert_eq!(fx.run(), RunOutcome::AwaitingReboot);
        assert_eq!(
            fx.store.read_state().expect("state must read"),
            Some(PhaseRecord::PendingReboot(record.clone()))
        );
    }

    assert_eq!(fx.transfers(), 0);
    assert_eq!(fx.launcher.launches.get(), 0);
    assert!(fx.validation_registered());
    for name in &fx.config.reminder_task_names {
        assert!(fx.scheduler.kind_of(name).is_some(), "{name} missing");
    }
    assert_eq!(
        fx.notifier.kinds(),
        vec![Notice::RebootReminder, Notice::RebootReminder]
    );
}

#[test]
fn pending_reboot_across_a_reboot_without_upgrade_self_repairs() {
    let fx = Fixture::new("repair-pending");
    fx.pending_reboot(boot() - chrono::Duration::hours(3));
    fs::create_dir_all(&fx.config.work_dir).expect("work dir");

    let outcome = fx.run();

    assert_eq!(
        outcome,
        RunOutcome::Repaired {
            exit_code: ErrorCode::new(3010)
        }
    );
    assert!(fx.cleanup.failure_cleanups.get() >= 1);
    assert_eq!(fx.launcher.launches.get(), 1);
    match fx.store.read_state().expect("state must read") {
        Some(PhaseRecord::PendingReboot(record)) => assert_eq!(record.last_boot, Some(boot())),
        other => panic!("expected refreshed pending reboot, got {other:?}"),
    }
    assert!(fx.validation_registered());
}

#[test]
fn interrupted_run_before_reboot_restarts_staging() {
    let fx = Fixture::new("crashed");
    fx.store
        .write_state(&PhaseRecord::ScriptRunning(ScriptRunningRecord {
            started_at: at(6, 5, 0),
            last_boot: Some(boot()),
            pid: 31337,
        }))
        .expect("seed script running");

    let outcome = fx.run();

    assert!(matches!(outcome, RunOutcome::Staged { .. }), "{outcome:?}");
    assert_eq!(fx.cleanup.failure_cleanups.get(), 0);
}

#[test]
fn failed_self_repair_records_an_aggregated_reason() {
    let mut fx = Fixture::new("repair-fails");
    fx.launcher = FakeLauncher::exiting_with(&[0xC190_0208]);
    fx.store
        .write_state(&PhaseRecord::ScriptRunning(ScriptRunningRecord {
            started_at: at(5, 0, 0),
            last_boot: Some(boot() - chrono::Duration::hours(1)),
            pid: 777,
        }))
        .expect("seed script running");

    let outcome = fx.run();

    let failure = failure_of(&outcome);
    assert_eq!(failure.kind, FailureKind::Escalated);
    assert!(
        failure
            .detail
            .contains("self-repair after interrupted script_running"),
        "{}",
        failure.detail
    );
    assert_eq!(outcome.exit_code(), ErrorCode::new(0xC190_0208).as_exit_code());
    assert!(fx.failure_reason().contains("self-repair"));
}

#[test]
fn previous_failure_is_cleared_before_a_new_attempt() {
    let fx = Fixture::new("retry-after-failure");
    fx.store
        .write_failure(&FailureRecord {
            failed_at: at(4, 0, 0),
            reason: "download failed".to_string(),
            code: Some(FailureKind::DownloadTransport.default_code()),
        })
        .expect("seed failure");

    let outcome = fx.run();

    assert!(matches!(outcome, RunOutcome::Staged { .. }), "{outcome:?}");
    assert_eq!(fx.cleanup.failure_cleanups.get(), 1);
    assert!(fx.store.read_failure().expect("failure read").is_none());
}

#[test]
fn compatibility_block_fails_with_the_setup_code() {
    let mut fx = Fixture::new("escalated");
    fx.launcher = FakeLauncher::exiting_with(&[0xC190_0208]);

    let outcome = fx.run();

    let failure = failure_of(&outcome);
    assert!(matches!(outcome, RunOutcome::Failed(_)));
    assert_eq!(failure.kind, FailureKind::Escalated);
    assert_eq!(outcome.exit_code(), ErrorCode::new(0xC190_0208).as_exit_code());
    assert_eq!(fx.launcher.launches.get(), 1);
    assert!(fx.repair.runs.borrow().is_empty());
    assert!(fx.failure_reason().contains("0xC1900208"));
    assert_eq!(fx.store.committed_phases(), vec![Phase::UpgradeFailed]);
    assert!(!fx.validation_registered());
    assert_eq!(fx.notifier.kinds(), vec![Notice::UpgradeFailed]);
}

fn seed_validation_triggers(fx: &Fixture) {
    fx.scheduler
        .register_startup(&fx.config.validation_task_name, ENTRY)
        .expect("seed startup task");
    fx.scheduler
        .set_run_once(&fx.config.run_once_value_name, ENTRY)
        .expect("seed run once");
}

#[test]
fn escalation_during_self_repair_removes_the_boot_trigger() {
    let mut fx = Fixture::new("escalated-repair");
    fx.launcher = FakeLauncher::exiting_with(&[0xC190_0208]);
    fx.pending_reboot(boot() - chrono::Duration::hours(3));
    seed_validation_triggers(&fx);

    let outcome = fx.run();

    assert_eq!(failure_of(&outcome).kind, FailureKind::Escalated);
    assert_eq!(fx.launcher.launches.get(), 1);
    assert!(fx
        .scheduler
        .kind_of(&fx.config.validation_task_name)
        .is_none());
    assert!(!fx.scheduler.has_run_once(&fx.config.run_once_value_name));
}

#[test]
fn gate_block_removes_the_boot_trigger() {
    let mut fx = Fixture::new("blocked-trigger");
    fx.probe.agent = AgentProbe::Installed {
        version: Some("20.0.0.0".to_string()),
    };
    fx.pending_reboot(boot());
    seed_validation_triggers(&fx);

    let outcome = fx.run();

    assert!(matches!(outcome, RunOutcome::Blocked(_)));
    assert!(fx
        .scheduler
        .kind_of(&fx.config.validation_task_name)
        .is_none());
    assert!(!fx.scheduler.has_run_once(&fx.config.run_once_value_name));
}

#[test]
fn unreachable_image_leaves_a_boot_retry_path() {
    let mut fx = Fixture::new("offline");
    fx.primary.payload = None;

    let outcome = fx.run();

    assert_eq!(failure_of(&outcome).kind, FailureKind::DownloadTransport);
    assert_eq!(fx.launcher.launches.get(), 0);
    assert!(fx.validation_registered());
    assert!(fx.failure_reason().contains("transport_unavailable"));
}

#[test]
fn corrupt_state_becomes_a_failure_marker() {
    let fx = Fixture::new("corrupt");
    let layout = fx.store.layout();
    fs::create_dir_all(layout.state_dir()).expect("state dir");
    fs::write(layout.marker_path(Phase::PendingReboot), b"phase=???\n").expect("corrupt marker");

    let outcome = fx.run();

    assert_eq!(failure_of(&outcome).kind, FailureKind::StateCorrupt);
    assert_eq!(
        outcome.exit_code(),
        FailureKind::StateCorrupt.default_code().as_exit_code()
    );
    assert_eq!(fx.store.committed_phases(), vec![Phase::UpgradeFailed]);
    assert!(fx.failure_reason().contains("state_corrupt"));
    assert!(fx.validation_registered());

    // The next run starts a clean triage.
    assert!(matches!(fx.run(), RunOutcome::Staged { .. }));
}

#[test]
fn panic_is_caught_and_recorded() {
    let mut fx = Fixture::new("panic");
    fx.probe.panic_on_build = true;

    let outcome = fx.run();

    let failure = failure_of(&outcome);
    assert_eq!(failure.kind, FailureKind::Unexpected);
    assert!(failure.detail.contains("build probe exploded"), "{}", failure.detail);
    assert_eq!(
        outcome.exit_code(),
        FailureKind::Unexpected.default_code().as_exit_code()
    );
    assert!(fx.failure_reason().contains("unexpected"));
    assert_eq!(fx.cleanup.failure_cleanups.get(), 1);
    assert!(fx.validation_registered());
}

#[test]
fn config_path_resolution_order() {
    let dir = test_dir("config-order");
    let default_path = dir.join("config.json");
    let explicit = PathBuf::from("explicit.json");
    let from_env = PathBuf::from("env.json");

    assert_eq!(
        resolve_config_path(Some(explicit.clone()), Some(from_env.clone()), default_path.clone()),
        Some(explicit)
    );
    assert_eq!(
        resolve_config_path(None, Some(from_env.clone()), default_path.clone()),
        Some(from_env)
    );
    assert_eq!(
        resolve_config_path(None, Some(PathBuf::new()), default_path.clone()),
        None
    );

    fs::write(&default_path, b"{}").expect("default config");
    assert_eq!(
        resolve_config_path(None, None, default_path.clone()),
        Some(default_path)
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn process_listing_detects_other_instances() {
    let tasklist = "\"uplift.exe\",\"1200\",\"Services\",\"0\",\"10,240 K\"\r\n\
\"uplift.exe\",\"3400\",\"Services\",\"0\",\"9,876 K\"\r\n";
    assert!(listing_has_peer(tasklist, 1200));
    assert!(!listing_has_peer(
        "\"uplift.exe\",\"1200\",\"Services\",\"0\",\"10,240 K\"\r\n",
        1200
    ));
    assert!(!listing_has_peer(
        "INFO: No tasks are running which match the specified criteria.\r\n",
        1200
    ));
    assert!(listing_has_peer("812\n913\n", 812));
    assert!(!listing_has_peer("812\n", 812));
}

#[test]
fn startup_failure_records_marker_and_registers_boot_retry() {
    let dir = test_dir("startup-failure");
    let config = UpgradeConfig {
        work_dir: dir.clone(),
        ..UpgradeConfig::default()
    };
    let scheduler = FakeScheduler::default();
    let err = anyhow!("failed to parse configuration JSON");

    let code = startup_failure(
        &config,
        &scheduler,
        ENTRY,
        "configuration could not be loaded",
        &err,
    );

    assert_eq!(code, FailureKind::Unexpected.default_code().as_exit_code());
    let failure = StateStore::open(config.state_dir())
        .read_failure()
        .expect("failure marker must parse")
        .expect("failure marker must exist");
    assert!(failure.reason.contains("configuration could not be loaded"));
    assert_eq!(
        scheduler.kind_of(&config.validation_task_name),
        Some(format!("startup:{ENTRY}"))
    );
    assert!(scheduler.has_run_once(&config.run_once_value_name));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn entry_command_quotes_the_config_path() {
    let command = entry_command(Some(Path::new(r"C:\ProgramData\Uplift\config.json")));
    assert!(command.starts_with('"'));
    assert!(command.ends_with(r#" --config "C:\ProgramData\Uplift\config.json""#));
    assert!(!entry_command(None).contains("--config"));
}

#[test]
fn verbose_raises_the_default_filter() {
    assert_eq!(logging::default_directive(false), "warn,uplift=info");
    assert_eq!(logging::default_directive(true), "warn,uplift=debug");
    assert_eq!(
        logging::log_file_path(Path::new("logs")),
        Path::new("logs").join("uplift.log")
    );
}
