//! End-to-end cycles through the CLI commands with an in-memory
//! filesystem, a recording firewall and a hand-driven clock.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use warden_cli::commands::session::{OnLogError, Session};
use warden_cli::io::StatusLine;
use warden_cli::{
    execute_once, execute_run, CycleConfig, MockLogger, NeverShutdown, NullLogger, ShutdownCheck,
    Sleeper,
};
use warden_clock::{Clock, ManualClock};
use warden_engine::{
    AuditEntry, BlockDuration, BlockState, FirewallCall, MockFirewall, ReasonCode, StateFile,
    Thresholds,
};
use warden_fs::{DeadlineFilesystem, Filesystem, FsError, MockFilesystem, RealFilesystem};

const LOG: &str = "/var/log/pve-firewall.log";
const STATE: &str = "/var/lib/warden/state.json";
const AUDIT: &str = "/var/lib/warden/audit.jsonl";
const STATUS: &str = "/run/warden/status.jsonl";
const EXCLUDE: &str = "/etc/warden/exclude";

/// 22/Feb/2025:18:43:26 UTC
const T0: u64 = 1_740_249_806;

const ATTACKER: &str = "45.142.193.117";

fn config() -> CycleConfig {
    CycleConfig {
        log_file: PathBuf::from(LOG),
        state_file: PathBuf::from(STATE),
        audit_file: PathBuf::from(AUDIT),
        status_file: Some(PathBuf::from(STATUS)),
        exclusion_file: Some(PathBuf::from(EXCLUDE)),
        count_accepts: false,
        thresholds: Thresholds::new(5, 300, 3600, 1),
    }
}

fn line(action: &str, src: &str, ts: u64) -> String {
    let stamp = Utc
        .timestamp_opt(ts as i64, 0)
        .unwrap()
        .format("%d/%b/%Y:%H:%M:%S +0000");
    format!(
        "100 6 tap100i0-IN {stamp} policy {action}: IN=fwbr100i0 OUT=fwbr100i0 \
         PHYSIN=fwln100i0 PHYSOUT=tap100i0 SRC={src} DST=75.37.49.10 PROTO=TCP\n"
    )
}

fn burst(src: &str, start: u64, n: u64) -> String {
    (0..n).map(|i| line("DROP", src, start + i)).collect()
}

fn setup() -> MockFilesystem {
    let fs = MockFilesystem::new();
    fs.add_file(
        PathBuf::from(EXCLUDE),
        b"# management network\n10.0.0.0/24\n".to_vec(),
    );
    fs.add_file(PathBuf::from(LOG), Vec::new());
    fs
}

fn append_log(fs: &MockFilesystem, text: &str) {
    fs.append_file(Path::new(LOG), text.as_bytes());
}

fn audit_lines(fs: &MockFilesystem) -> Vec<AuditEntry> {
    fs.get_text(Path::new(AUDIT))
        .unwrap_or_default()
        .lines()
        .map(|l| AuditEntry::from_json(l).unwrap())
        .collect()
}

fn saved_state(fs: &MockFilesystem) -> StateFile {
    StateFile::from_json(&fs.get_text(Path::new(STATE)).unwrap()).unwrap()
}

fn ip(s: &str) -> std::net::IpAddr {
    s.parse().unwrap()
}

/// Sleeping moves the shared clock forward.
struct ClockSleeper<'a>(&'a ManualClock);

impl Sleeper for ClockSleeper<'_> {
    fn sleep_sec(&self, seconds: u64) {
        self.0.advance(seconds);
    }
}

/// Lets the first `n` checks through, then asks to stop.
struct StopAfterChecks(std::sync::atomic::AtomicU64);

impl ShutdownCheck for StopAfterChecks {
    fn should_stop(&self) -> bool {
        self.0
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_err()
    }
}

/// Writes and appends take `delay_ms` before reaching the mock.
#[derive(Clone, Default)]
struct SlowWrites {
    mock: MockFilesystem,
    delay_ms: Arc<AtomicU64>,
}

impl SlowWrites {
    fn pause(&self) {
        std::thread::sleep(Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
    }
}

impl Filesystem for SlowWrites {
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        self.pause();
        self.mock.write_atomic(path, data)
    }

    fn append_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        self.pause();
        self.mock.append_atomic(path, data)
    }

    fn read_file(&self, path: &Path) -> Result<String, FsError> {
        self.mock.read_file(path)
    }

    fn open_from(&self, path: &Path, offset: u64) -> Result<Box<dyn BufRead + Send>, FsError> {
        self.mock.open_from(path, offset)
    }

    fn file_len(&self, path: &Path) -> Result<u64, FsError> {
        self.mock.file_len(path)
    }

    fn file_id(&self, path: &Path) -> Result<u64, FsError> {
        self.mock.file_id(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.mock.exists(path)
    }
}

// ===========================================
// Full lifecycle across process restarts
// ===========================================

#[test]
fn test_block_expire_then_permanent() {
    let fs = setup();
    let fw = MockFirewall::new();
    let clock = ManualClock::new(T0 + 10);

    // Cycle 1: a burst of five drops, plus an excluded and a malformed source.
    append_log(&fs, &burst(ATTACKER, T0, 5));
    append_log(&fs, &line("DROP", "10.0.0.5", T0));
    append_log(&fs, &line("DROP", "bogus", T0));

    let first = execute_once(&config(), &fs, &fw, &clock, &NeverShutdown, &NullLogger)
        .expect("cycle 1");
    assert_eq!(first.report.events, 5);
    assert_eq!(first.report.excluded, 1);
    assert_eq!(first.report.skipped.len(), 1);
    assert_eq!(first.tracked, 1);
    assert_eq!(
        fw.calls(),
        vec![FirewallCall::Block {
            ip: ip(ATTACKER),
            duration: BlockDuration::Temporary { secs: 3600 },
        }]
    );

    let record = &saved_state(&fs).records[ATTACKER];
    assert_eq!(record.state, BlockState::TemporarilyBlocked);
    // Anchored at confirmation: the clock is ahead of the last event.
    assert_eq!(record.block_expires_at, Some(T0 + 10 + 3600));

    // Cycle 2: the block runs out with no new lines.
    fw.clear_calls();
    clock.set(T0 + 10 + 3600);
    execute_once(&config(), &fs, &fw, &clock, &NeverShutdown, &NullLogger).expect("cycle 2");
    assert_eq!(fw.calls(), vec![FirewallCall::Unblock { ip: ip(ATTACKER) }]);
    assert_eq!(saved_state(&fs).records[ATTACKER].state, BlockState::Watched);

    // Cycle 3: a second burst after one served block is permanent.
    fw.clear_calls();
    append_log(&fs, &burst(ATTACKER, T0 + 3700, 5));
    clock.set(T0 + 3710);
    execute_once(&config(), &fs, &fw, &clock, &NeverShutdown, &NullLogger).expect("cycle 3");
    assert_eq!(
        fw.calls(),
        vec![FirewallCall::Block {
            ip: ip(ATTACKER),
            duration: BlockDuration::Permanent,
        }]
    );

    let record = &saved_state(&fs).records[ATTACKER];
    assert_eq!(record.state, BlockState::PermanentlyBlocked);
    assert_eq!(record.block_expires_at, None);

    let reasons: Vec<ReasonCode> = audit_lines(&fs).iter().map(|e| e.reason).collect();
    assert_eq!(
        reasons,
        vec![
            ReasonCode::AttemptObserved,
            ReasonCode::AttemptLimitReached,
            ReasonCode::BlockExpired,
            ReasonCode::RepeatOffender,
        ]
    );

    let heartbeats: Vec<StatusLine> = fs
        .get_text(Path::new(STATUS))
        .unwrap()
        .lines()
        .map(|l| StatusLine::from_json(l).unwrap())
        .collect();
    assert_eq!(heartbeats.len(), 3);
    assert!(heartbeats.iter().all(|h| h.cycle == 1 && !h.degraded));
    assert_eq!(heartbeats[0].transitions, 2);
}

#[test]
fn test_accepts_only_count_when_enabled() {
    let fs = setup();
    let fw = MockFirewall::new();
    let clock = ManualClock::new(T0 + 10);
    let accepts: String = (0..5).map(|i| line("ACCEPT", ATTACKER, T0 + i)).collect();
    append_log(&fs, &accepts);

    let ignored = execute_once(&config(), &fs, &fw, &clock, &NeverShutdown, &NullLogger)
        .expect("drops only");
    assert_eq!(ignored.report.events, 0);
    assert!(fw.calls().is_empty());

    // Same lines again, from a fresh state, with accepts counted.
    let mut counting = config();
    counting.count_accepts = true;
    counting.state_file = PathBuf::from("/var/lib/warden/state-accepts.json");
    let counted = execute_once(&counting, &fs, &fw, &clock, &NeverShutdown, &NullLogger)
        .expect("with accepts");
    assert_eq!(counted.report.events, 5);
    assert_eq!(fw.active_blocks(), vec![ip(ATTACKER)]);
}

#[test]
fn test_rotated_log_is_read_from_start() {
    let fs = setup();
    let fw = MockFirewall::new();
    let clock = ManualClock::new(T0 + 10);

    append_log(&fs, &burst(ATTACKER, T0, 3));
    execute_once(&config(), &fs, &fw, &clock, &NeverShutdown, &NullLogger).expect("before");

    // Rotation: a new, shorter file under the same name.
    fs.add_file(PathBuf::from(LOG), burst(ATTACKER, T0 + 20, 2).into_bytes());
    fs.set_file_id(Path::new(LOG), 2);
    clock.set(T0 + 30);
    let after =
        execute_once(&config(), &fs, &fw, &clock, &NeverShutdown, &NullLogger).expect("after");

    assert_eq!(after.report.events, 2);
    assert_eq!(after.report.replayed, 0);
    assert_eq!(fw.active_blocks(), vec![ip(ATTACKER)]);
    assert_eq!(saved_state(&fs).cursor.unwrap().file_id, 2);
}

// ===========================================
// Degraded cycles
// ===========================================

#[test]
fn test_firewall_outage_retried_by_run_loop() {
    let fs = setup();
    let fw = MockFirewall::new();
    fw.fail_next(1);
    let clock = ManualClock::new(T0 + 10);
    let logger = MockLogger::new();
    append_log(&fs, &burst(ATTACKER, T0, 5));

    // Two cycles of a 60 second interval: 61 checks each.
    let result = execute_run(
        &config(),
        60,
        &fs,
        &fw,
        &clock,
        &ClockSleeper(&clock),
        &StopAfterChecks(std::sync::atomic::AtomicU64::new(122)),
        &logger,
    )
    .expect("run");

    assert_eq!(result.cycles, 2);
    assert_eq!(result.degraded_cycles, 1);
    assert_eq!(result.pending, 0);
    assert!(logger.contains("queued for retry"));

    // The retry went through in cycle 2, a minute later.
    assert_eq!(fw.active_blocks(), vec![ip(ATTACKER)]);
    let record = &saved_state(&fs).records[ATTACKER];
    assert_eq!(record.state, BlockState::TemporarilyBlocked);
    assert_eq!(record.block_expires_at, Some(T0 + 70 + 3600));
    assert_eq!(clock.now_unix_sec(), T0 + 130);

    let heartbeats: Vec<StatusLine> = fs
        .get_text(Path::new(STATUS))
        .unwrap()
        .lines()
        .map(|l| StatusLine::from_json(l).unwrap())
        .collect();
    assert_eq!(
        heartbeats.iter().map(|h| h.degraded).collect::<Vec<_>>(),
        vec![true, false]
    );
    assert_eq!(heartbeats[0].pending, 1);
}

#[test]
fn test_storage_outage_keeps_changes_until_next_cycle() {
    let fs = setup();
    let fw = MockFirewall::new();
    let clock = ManualClock::new(T0 + 10);
    let logger = MockLogger::new();
    let mut session = Session::open(&config(), &fs, &logger).expect("open");
    append_log(&fs, &burst(ATTACKER, T0, 5));

    fs.set_fail_writes(true);
    let failed = session
        .cycle(&fw, &clock, None, OnLogError::Fail, &logger)
        .expect("cycle");
    assert!(failed.degraded());
    assert_eq!(failed.unsaved_audit, 2);
    assert!(fs.get_file(Path::new(STATE)).is_none());
    assert!(logger.contains("keeping changes in memory"));

    fs.set_fail_writes(false);
    clock.advance(60);
    let recovered = session
        .cycle(&fw, &clock, None, OnLogError::Fail, &logger)
        .expect("cycle");
    assert!(!recovered.degraded());
    assert_eq!(recovered.events, 0);
    assert_eq!(audit_lines(&fs).len(), 2);
    assert_eq!(
        saved_state(&fs).records[ATTACKER].state,
        BlockState::TemporarilyBlocked
    );
}

// ===========================================
// Slow storage
// ===========================================

#[test]
fn test_writes_landing_after_deadline_neither_duplicate_nor_roll_back() {
    let slow = SlowWrites {
        mock: setup(),
        delay_ms: Arc::new(AtomicU64::new(1000)),
    };
    let fs = DeadlineFilesystem::new(slow.clone(), Duration::from_millis(50));
    let fw = MockFirewall::new();
    let clock = ManualClock::new(T0 + 10);
    let logger = MockLogger::new();
    let mut session = Session::open(&config(), &fs, &logger).expect("open");
    let mut transitions = 0;

    // Both writes miss their deadline but keep running.
    append_log(&slow.mock, &burst(ATTACKER, T0, 5));
    let first = session
        .cycle(&fw, &clock, None, OnLogError::Fail, &logger)
        .expect("cycle");
    assert_eq!(first.persistence_errors.len(), 2);
    transitions += first.audit.len();

    // Storage is fast again, but the stale writes have not landed yet.
    slow.delay_ms.store(0, Ordering::SeqCst);
    append_log(&slow.mock, &burst("198.51.100.7", T0 + 20, 3));
    clock.advance(20);
    let second = session
        .cycle(&fw, &clock, None, OnLogError::Fail, &logger)
        .expect("cycle");
    assert!(second.degraded());
    transitions += second.audit.len();

    std::thread::sleep(Duration::from_millis(1500));
    clock.advance(10);
    let third = session
        .cycle(&fw, &clock, None, OnLogError::Fail, &logger)
        .expect("cycle");
    assert!(!third.degraded());
    assert_eq!(third.unsaved_audit, 0);
    transitions += third.audit.len();

    assert_eq!(audit_lines(&slow.mock).len(), transitions);
    let saved = saved_state(&slow.mock);
    assert_eq!(saved.cursor, session.engine().cursor());
    assert_eq!(saved.records["198.51.100.7"].attempt_count, 3);
    assert_eq!(
        saved.records[ATTACKER].state,
        BlockState::TemporarilyBlocked
    );
}

// ===========================================
// On disk
// ===========================================

#[test]
fn test_once_against_real_files() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("pve-firewall.log");
    std::fs::write(&log, burst(ATTACKER, T0, 5)).unwrap();

    let config = CycleConfig {
        log_file: log.clone(),
        state_file: dir.path().join("state/warden_state.json"),
        audit_file: dir.path().join("warden_audit.jsonl"),
        status_file: None,
        exclusion_file: None,
        count_accepts: false,
        thresholds: Thresholds::new(5, 300, 3600, 1),
    };
    let fs = DeadlineFilesystem::new(RealFilesystem, std::time::Duration::from_secs(5));
    let fw = MockFirewall::new();
    let clock = ManualClock::new(T0 + 10);

    let first = execute_once(&config, &fs, &fw, &clock, &NeverShutdown, &NullLogger).unwrap();
    assert_eq!(first.report.events, 5);

    // A second pass over the same file sees nothing new.
    let second = execute_once(&config, &fs, &fw, &clock, &NeverShutdown, &NullLogger).unwrap();
    assert_eq!(second.report.events, 0);
    assert_eq!(fw.calls().len(), 1);

    let state = std::fs::read_to_string(&config.state_file).unwrap();
    let state = StateFile::from_json(&state).unwrap();
    assert_eq!(
        state.records[ATTACKER].state,
        BlockState::TemporarilyBlocked
    );
    assert_eq!(
        state.cursor.unwrap().offset,
        std::fs::metadata(&log).unwrap().len()
    );

    let audit = std::fs::read_to_string(&config.audit_file).unwrap();
    assert_eq!(audit.lines().count(), 2);
    let leftovers = std::fs::read_dir(dir.path().join("state")).unwrap().count();
    assert_eq!(leftovers, 1);
}
