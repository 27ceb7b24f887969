//! Append-only audit trail, one JSON line per state change.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use warden_fs::{Filesystem, FsError};
use warden_schema::AuditEntry;

/// Errors from audit writing.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to append audit entries: {0}")]
    Append(#[source] FsError),

    #[error("failed to check audit file before writing: {0}")]
    Inspect(#[source] FsError),
}

/// An append that reported failure but may still have reached the file,
/// e.g. a write that finished after its deadline.
#[derive(Debug, Clone, Copy)]
struct UnconfirmedAppend {
    start_len: u64,
    bytes: u64,
    entries: usize,
}

/// Writer for the audit JSONL file.
pub struct AuditLog<F: Filesystem> {
    fs: F,
    path: PathBuf,
    unconfirmed: Mutex<Option<UnconfirmedAppend>>,
}

impl<F: Filesystem> AuditLog<F> {
    pub fn new(fs: F, path: PathBuf) -> Self {
        Self {
            fs,
            path,
            unconfirmed: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `pending` in one write and clear it. Existing lines are never
    /// touched.
    ///
    /// On failure `pending` is left as is; the next call must pass the same
    /// entries first, with any new ones after them. If the failed write
    /// reached the file after all, its entries are dropped from `pending`
    /// rather than written a second time.
    pub fn flush(&self, pending: &mut Vec<AuditEntry>) -> Result<(), AuditError> {
        let mut unconfirmed = self.unconfirmed.lock();
        if pending.is_empty() && unconfirmed.is_none() {
            return Ok(());
        }

        let len = self.current_len()?;
        let mut torn = false;
        if let Some(earlier) = unconfirmed.take() {
            let end = earlier.start_len + earlier.bytes;
            if len >= end {
                pending.drain(..earlier.entries.min(pending.len()));
            } else {
                torn = len > earlier.start_len;
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        if torn {
            // Keep the half-written line apart from the rewritten ones.
            buf.push('\n');
        }
        for entry in pending.iter() {
            buf.push_str(&entry.to_json());
            buf.push('\n');
        }

        match self.fs.append_atomic(&self.path, buf.as_bytes()) {
            Ok(()) => {
                pending.clear();
                Ok(())
            }
            Err(e) => {
                *unconfirmed = Some(UnconfirmedAppend {
                    start_len: len,
                    bytes: buf.len() as u64,
                    entries: pending.len(),
                });
                Err(AuditError::Append(e))
            }
        }
    }

    fn current_len(&self) -> Result<u64, AuditError> {
        match self.fs.file_len(&self.path) {
            Ok(len) => Ok(len),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(AuditError::Inspect(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use warden_fs::MockFilesystem;
    use warden_schema::{BlockState, ReasonCode};

    const AUDIT: &str = "/audit.jsonl";

    fn entry(ip: &str, reason: ReasonCode) -> AuditEntry {
        AuditEntry {
            ts_unix_sec: 1740249806,
            ip: ip.parse().unwrap(),
            previous_state: BlockState::Clean,
            new_state: BlockState::Watched,
            attempt_count: 1,
            reason,
            block_expires_at: None,
        }
    }

    fn ips(fs: &MockFilesystem) -> Vec<String> {
        fs.get_text(Path::new(AUDIT))
            .unwrap_or_default()
            .lines()
            .filter_map(|l| AuditEntry::from_json(l).ok())
            .map(|e| e.ip.to_string())
            .collect()
    }

    /// Appends that report a timeout while `fail` is set, after letting
    /// `land` bytes reach the file.
    #[derive(Clone, Default)]
    struct LateAppend {
        mock: MockFilesystem,
        fail: Arc<AtomicBool>,
        land: Arc<AtomicUsize>,
    }

    impl LateAppend {
        fn fail_landing(&self, bytes: usize) {
            self.land.store(bytes, Ordering::SeqCst);
            self.fail.store(true, Ordering::SeqCst);
        }

        fn recover(&self) {
            self.fail.store(false, Ordering::SeqCst);
        }
    }

    impl Filesystem for LateAppend {
        fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
            self.mock.write_atomic(path, data)
        }

        fn append_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
            if !self.fail.load(Ordering::SeqCst) {
                return self.mock.append_atomic(path, data);
            }
            let landed = self.land.load(Ordering::SeqCst).min(data.len());
            if landed > 0 {
                self.mock.append_file(path, &data[..landed]);
            }
            Err(FsError::Timeout {
                op: "append_atomic",
                after: Duration::from_millis(50),
            })
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
    // Appending
    // ===========================================

    #[test]
    fn test_flush_writes_lines_and_clears() {
        let fs = MockFilesystem::new();
        let log = AuditLog::new(fs.clone(), PathBuf::from(AUDIT));
        let mut pending = vec![
            entry("10.0.0.1", ReasonCode::AttemptObserved),
            entry("10.0.0.2", ReasonCode::WindowLapsed),
        ];

        log.flush(&mut pending).unwrap();

        assert!(pending.is_empty());
        let text = fs.get_text(Path::new(AUDIT)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            AuditEntry::from_json(lines[1]).unwrap().reason,
            ReasonCode::WindowLapsed
        );
    }

    #[test]
    fn test_flush_never_rewrites() {
        let fs = MockFilesystem::new();
        fs.add_file(PathBuf::from(AUDIT), b"{\"prior\":true}\n".to_vec());
        let log = AuditLog::new(fs.clone(), PathBuf::from(AUDIT));

        log.flush(&mut vec![entry("10.0.0.1", ReasonCode::AttemptObserved)])
            .unwrap();

        let text = fs.get_text(Path::new(AUDIT)).unwrap();
        assert!(text.starts_with("{\"prior\":true}\n"));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let fs = MockFilesystem::new();
        let log = AuditLog::new(fs.clone(), PathBuf::from(AUDIT));
        log.flush(&mut Vec::new()).unwrap();
        assert!(!fs.exists(Path::new(AUDIT)));
    }

    // ===========================================
    // Retries
    // ===========================================

    #[test]
    fn test_failed_flush_keeps_entries_and_retries_in_full() {
        let fs = MockFilesystem::new();
        fs.set_fail_writes(true);
        let log = AuditLog::new(fs.clone(), PathBuf::from(AUDIT));
        let mut pending = vec![
            entry("10.0.0.1", ReasonCode::AttemptObserved),
            entry("10.0.0.2", ReasonCode::AttemptObserved),
        ];

        assert!(matches!(log.flush(&mut pending), Err(AuditError::Append(_))));
        assert_eq!(pending.len(), 2);

        fs.set_fail_writes(false);
        log.flush(&mut pending).unwrap();
        assert_eq!(ips(&fs), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_append_that_landed_late_is_not_written_twice() {
        let fs = LateAppend::default();
        let log = AuditLog::new(fs.clone(), PathBuf::from(AUDIT));
        let mut pending = vec![
            entry("10.0.0.1", ReasonCode::AttemptObserved),
            entry("10.0.0.2", ReasonCode::AttemptObserved),
        ];

        fs.fail_landing(usize::MAX);
        assert!(log.flush(&mut pending).is_err());
        assert_eq!(pending.len(), 2);

        // A later cycle adds one more change before the retry.
        fs.recover();
        pending.push(entry("10.0.0.3", ReasonCode::AttemptObserved));
        log.flush(&mut pending).unwrap();

        assert!(pending.is_empty());
        assert_eq!(ips(&fs.mock), vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_torn_append_is_rewritten_on_a_fresh_line() {
        let fs = LateAppend::default();
        let log = AuditLog::new(fs.clone(), PathBuf::from(AUDIT));
        let mut pending = vec![entry("10.0.0.1", ReasonCode::AttemptObserved)];

        fs.fail_landing(10);
        assert!(log.flush(&mut pending).is_err());

        fs.recover();
        log.flush(&mut pending).unwrap();

        let text = fs.mock.get_text(Path::new(AUDIT)).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert_eq!(ips(&fs.mock), vec!["10.0.0.1"]);
    }
}
