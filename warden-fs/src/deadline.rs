//! Bounded-time filesystem wrapper.
//!
//! A hung disk or NFS mount must not stall a processing cycle forever.
//! `DeadlineFilesystem` runs each blocking write/read on a worker thread and
//! gives up after the configured timeout with `FsError::Timeout`. The caller
//! treats the operation as failed and retries next cycle.
//!
//! A worker that missed its deadline may still complete later. Until it
//! does, it stays registered against its path, and the next operation on
//! that path waits for it (again bounded by the timeout) before starting.
//! Operations on one path therefore never overlap or land out of order.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::filesystem::{Filesystem, FsError};

/// Wraps a filesystem so every write and read returns within `timeout`.
#[derive(Debug, Clone)]
pub struct DeadlineFilesystem<F> {
    inner: F,
    timeout: Duration,
    /// Workers past their deadline; the receiver disconnects when one exits.
    stragglers: Arc<Mutex<HashMap<PathBuf, mpsc::Receiver<()>>>>,
}

impl<F> DeadlineFilesystem<F>
where
    F: Filesystem + Clone + 'static,
{
    pub fn new(inner: F, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            stragglers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for an earlier worker on `path` that missed its deadline.
    fn wait_for_straggler(&self, op: &'static str, path: &Path) -> Result<(), FsError> {
        let straggler = self.stragglers.lock().remove(path);
        let Some(done) = straggler else {
            return Ok(());
        };

        match done.recv_timeout(self.timeout) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.stragglers.lock().insert(path.to_path_buf(), done);
                Err(FsError::Timeout {
                    op,
                    after: self.timeout,
                })
            }
            _ => Ok(()),
        }
    }

    fn bounded<T, Op>(&self, op: &'static str, path: &Path, f: Op) -> Result<T, FsError>
    where
        T: Send + 'static,
        Op: FnOnce(F) -> Result<T, FsError> + Send + 'static,
    {
        self.wait_for_straggler(op, path)?;

        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let inner = self.inner.clone();
        thread::Builder::new()
            .name(format!("fs-{op}"))
            .spawn(move || {
                let _ = tx.send(f(inner));
                drop(done_tx);
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.stragglers.lock().insert(path.to_path_buf(), done_rx);
                Err(FsError::Timeout {
                    op,
                    after: self.timeout,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(FsError::Path(format!("{op} worker exited without a result")))
            }
        }
    }
}

impl<F> Filesystem for DeadlineFilesystem<F>
where
    F: Filesystem + Clone + 'static,
{
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        let owned = path.to_path_buf();
        let data = data.to_vec();
        self.bounded("write_atomic", path, move |fs| fs.write_atomic(&owned, &data))
    }

    fn append_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        let owned = path.to_path_buf();
        let data = data.to_vec();
        self.bounded("append_atomic", path, move |fs| fs.append_atomic(&owned, &data))
    }

    fn read_file(&self, path: &Path) -> Result<String, FsError> {
        let owned = path.to_path_buf();
        self.bounded("read_file", path, move |fs| fs.read_file(&owned))
    }

    fn open_from(&self, path: &Path, offset: u64) -> Result<Box<dyn BufRead + Send>, FsError> {
        let owned = path.to_path_buf();
        self.bounded("open_from", path, move |fs| fs.open_from(&owned, offset))
    }

    fn file_len(&self, path: &Path) -> Result<u64, FsError> {
        let owned = path.to_path_buf();
        self.bounded("file_len", path, move |fs| fs.file_len(&owned))
    }

    fn file_id(&self, path: &Path) -> Result<u64, FsError> {
        let owned = path.to_path_buf();
        self.bounded("file_id", path, move |fs| fs.file_id(&owned))
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockFilesystem;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory filesystem whose writes take `delay_ms` to land.
    #[derive(Clone, Default)]
    struct SlowFilesystem {
        mock: MockFilesystem,
        delay_ms: Arc<AtomicU64>,
    }

    impl SlowFilesystem {
        fn set_delay(&self, delay: Duration) {
            self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
        }

        fn pause(&self) {
            thread::sleep(Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
        }
    }

    impl Filesystem for SlowFilesystem {
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

    /// Filesystem whose writes take longer than any sane deadline.
    #[derive(Clone)]
    struct StalledFilesystem {
        stall: Duration,
    }

    impl Filesystem for StalledFilesystem {
        fn write_atomic(&self, _path: &Path, _data: &[u8]) -> Result<(), FsError> {
            thread::sleep(self.stall);
            Ok(())
        }

        fn append_atomic(&self, _path: &Path, _data: &[u8]) -> Result<(), FsError> {
            thread::sleep(self.stall);
            Ok(())
        }

        fn read_file(&self, _path: &Path) -> Result<String, FsError> {
            Ok(String::new())
        }

        fn open_from(&self, _path: &Path, _offset: u64) -> Result<Box<dyn BufRead + Send>, FsError> {
            Ok(Box::new(std::io::Cursor::new(Vec::new())))
        }

        fn file_len(&self, _path: &Path) -> Result<u64, FsError> {
            Ok(0)
        }

        fn file_id(&self, _path: &Path) -> Result<u64, FsError> {
            Ok(0)
        }

        fn exists(&self, _path: &Path) -> bool {
            false
        }
    }

    #[test]
    fn test_deadline_passes_through_fast_ops() {
        let mock = MockFilesystem::new();
        let fs = DeadlineFilesystem::new(mock.clone(), Duration::from_secs(5));
        let path = PathBuf::from("/tmp/state.json");

        fs.write_atomic(&path, b"{}").expect("write");
        fs.append_atomic(&path, b"\n").expect("append");

        assert_eq!(fs.read_file(&path).expect("read"), "{}\n");
        assert_eq!(mock.get_text(&path).as_deref(), Some("{}\n"));
    }

    #[test]
    fn test_deadline_times_out_stalled_write() {
        let fs = DeadlineFilesystem::new(
            StalledFilesystem {
                stall: Duration::from_secs(2),
            },
            Duration::from_millis(50),
        );

        let err = fs
            .write_atomic(Path::new("/tmp/state.json"), b"{}")
            .unwrap_err();
        assert!(matches!(err, FsError::Timeout { op: "write_atomic", .. }));

        let err = fs
            .append_atomic(Path::new("/tmp/audit.jsonl"), b"{}")
            .unwrap_err();
        assert!(matches!(err, FsError::Timeout { op: "append_atomic", .. }));
    }

    #[test]
    fn test_deadline_propagates_inner_errors() {
        let mock = MockFilesystem::new();
        mock.set_fail_writes(true);
        let fs = DeadlineFilesystem::new(mock, Duration::from_secs(5));

        let err = fs.write_atomic(Path::new("/tmp/x"), b"x").unwrap_err();
        assert!(matches!(err, FsError::Io(_)));
    }

    // ===========================================
    // Late workers
    // ===========================================

    #[test]
    fn test_late_write_cannot_overwrite_newer_one() {
        let slow = SlowFilesystem::default();
        let fs = DeadlineFilesystem::new(slow.clone(), Duration::from_millis(200));
        let path = PathBuf::from("/var/lib/warden/state.json");

        // Lands at ~300ms, after its 200ms deadline.
        slow.set_delay(Duration::from_millis(300));
        let err = fs.write_atomic(&path, b"old").unwrap_err();
        assert!(matches!(err, FsError::Timeout { op: "write_atomic", .. }));

        // Waits out the first worker, then writes.
        slow.set_delay(Duration::ZERO);
        fs.write_atomic(&path, b"new").expect("write after straggler");

        thread::sleep(Duration::from_millis(200));
        assert_eq!(slow.mock.get_text(&path).as_deref(), Some("new"));
    }

    #[test]
    fn test_stuck_worker_fails_later_ops_on_same_path() {
        let slow = SlowFilesystem::default();
        let fs = DeadlineFilesystem::new(slow.clone(), Duration::from_millis(50));
        let audit = PathBuf::from("/var/lib/warden/audit.jsonl");

        slow.set_delay(Duration::from_millis(400));
        assert!(fs.append_atomic(&audit, b"a\n").is_err());

        // Still running: a retry must not add a second copy alongside it.
        slow.set_delay(Duration::ZERO);
        let err = fs.append_atomic(&audit, b"a\n").unwrap_err();
        assert!(matches!(err, FsError::Timeout { op: "append_atomic", .. }));
        assert!(matches!(fs.file_len(&audit), Err(FsError::Timeout { .. })));

        // Other paths are unaffected.
        fs.write_atomic(Path::new("/var/lib/warden/state.json"), b"{}")
            .expect("other path");

        thread::sleep(Duration::from_millis(500));
        assert_eq!(fs.file_len(&audit).expect("len"), 2);
        fs.append_atomic(&audit, b"b\n").expect("append");
        assert_eq!(slow.mock.get_text(&audit).as_deref(), Some("a\nb\n"));
    }
}
