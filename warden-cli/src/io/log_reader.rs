//! Proxmox firewall log reader.
//!
//! Line format:
//!
//! ```text
//! 100 6 tap100i0-IN 22/Feb/2025:12:43:32 -0600 policy DROP: IN=fwbr100i0 ... SRC=45.142.193.117 DST=...
//! ```
//!
//! Reading resumes from the saved cursor. A different file identity means
//! the log was rotated and a file shorter than the cursor means it was
//! truncated; both restart at offset 0. A trailing line without a newline
//! is still being written and is left for the next read.
//!
//! One read consumes at most the batch limit in bytes; whatever follows is
//! picked up from the returned cursor on the next read.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use thiserror::Error;
use warden_engine::{AccessEvent, EventBatch, LogCursor};
use warden_fs::{Filesystem, FsError};

const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Bytes consumed by one read unless overridden with `with_batch_limit`.
pub const DEFAULT_BATCH_BYTES: u64 = 16 * 1024 * 1024;

/// Errors reading the firewall log.
#[derive(Debug, Error)]
pub enum LogReadError {
    #[error("cannot open firewall log {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("error reading firewall log {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Firewall verdict on a logged packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    Drop,
    Accept,
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub vmid: u32,
    pub action: LogAction,
    pub ts_unix_sec: u64,
    /// Raw `SRC=` value; validated by the engine.
    pub src: String,
}

/// Parse one log line. Anything that is not a policy DROP/ACCEPT line with
/// a valid timestamp and a `SRC=` field yields `None`.
pub fn parse_line(line: &str) -> Option<LogLine> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 || parts[5] != "policy" {
        return None;
    }

    if !parts[0].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let vmid = parts[0].parse().ok()?;

    let action = match parts[6] {
        "DROP:" => LogAction::Drop,
        "ACCEPT:" => LogAction::Accept,
        _ => return None,
    };

    let stamp = format!("{} {}", parts[3], parts[4]);
    let ts = DateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT).ok()?;
    let ts_unix_sec = u64::try_from(ts.timestamp()).ok()?;

    let src = parts[7..].iter().find_map(|part| part.strip_prefix("SRC="))?;

    Some(LogLine {
        vmid,
        action,
        ts_unix_sec,
        src: src.to_string(),
    })
}

/// What one read produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRead {
    pub batch: EventBatch,
    /// Complete lines consumed.
    pub lines: usize,
    /// Lines that did not parse.
    pub unparsed: usize,
    /// ACCEPT lines ignored because accepts are not counted.
    pub uncounted: usize,
    /// The batch limit was reached with more of the file still unread.
    pub backlog: bool,
}

/// Reads new lines from the firewall log.
pub struct LogReader<F: Filesystem> {
    fs: F,
    path: PathBuf,
    count_accepts: bool,
    batch_limit: u64,
}

impl<F: Filesystem> LogReader<F> {
    pub fn new(fs: F, path: PathBuf, count_accepts: bool) -> Self {
        Self {
            fs,
            path,
            count_accepts,
            batch_limit: DEFAULT_BATCH_BYTES,
        }
    }

    /// Stop reading once a batch holds `bytes`. The line that crosses the
    /// limit is still read whole, so every read makes progress.
    pub fn with_batch_limit(mut self, bytes: u64) -> Self {
        self.batch_limit = bytes.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read complete lines after `cursor`, up to the batch limit.
    pub fn read_batch(&self, cursor: Option<LogCursor>) -> Result<LogRead, LogReadError> {
        let open_error = |source| LogReadError::Open {
            path: self.path.clone(),
            source,
        };

        let file_id = self.fs.file_id(&self.path).map_err(open_error)?;
        let len = self.fs.file_len(&self.path).map_err(open_error)?;

        let (start, rewound) = match cursor {
            Some(c) if c.file_id == file_id && c.offset <= len => (c.offset, false),
            Some(c) if c.file_id == file_id => (0, true),
            _ => (0, false),
        };

        let mut reader = self.fs.open_from(&self.path, start).map_err(open_error)?;

        let mut offset = start;
        let mut events = Vec::new();
        let mut lines = 0;
        let mut unparsed = 0;
        let mut uncounted = 0;
        let mut buf = Vec::new();
        let read_error = |source| LogReadError::Read {
            path: self.path.clone(),
            source,
        };
        let mut backlog = false;

        loop {
            if offset - start >= self.batch_limit {
                backlog = !reader.fill_buf().map_err(read_error)?.is_empty();
                break;
            }

            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).map_err(read_error)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }

            offset += n as u64;
            lines += 1;

            match parse_line(&String::from_utf8_lossy(&buf)) {
                None => unparsed += 1,
                Some(line) if line.action == LogAction::Accept && !self.count_accepts => {
                    uncounted += 1
                }
                Some(line) => {
                    events.push(AccessEvent::new(line.src, line.ts_unix_sec).at_offset(offset))
                }
            }
        }

        let mut batch = EventBatch::new(file_id, events, offset);
        if rewound {
            batch = batch.rewound();
        }

        Ok(LogRead {
            batch,
            lines,
            unparsed,
            uncounted,
            backlog,
        })
    }
}
