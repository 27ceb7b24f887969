//! Status heartbeat.
//!
//! One JSON line per cycle, appended to the status file so monitoring can
//! tell a live daemon from a stuck one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_engine::CycleReport;
use warden_fs::{Filesystem, FsError};

/// Errors from status writing.
#[derive(Debug, Error)]
pub enum StatusWriterError {
    #[error("failed to append status: {0}")]
    Append(#[source] FsError),
}

/// A single heartbeat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLine {
    /// Unix seconds at the start of the cycle.
    pub timestamp: u64,
    pub cycle: u64,
    /// Events applied to the ledger.
    pub events: u64,
    /// Events dropped for a malformed source address.
    pub skipped: u64,
    /// Events dropped because the source is excluded.
    pub excluded: u64,
    /// State changes written to the audit log.
    pub transitions: u64,
    /// Firewall actions still queued for retry.
    pub pending: u64,
    pub degraded: bool,
}

impl StatusLine {
    pub fn from_report(report: &CycleReport) -> Self {
        Self {
            timestamp: report.clock_now,
            cycle: report.cycle,
            events: report.events as u64,
            skipped: report.skipped.len() as u64,
            excluded: report.excluded as u64,
            transitions: report.audit.len() as u64,
            pending: report.pending as u64,
            degraded: report.degraded(),
        }
    }

    /// Serialize to JSON line (no trailing newline).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("StatusLine serialization should never fail")
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Writer for the append-only status file.
pub struct StatusWriter<F: Filesystem> {
    fs: F,
    path: PathBuf,
}

impl<F: Filesystem> StatusWriter<F> {
    pub fn new(fs: F, path: PathBuf) -> Self {
        Self { fs, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line; the file is created on first use.
    pub fn append(&self, status: &StatusLine) -> Result<(), StatusWriterError> {
        let line = format!("{}\n", status.to_json());
        self.fs
            .append_atomic(&self.path, line.as_bytes())
            .map_err(StatusWriterError::Append)
    }
}
