//! Durable state file.
//!
//! The whole state (records, log cursor, pending firewall work) is replaced
//! in one atomic write per cycle. A reader sees the previous snapshot or the
//! new one, never a mix.

use std::path::{Path, PathBuf};

use thiserror::Error;
use warden_fs::{Filesystem, FsError};
use warden_schema::{SchemaError, StateFile};

/// Errors loading or saving the state file.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file: {0}")]
    Read(#[source] FsError),

    #[error("state file is corrupt: {0}")]
    Corrupt(#[source] SchemaError),

    #[error("failed to write state file: {0}")]
    Write(#[source] FsError),
}

/// Loads and saves the state file.
pub struct StateStore<F: Filesystem> {
    fs: F,
    path: PathBuf,
}

impl<F: Filesystem> StateStore<F> {
    pub fn new(fs: F, path: PathBuf) -> Self {
        Self { fs, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state file. A missing file is a first run, not an error.
    pub fn load(&self) -> Result<Option<StateFile>, StateError> {
        let json = match self.fs.read_file(&self.path) {
            Ok(json) => json,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(StateError::Read(e)),
        };

        let state = StateFile::from_json(&json).map_err(StateError::Corrupt)?;
        state.offense_records().map_err(StateError::Corrupt)?;
        Ok(Some(state))
    }

    /// Atomically replace the state file.
    pub fn save(&self, state: &StateFile) -> Result<(), StateError> {
        let json = state.to_json();
        self.fs
            .write_atomic(&self.path, json.as_bytes())
            .map_err(StateError::Write)
    }
}
