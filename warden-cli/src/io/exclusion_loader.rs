//! Exclusion file loader.
//!
//! One address or CIDR range per line. `#` starts a comment, blank lines are
//! ignored. A malformed entry does not fail the load: it is returned with
//! its line number so the caller can report it, and the remaining entries
//! still apply.

use std::path::Path;

use thiserror::Error;
use warden_engine::{AddressError, ExclusionSet};
use warden_fs::{Filesystem, FsError};

/// Errors loading the exclusion file.
#[derive(Debug, Error)]
pub enum ExclusionLoadError {
    #[error("failed to read exclusion file {}: {source}", .path.display())]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: FsError,
    },
}

/// An entry that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    /// 1-based line number.
    pub line: usize,
    pub error: AddressError,
}

/// Parsed exclusion file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedExclusions {
    pub set: ExclusionSet,
    pub rejected: Vec<RejectedEntry>,
}

/// Read and parse the exclusion file at `path`.
pub fn load_exclusions<F: Filesystem>(
    fs: &F,
    path: &Path,
) -> Result<LoadedExclusions, ExclusionLoadError> {
    let content = fs.read_file(path).map_err(|source| ExclusionLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_exclusions(&content))
}

/// Parse exclusion file content.
pub fn parse_exclusions(content: &str) -> LoadedExclusions {
    let mut loaded = LoadedExclusions::default();

    for (index, raw) in content.lines().enumerate() {
        let entry = raw.split('#').next().unwrap_or_default().trim();
        if entry.is_empty() {
            continue;
        }

        if let Err(error) = loaded.set.add_str(entry) {
            loaded.rejected.push(RejectedEntry {
                line: index + 1,
                error,
            });
        }
    }

    loaded
}
