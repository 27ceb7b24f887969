//! Filesystem trait and implementations.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;

/// Errors from filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("path error: {0}")]
    Path(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

impl FsError {
    /// True when the error means "nothing there yet" rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

/// Trait for filesystem operations.
/// Abstracted for testing with mock implementations.
pub trait Filesystem: Send + Sync {
    /// Replace the file at `path` all-or-nothing (write to temp, then rename).
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError>;

    /// Append data to a file, creating it if needed.
    /// Existing content is never rewritten.
    fn append_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError>;

    /// Read file contents as a string.
    fn read_file(&self, path: &Path) -> Result<String, FsError>;

    /// Open a buffered reader positioned at `offset` bytes into the file.
    fn open_from(&self, path: &Path, offset: u64) -> Result<Box<dyn BufRead + Send>, FsError>;

    /// Current length of the file in bytes.
    fn file_len(&self, path: &Path) -> Result<u64, FsError>;

    /// Stable identity of the file behind `path` (inode on Unix).
    ///
    /// Changes when the file is replaced, e.g. by log rotation.
    fn file_id(&self, path: &Path) -> Result<u64, FsError>;

    /// Check if a path exists.
    fn exists(&self, path: &Path) -> bool;
}

/// Real filesystem implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFilesystem;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sibling temp file, unique per write so concurrent writers never share one.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}

fn write_then_rename(temp_path: &Path, path: &Path, data: &[u8]) -> Result<(), FsError> {
    let mut file = File::create(temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    // Rename is atomic within one filesystem; readers see old or new, never half.
    fs::rename(temp_path, path)?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<(), FsError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

impl Filesystem for RealFilesystem {
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        ensure_parent(path)?;
        let temp_path = temp_path_for(path);

        let result = write_then_rename(&temp_path, path, data);
        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    fn append_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        ensure_parent(path)?;

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<String, FsError> {
        Ok(fs::read_to_string(path)?)
    }

    fn open_from(&self, path: &Path, offset: u64) -> Result<Box<dyn BufRead + Send>, FsError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn file_len(&self, path: &Path) -> Result<u64, FsError> {
        Ok(fs::metadata(path)?.len())
    }

    #[cfg(unix)]
    fn file_id(&self, path: &Path) -> Result<u64, FsError> {
        use std::os::unix::fs::MetadataExt;
        Ok(fs::metadata(path)?.ino())
    }

    #[cfg(not(unix))]
    fn file_id(&self, path: &Path) -> Result<u64, FsError> {
        // No inode; fall back to creation time so rotation is still noticed.
        let created = fs::metadata(path)?
            .created()?
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| FsError::Path(e.to_string()))?;
        Ok(created.as_secs())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Mock filesystem for testing.
/// Cloning creates a new handle to the same underlying data.
#[derive(Debug, Clone, Default)]
pub struct MockFilesystem {
    files: Arc<RwLock<HashMap<PathBuf, Vec<u8>>>>,
    ids: Arc<RwLock<HashMap<PathBuf, u64>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get content of a specific file.
    pub fn get_file(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.read().unwrap().get(path).cloned()
    }

    /// Get content of a file as UTF-8 text.
    pub fn get_text(&self, path: &Path) -> Option<String> {
        self.get_file(path)
            .map(|data| String::from_utf8_lossy(&data).to_string())
    }

    /// Add or replace a file directly (for test setup).
    pub fn add_file(&self, path: PathBuf, data: Vec<u8>) {
        self.files.write().unwrap().insert(path, data);
    }

    /// Append raw bytes to a file, as another process would (for test setup).
    pub fn append_file(&self, path: &Path, data: &[u8]) {
        self.files
            .write()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default()
            .extend_from_slice(data);
    }

    /// Set the identity reported by `file_id` (simulates rotation).
    pub fn set_file_id(&self, path: &Path, id: u64) {
        self.ids.write().unwrap().insert(path.to_path_buf(), id);
    }

    /// Make every subsequent write/append fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self, path: &Path) -> Result<(), FsError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("simulated write failure: {}", path.display()),
            )));
        }
        Ok(())
    }

    fn not_found(path: &Path) -> FsError {
        FsError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("file not found: {}", path.display()),
        ))
    }
}

impl Filesystem for MockFilesystem {
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        self.check_writable(path)?;
        self.files
            .write()
            .unwrap()
            .insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn append_atomic(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        self.check_writable(path)?;
        self.append_file(path, data);
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<String, FsError> {
        let files = self.files.read().unwrap();
        match files.get(path) {
            Some(data) => String::from_utf8(data.clone())
                .map_err(|e| FsError::Path(format!("invalid utf8: {}", e))),
            None => Err(Self::not_found(path)),
        }
    }

    fn open_from(&self, path: &Path, offset: u64) -> Result<Box<dyn BufRead + Send>, FsError> {
        let data = self.get_file(path).ok_or_else(|| Self::not_found(path))?;
        let start = (offset as usize).min(data.len());
        Ok(Box::new(Cursor::new(data[start..].to_vec())))
    }

    fn file_len(&self, path: &Path) -> Result<u64, FsError> {
        self.get_file(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Self::not_found(path))
    }

    fn file_id(&self, path: &Path) -> Result<u64, FsError> {
        if !self.exists(path) {
            return Err(Self::not_found(path));
        }
        Ok(self.ids.read().unwrap().get(path).copied().unwrap_or(1))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().unwrap().contains_key(path)
    }
}
