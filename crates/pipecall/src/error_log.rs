//! Size-rotated error log file.
//!
//! Application failures on either side are appended here in a plain text
//! format meant for people, not tools:
//!
//! ```text
//! pipecall-worker Error at 2024-05-01 13:37:00:
//! Whisper Transcription Error: file not found
//! ==========================================================================
//!
//! ```
//!
//! Once the file grows past the size limit it is moved aside to
//! `<stem>_<MMddyyyyHHmmss>.log` before the next entry is written.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;

use crate::config::env_string;

pub const DEFAULT_MAX_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_FILE_NAME: &str = "pipecall_errors.log";

const SEPARATOR: &str =
    "==========================================================================";

#[derive(Debug, Clone)]
pub struct RotatingErrorLog {
    path: PathBuf,
    label: String,
    max_bytes: u64,
    // Serialises rotate + append within the process.
    guard: Arc<Mutex<()>>,
}

impl RotatingErrorLog {
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
            max_bytes: DEFAULT_MAX_BYTES,
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// `<data_dir>/pipecall/pipecall_errors.log`, or the temp dir when the
    /// platform has no data dir.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pipecall")
            .join(DEFAULT_FILE_NAME)
    }

    /// Log at `PIPECALL_ERROR_LOG`, falling back to [`default_path`](Self::default_path).
    pub fn from_env(label: impl Into<String>) -> Self {
        let path = env_string("PIPECALL_ERROR_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_path);
        Self::new(path, label)
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Failures are logged and swallowed.
    pub fn append(&self, message: &str) {
        if let Err(e) = self.try_append(message) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                message,
                "Unable to write to error log"
            );
        }
    }

    pub fn try_append(&self, message: &str) -> io::Result<()> {
        let _guard = match self.guard.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(rotated) = self.rotate_if_oversized()? {
            tracing::info!(rotated = %rotated.display(), "Rotated error log");
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let entry = format!(
            "{label} Error at {time}:\n{message}\n{SEPARATOR}\n\n",
            label = self.label,
            time = Local::now().format("%Y-%m-%d %H:%M:%S"),
        );
        file.write_all(entry.as_bytes())
    }

    /// Move the current file aside when it exceeds the size limit.
    ///
    /// Returns the new location of the old contents, if rotated.
    pub fn rotate_if_oversized(&self) -> io::Result<Option<PathBuf>> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if len <= self.max_bytes {
            return Ok(None);
        }

        let stamp = Local::now().format("%m%d%Y%H%M%S").to_string();
        let target = self.rotated_path(&stamp);
        fs::rename(&self.path, &target)?;
        Ok(Some(target))
    }

    fn rotated_path(&self, stamp: &str) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pipecall_errors".to_string());
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));

        let mut candidate = dir.join(format!("{stem}_{stamp}.log"));
        let mut n = 1;
        // Two rotations inside the same second.
        while candidate.exists() {
            candidate = dir.join(format!("{stem}_{stamp}-{n}.log"));
            n += 1;
        }
        candidate
    }
}
