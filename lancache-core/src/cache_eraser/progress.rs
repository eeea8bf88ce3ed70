//! Atomic progress-document writer, rewritten after every shard.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EraseProgress {
    pub is_processing: bool,
    pub percent_complete: f64,
    pub status: String,
    pub message: String,
    pub directories_processed: u32,
    pub total_directories: u32,
    pub bytes_deleted: u64,
    pub files_deleted: u64,
}

pub struct ProgressWriter {
    path: PathBuf,
}

impl ProgressWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Writes via temp-file + rename, matching the state store's atomicity
    /// contract. Failures are logged, not propagated — a missed progress
    /// tick is not fatal to the erase itself.
    pub fn write(&self, progress: &EraseProgress) {
        if let Err(e) = self.try_write(progress) {
            warn!(error = %e, "failed to write cache-erase progress document");
        }
    }

    fn try_write(&self, progress: &EraseProgress) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(progress)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json.as_bytes())?;
        {
            let f = fs::File::open(&tmp_path)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)
    }
}
