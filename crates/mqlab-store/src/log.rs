use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;

use crate::error::{io_err, StoreError};

/// Append-only text log for one experiment. A single logical writer (the
/// sequencer) holds it; the mutex covers the rare cross-task append.
pub struct ExperimentLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl ExperimentLog {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append one timestamped line. Log failures are swallowed; the log
    /// must never take an experiment down.
    pub fn append(&self, line: &str) {
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{} {}", stamp, line);
        }
    }
}
