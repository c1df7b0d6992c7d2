//! Durable, append-only log of non-fatal failures.

use crate::sheet::TIMESTAMP_FORMAT;
use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One line per failure: `<timestamp>: <context> for <id>: <reason>`.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a line. A log that cannot be written is only traced.
    pub fn append(&self, context: &str, id: &str, reason: &dyn Display) {
        let line = format!(
            "{}: {context} for {id}: {reason}\n",
            chrono::Local::now().format(TIMESTAMP_FORMAT)
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::error!(path = %self.path.display(), error = %e, "could not append to error log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path().join("error_log.txt"));
        log.append("Excel save error", "21CS001", &"file is locked");
        log.append("Error updating cloud storage", "21CS002", &"timed out");

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(": Excel save error for 21CS001: file is locked"));
        assert!(lines[1].ends_with(": Error updating cloud storage for 21CS002: timed out"));
        // "YYYY-MM-DD HH:MM:SS" prefix
        assert_eq!(lines[0].find(": "), Some(19));
    }

    #[test]
    fn test_unwritable_log_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path().join("missing-dir/error_log.txt"));
        log.append("ctx", "id", &"reason");
        assert!(!log.path().exists());
    }
}
