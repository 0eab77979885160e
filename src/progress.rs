//! Human-readable journal at `.ralph/progress.txt`.
//!
//! The agent is told about this file and may append its own notes, so the
//! harness only ever appends timestamped lines to it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

pub const PROGRESS_FILE: &str = "progress.txt";

#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(ralph_dir: &Path) -> Self {
        Self {
            path: ralph_dir.join(PROGRESS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `[timestamp] message` line. Failures are logged and
    /// swallowed; the journal is never load-bearing.
    pub fn append(&self, message: &str) {
        if let Err(e) = self.try_append(message) {
            warn!(error = %e, path = %self.path.display(), "failed to append progress log");
        }
    }

    fn try_append(&self, message: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "[{}] {message}", Utc::now().to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_creates_and_extends_the_file() {
        let tmp = TempDir::new().unwrap();
        let log = ProgressLog::new(tmp.path());
        log.append("=== Harness started ===");
        log.append("Item 001 completed successfully");

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[1].ends_with("Item 001 completed successfully"));
    }

    #[test]
    fn append_to_missing_directory_does_not_panic() {
        let log = ProgressLog::new(Path::new("/definitely/not/a/dir"));
        log.append("ignored");
    }
}
