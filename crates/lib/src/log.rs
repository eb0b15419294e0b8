//! Per-step log files.
//!
//! Every step owns exactly one log file, opened for exclusive append by that
//! step. All subprocess output and pipeline messages for the step land there;
//! the `tracing` stream carries only the high-level run narrative.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Writable log sink owned by a single running step.
#[derive(Debug)]
pub struct StepLog {
  path: PathBuf,
  file: File,
}

impl StepLog {
  /// Create (or truncate) the log file for `step` under `dir`.
  pub fn create(dir: &Path, step: &str) -> io::Result<Self> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{step}.log"));
    let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
    Ok(Self { path, file })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Write a pipeline message line into the log.
  pub fn message(&mut self, msg: &str) -> io::Result<()> {
    writeln!(self.file, "{msg}")?;
    self.file.flush()
  }

  /// A `Stdio` handle appending to this log, for subprocess stdout/stderr.
  pub fn stdio(&self) -> io::Result<Stdio> {
    Ok(Stdio::from(self.file.try_clone()?))
  }
}

/// Read the last `lines` lines of a log file, for failure detail.
///
/// Returns an empty string if the file cannot be read.
pub fn tail(path: &Path, lines: usize) -> String {
  let Ok(content) = std::fs::read_to_string(path) else {
    return String::new();
  };
  let all: Vec<&str> = content.lines().collect();
  let start = all.len().saturating_sub(lines);
  all[start..].join("\n")
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn messages_are_appended_in_order() {
    let temp = tempdir().unwrap();
    let mut log = StepLog::create(temp.path(), "openssl").unwrap();
    log.message("first").unwrap();
    log.message("second").unwrap();

    let content = std::fs::read_to_string(log.path()).unwrap();
    assert_eq!(content, "first\nsecond\n");
  }

  #[test]
  fn create_truncates_previous_run() {
    let temp = tempdir().unwrap();
    {
      let mut log = StepLog::create(temp.path(), "zlib").unwrap();
      log.message("stale").unwrap();
    }
    let log = StepLog::create(temp.path(), "zlib").unwrap();
    let content = std::fs::read_to_string(log.path()).unwrap();
    assert!(content.is_empty());
  }

  #[test]
  fn tail_returns_last_lines() {
    let temp = tempdir().unwrap();
    let mut log = StepLog::create(temp.path(), "python").unwrap();
    for i in 0..30 {
      log.message(&format!("line {i}")).unwrap();
    }

    let tail = tail(log.path(), 3);
    assert_eq!(tail, "line 27\nline 28\nline 29");
  }

  #[test]
  fn tail_of_missing_file_is_empty() {
    assert_eq!(tail(Path::new("/nonexistent/step.log"), 5), "");
  }
}
