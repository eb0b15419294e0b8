//! Source-tree patching.
//!
//! Patches are opaque, versioned inputs supplied by the recipes; the pipeline
//! only guarantees idempotent application. A marker file in the source tree
//! records which patches were applied, so re-running a step against an
//! already-patched tree is a detected no-op, never silent corruption.

use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::cmd::runcmd;
use crate::consts::PATCH_MARKER;
use crate::executor::StepError;
use crate::log::StepLog;
use crate::spec::EnvMap;

/// A named unified diff applied to a step's source tree before its build
/// callback runs.
#[derive(Debug, Clone)]
pub struct Patch {
  /// Identifies the patch in the marker file and logs.
  pub name: String,
  /// Unified diff content, applied with `-p0` relative to the source root.
  pub diff: String,
}

/// Result of applying a patch.
#[derive(Debug, PartialEq, Eq)]
pub enum PatchOutcome {
  Applied,
  AlreadyApplied,
}

/// Apply `patch` to `source_dir`, recording it in the marker file.
pub fn apply_patch(patch: &Patch, source_dir: &Path, env: &EnvMap, log: &mut StepLog) -> Result<PatchOutcome, StepError> {
  let marker = source_dir.join(PATCH_MARKER);

  if let Ok(applied) = std::fs::read_to_string(&marker) {
    if applied.lines().any(|line| line == patch.name) {
      debug!(patch = %patch.name, "patch already applied, skipping");
      log.message(&format!("patch {} already applied", patch.name))?;
      return Ok(PatchOutcome::AlreadyApplied);
    }
  }

  let mut diff_file = tempfile::Builder::new().suffix("_patch").tempfile()?;
  diff_file.write_all(patch.diff.as_bytes())?;
  diff_file.flush()?;

  runcmd(
    &[
      "patch".as_ref(),
      "-p0".as_ref(),
      "-i".as_ref(),
      diff_file.path().as_os_str(),
    ],
    env,
    source_dir,
    log,
  )?;

  let mut marker_file = std::fs::OpenOptions::new().create(true).append(true).open(&marker)?;
  writeln!(marker_file, "{}", patch.name)?;
  Ok(PatchOutcome::Applied)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn env() -> EnvMap {
    let mut env = EnvMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    env
  }

  #[test]
  fn marked_patch_is_a_detected_noop() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("src");
    std::fs::create_dir(&source).unwrap();
    std::fs::write(source.join(PATCH_MARKER), "disable-multiarch\n").unwrap();

    let mut log = StepLog::create(temp.path(), "python").unwrap();
    let patch = Patch {
      name: "disable-multiarch".to_string(),
      diff: "--- ./setup.py\n+++ ./setup.py\n".to_string(),
    };

    // The patch binary is never invoked: the source tree is untouched and
    // the outcome says so.
    let outcome = apply_patch(&patch, &source, &env(), &mut log).unwrap();
    assert_eq!(outcome, PatchOutcome::AlreadyApplied);

    let content = std::fs::read_to_string(log.path()).unwrap();
    assert!(content.contains("already applied"));
  }

  #[test]
  fn marker_requires_an_exact_name_match() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("src");
    std::fs::create_dir(&source).unwrap();
    std::fs::write(source.join(PATCH_MARKER), "disable-multiarch-v2\n").unwrap();

    let mut log = StepLog::create(temp.path(), "python").unwrap();
    let patch = Patch {
      name: "disable-multiarch".to_string(),
      diff: "--- ./setup.py\n+++ ./setup.py\n".to_string(),
    };

    // A different recorded name must not short-circuit; application is
    // attempted and its outcome (whatever the patch tool says) propagates.
    let result = apply_patch(&patch, &source, &env(), &mut log);
    assert!(!matches!(result, Ok(PatchOutcome::AlreadyApplied)));
  }
}
