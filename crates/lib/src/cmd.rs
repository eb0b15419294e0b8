//! Subprocess invocation for build callbacks.
//!
//! `runcmd` is the single path through which recipes invoke the native
//! toolchain. The child runs with exactly the composed environment (the
//! parent environment is cleared), its stdout and stderr are captured into
//! the owning step's log, and a non-zero exit becomes a step failure instead
//! of a silent continuation.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::executor::StepError;
use crate::log::StepLog;
use crate::spec::EnvMap;

/// Run `argv` with `env` in `cwd`, streaming output into `log`.
pub fn runcmd<S: AsRef<OsStr>>(argv: &[S], env: &EnvMap, cwd: &Path, log: &mut StepLog) -> Result<(), StepError> {
  let display = argv
    .iter()
    .map(|a| a.as_ref().to_string_lossy().into_owned())
    .collect::<Vec<_>>()
    .join(" ");
  log.message(&format!("+ {display}"))?;
  debug!(cmd = %display, cwd = %cwd.display(), "running command");

  let (program, args) = argv.split_first().ok_or(StepError::EmptyCommand)?;

  let status = Command::new(program)
    .args(args)
    .current_dir(cwd)
    .env_clear()
    .envs(env)
    .stdout(log.stdio()?)
    .stderr(log.stdio()?)
    .status()?;

  if !status.success() {
    return Err(StepError::Cmd {
      cmd: display,
      code: status.code(),
    });
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn make_log(dir: &Path) -> StepLog {
    StepLog::create(dir, "test").unwrap()
  }

  fn sh_env() -> EnvMap {
    let mut env = EnvMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    env
  }

  #[test]
  fn output_is_captured_in_the_log() {
    let temp = tempdir().unwrap();
    let mut log = make_log(temp.path());

    runcmd(&["sh", "-c", "echo hello"], &sh_env(), temp.path(), &mut log).unwrap();

    let content = std::fs::read_to_string(log.path()).unwrap();
    assert!(content.contains("+ sh -c echo hello"));
    assert!(content.contains("hello"));
  }

  #[test]
  fn nonzero_exit_is_a_failure_with_code() {
    let temp = tempdir().unwrap();
    let mut log = make_log(temp.path());

    let err = runcmd(&["sh", "-c", "exit 3"], &sh_env(), temp.path(), &mut log).unwrap_err();
    assert!(matches!(err, StepError::Cmd { code: Some(3), .. }));
  }

  #[test]
  fn stderr_is_captured_too() {
    let temp = tempdir().unwrap();
    let mut log = make_log(temp.path());

    runcmd(&["sh", "-c", "echo oops >&2"], &sh_env(), temp.path(), &mut log).unwrap();

    let content = std::fs::read_to_string(log.path()).unwrap();
    assert!(content.contains("oops"));
  }

  #[test]
  fn child_sees_only_the_composed_environment() {
    let temp = tempdir().unwrap();
    let mut log = make_log(temp.path());

    let mut env = sh_env();
    env.insert("RELPY_MARKER".to_string(), "present".to_string());
    runcmd(
      &["sh", "-c", "echo marker=$RELPY_MARKER home=${HOME:-unset}"],
      &env,
      temp.path(),
      &mut log,
    )
    .unwrap();

    let content = std::fs::read_to_string(log.path()).unwrap();
    assert!(content.contains("marker=present"));
    assert!(content.contains("home=unset"));
  }

  #[test]
  fn empty_argv_is_rejected() {
    let temp = tempdir().unwrap();
    let mut log = make_log(temp.path());
    let err = runcmd::<&str>(&[], &sh_env(), temp.path(), &mut log).unwrap_err();
    assert!(matches!(err, StepError::EmptyCommand));
  }
}
