//! Wave-parallel execution of a build graph.
//!
//! The executor walks a validated graph wave by wave. Within a wave every
//! step whose dependencies all reached `Done` runs concurrently on a
//! `JoinSet`, gated by a semaphore; steps downstream of a failure are
//! recorded `Skipped` without their callbacks ever being invoked. A failed
//! step never triggers cleanup of the shared prefix — downstream steps are
//! skipped instead, so a poisoned prefix is an explicit run condition.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::consts::{FETCH_TIMEOUT_SECS, LOG_TAIL_LINES};
use crate::dirs::{Dirs, WorkLayout};
use crate::env::{EnvError, PlatformFacts, compose};
use crate::fetch::{self, FetchError};
use crate::graph::BuildGraph;
use crate::log::{self, StepLog};
use crate::patch::apply_patch;
use crate::spec::{BuildSpec, EnvFn};

/// Errors raised while executing one step.
#[derive(Debug, Error)]
pub enum StepError {
  #[error("empty command line")]
  EmptyCommand,

  #[error(transparent)]
  Env(#[from] EnvError),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  /// A subprocess exited non-zero.
  #[error("command failed with exit code {code:?}: {cmd}")]
  Cmd { cmd: String, code: Option<i32> },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Errors that abort a run before any step executes.
#[derive(Debug, Error)]
pub enum RunError {
  #[error("failed to prepare work tree: {0}")]
  Io(#[from] std::io::Error),
}

/// Final state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
  Done,
  Failed,
  Skipped,
}

impl std::fmt::Display for StepStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Done => "done",
      Self::Failed => "failed",
      Self::Skipped => "skipped",
    };
    write!(f, "{s}")
  }
}

/// Outcome of one step. Immutable once the step reaches `Done` or `Failed`.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
  pub status: StepStatus,
  /// The step's log file, when one was opened.
  pub log_path: Option<PathBuf>,
  /// Failure or skip detail: exit code, last log lines, or the name of the
  /// failed dependency.
  pub detail: Option<String>,
}

/// Per-run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
  /// Maximum number of steps executing concurrently.
  pub parallelism: usize,
  /// Timeout for each download attempt.
  pub fetch_timeout: Duration,
  /// Log lines captured as failure detail.
  pub log_tail: usize,
}

impl Default for RunConfig {
  fn default() -> Self {
    Self {
      parallelism: std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4),
      fetch_timeout: Duration::from_secs(FETCH_TIMEOUT_SECS),
      log_tail: LOG_TAIL_LINES,
    }
  }
}

/// Every step's final status for one run.
#[derive(Debug, Serialize)]
pub struct RunSummary {
  pub platform: String,
  pub version: String,
  pub steps: std::collections::BTreeMap<String, StepResult>,
}

impl RunSummary {
  pub fn is_success(&self) -> bool {
    self.steps.values().all(|r| r.status == StepStatus::Done)
  }

  pub fn status(&self, name: &str) -> Option<StepStatus> {
    self.steps.get(name).map(|r| r.status)
  }

  pub fn count(&self, status: StepStatus) -> usize {
    self.steps.values().filter(|r| r.status == status).count()
  }
}

/// Execute every step of `graph`, in dependency order with wave parallelism.
pub async fn run(
  graph: &BuildGraph,
  layout: &WorkLayout,
  facts: &PlatformFacts,
  config: &RunConfig,
) -> Result<RunSummary, RunError> {
  layout.ensure()?;

  let waves = graph.waves();
  info!(
    platform = graph.platform(),
    version = graph.version(),
    steps = graph.len(),
    waves = waves.len(),
    "starting build run"
  );

  let mut statuses: HashMap<String, StepStatus> = HashMap::new();
  let mut results: std::collections::BTreeMap<String, StepResult> = Default::default();
  let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));

  for (wave_idx, wave) in waves.iter().enumerate() {
    debug!(wave = wave_idx, steps = wave.len(), "executing wave");

    // Partition the wave: steps below a failure are skipped up front.
    let mut ready = Vec::new();
    for name in wave {
      let failed_dep = graph
        .dependencies(name)
        .into_iter()
        .find(|dep| statuses.get(dep) != Some(&StepStatus::Done));

      if let Some(dep) = failed_dep {
        warn!(step = %name, dependency = %dep, "skipping step, dependency did not finish");
        statuses.insert(name.clone(), StepStatus::Skipped);
        results.insert(
          name.clone(),
          StepResult {
            status: StepStatus::Skipped,
            log_path: None,
            detail: Some(format!("dependency '{dep}' did not reach done")),
          },
        );
      } else {
        ready.push(name.clone());
      }
    }

    // Run the remainder of the wave concurrently. Steps already running are
    // never preempted: the wave is joined to completion even on failure.
    let mut join_set = JoinSet::new();
    for name in ready {
      let spec = Arc::clone(graph.get(&name).expect("wave members are registered"));
      let populate = graph.populate_env();
      let dirs = layout.dirs_for(&name);
      let facts = facts.clone();
      let version = graph.version().to_string();
      let semaphore = Arc::clone(&semaphore);
      let fetch_timeout = config.fetch_timeout;
      let log_tail = config.log_tail;

      join_set.spawn(async move {
        let _permit = semaphore.acquire().await.expect("semaphore never closed");
        let result = execute_step(spec, populate, dirs, facts, version, fetch_timeout, log_tail).await;
        (name, result)
      });
    }

    while let Some(joined) = join_set.join_next().await {
      let (name, result) = match joined {
        Ok(pair) => pair,
        Err(join_err) => {
          // A panicking callback poisons only its own step; we cannot know
          // which one, so surface it loudly and keep the run alive.
          error!(error = %join_err, "step task aborted");
          continue;
        }
      };

      match result.status {
        StepStatus::Done => info!(step = %name, "step done"),
        StepStatus::Failed => error!(step = %name, detail = result.detail.as_deref().unwrap_or(""), "step failed"),
        StepStatus::Skipped => {}
      }
      statuses.insert(name.clone(), result.status);
      results.insert(name, result);
    }
  }

  let summary = RunSummary {
    platform: graph.platform().to_string(),
    version: graph.version().to_string(),
    steps: results,
  };
  info!(
    done = summary.count(StepStatus::Done),
    failed = summary.count(StepStatus::Failed),
    skipped = summary.count(StepStatus::Skipped),
    "build run complete"
  );
  Ok(summary)
}

/// Drive one step through fetch -> verify -> patch -> build.
async fn execute_step(
  spec: Arc<BuildSpec>,
  populate: Option<EnvFn>,
  dirs: Dirs,
  facts: PlatformFacts,
  version: String,
  fetch_timeout: Duration,
  log_tail: usize,
) -> StepResult {
  let mut steplog = match StepLog::create(&dirs.logs, &spec.name) {
    Ok(log) => log,
    Err(e) => {
      return StepResult {
        status: StepStatus::Failed,
        log_path: None,
        detail: Some(format!("failed to open step log: {e}")),
      };
    }
  };
  let log_path = steplog.path().to_path_buf();

  let fail = |detail: String| StepResult {
    status: StepStatus::Failed,
    log_path: Some(log_path.clone()),
    detail: Some(detail),
  };

  // Base environment plus graph- and step-level contributions.
  let mut env = match compose(&dirs, &facts) {
    Ok(env) => env,
    Err(e) => {
      let _ = steplog.message(&format!("error: {e}"));
      return fail(e.to_string());
    }
  };
  env.insert("RELPY_VERSION".to_string(), version);
  if let Some(f) = populate {
    f(&mut env, &dirs);
  }
  if let Some(f) = spec.env {
    f(&mut env, &dirs);
  }

  // Materialize source and scratch trees.
  if let Some(source) = &spec.source {
    if let Err(e) = fetch::fetch_source(&spec.name, source, &dirs.downloads, &dirs.source, fetch_timeout).await {
      let _ = steplog.message(&format!("error: {e}"));
      return fail(e.to_string());
    }
  } else if let Err(e) = std::fs::create_dir_all(&dirs.source) {
    return fail(format!("failed to create source dir: {e}"));
  }
  if let Err(e) = std::fs::create_dir_all(&dirs.tmpbuild) {
    return fail(format!("failed to create build dir: {e}"));
  }

  // Patch and build run blocking; the worker suspends here without blocking
  // unrelated steps.
  let blocking_spec = Arc::clone(&spec);
  let blocking_dirs = dirs.clone();
  let joined = tokio::task::spawn_blocking(move || {
    let outcome = (|| -> Result<(), StepError> {
      if let Some(patch) = &blocking_spec.patch {
        apply_patch(patch, &blocking_dirs.source, &env, &mut steplog)?;
      }
      (blocking_spec.build)(&env, &blocking_dirs, &mut steplog)
    })();
    (steplog, outcome)
  })
  .await;

  match joined {
    Ok((mut steplog, Ok(()))) => {
      let _ = steplog.message("step complete");
      StepResult {
        status: StepStatus::Done,
        log_path: Some(log_path.clone()),
        detail: None,
      }
    }
    Ok((mut steplog, Err(e))) => {
      let _ = steplog.message(&format!("error: {e}"));
      let tail = log::tail(&log_path, log_tail);
      let detail = if tail.is_empty() {
        e.to_string()
      } else {
        format!("{e}\n--- last log lines ---\n{tail}")
      };
      fail(detail)
    }
    Err(join_err) => fail(format!("build callback panicked: {join_err}")),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::GraphBuilder;
  use crate::spec::EnvMap;
  use relpy_platform::{Arch, Os, Triple};
  use tempfile::tempdir;

  fn ok_build(_env: &EnvMap, _dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
    log.message("building").unwrap();
    Ok(())
  }

  fn failing_build(_env: &EnvMap, _dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
    log.message("configure: error: C compiler cannot create executables").unwrap();
    Err(StepError::Cmd {
      cmd: "./configure".to_string(),
      code: Some(77),
    })
  }

  fn install_marker(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
    log.message("installing marker").unwrap();
    std::fs::create_dir_all(&dirs.prefix)?;
    std::fs::write(dirs.prefix.join(format!("{}.installed", env["RELPY_HOST_ARCH"])), "ok")?;
    Ok(())
  }

  fn facts() -> PlatformFacts {
    PlatformFacts {
      build: Some(Triple::new(Arch::X86_64, Os::Linux)),
      host: Some(Triple::new(Arch::X86_64, Os::Linux)),
      native_python: None,
    }
  }

  fn spec(name: &str, deps: &[&str], build: crate::spec::BuildFn) -> BuildSpec {
    BuildSpec::new(name, build).with_depends(deps)
  }

  async fn run_graph(graph: &BuildGraph) -> RunSummary {
    let temp = tempdir().unwrap();
    let layout = WorkLayout::new(temp.path(), Triple::new(Arch::X86_64, Os::Linux));
    run(graph, &layout, &facts(), &RunConfig::default()).await.unwrap()
  }

  #[tokio::test]
  async fn all_steps_done_in_a_healthy_graph() {
    let mut builder = GraphBuilder::new("linux", "python", "3.10.14");
    builder.add(spec("openssl", &[], ok_build)).unwrap();
    builder.add(spec("libxcrypt", &[], ok_build)).unwrap();
    builder.add(spec("python", &["openssl", "libxcrypt"], ok_build)).unwrap();
    let graph = builder.finish().unwrap();

    let summary = run_graph(&graph).await;
    assert!(summary.is_success());
    assert_eq!(summary.status("openssl"), Some(StepStatus::Done));
    assert_eq!(summary.status("libxcrypt"), Some(StepStatus::Done));
    assert_eq!(summary.status("python"), Some(StepStatus::Done));
  }

  #[tokio::test]
  async fn failure_skips_dependents_but_not_siblings() {
    let mut builder = GraphBuilder::new("linux", "python", "3.10.14");
    builder.add(spec("openssl", &[], ok_build)).unwrap();
    builder.add(spec("libxcrypt", &[], failing_build)).unwrap();
    builder.add(spec("python", &["openssl", "libxcrypt"], ok_build)).unwrap();
    let graph = builder.finish().unwrap();

    let summary = run_graph(&graph).await;
    assert!(!summary.is_success());
    assert_eq!(summary.status("openssl"), Some(StepStatus::Done));
    assert_eq!(summary.status("libxcrypt"), Some(StepStatus::Failed));
    assert_eq!(summary.status("python"), Some(StepStatus::Skipped));

    // skip detail names the failed dependency and the callback never ran
    let python = &summary.steps["python"];
    assert!(python.detail.as_ref().unwrap().contains("libxcrypt"));
    assert!(python.log_path.is_none());
  }

  #[tokio::test]
  async fn skips_cascade_through_the_downstream_subgraph() {
    let mut builder = GraphBuilder::new("linux", "d", "1");
    builder.add(spec("a", &[], failing_build)).unwrap();
    builder.add(spec("b", &["a"], ok_build)).unwrap();
    builder.add(spec("c", &["b"], ok_build)).unwrap();
    builder.add(spec("d", &["c"], ok_build)).unwrap();
    let graph = builder.finish().unwrap();

    let summary = run_graph(&graph).await;
    assert_eq!(summary.status("a"), Some(StepStatus::Failed));
    assert_eq!(summary.status("b"), Some(StepStatus::Skipped));
    assert_eq!(summary.status("c"), Some(StepStatus::Skipped));
    assert_eq!(summary.status("d"), Some(StepStatus::Skipped));
  }

  #[tokio::test]
  async fn failed_step_detail_carries_exit_code_and_log_tail() {
    let mut builder = GraphBuilder::new("linux", "openssl", "3.2.1");
    builder.add(spec("openssl", &[], failing_build)).unwrap();
    let graph = builder.finish().unwrap();

    let summary = run_graph(&graph).await;
    let result = &summary.steps["openssl"];
    assert_eq!(result.status, StepStatus::Failed);
    let detail = result.detail.as_ref().unwrap();
    assert!(detail.contains("exit code Some(77)"));
    assert!(detail.contains("C compiler cannot create executables"));
    assert!(result.log_path.is_some());
  }

  #[tokio::test]
  async fn aggregation_step_without_source_or_deps_executes() {
    let mut builder = GraphBuilder::new("linux", "finalize", "1");
    builder.add(spec("finalize", &[], install_marker)).unwrap();
    let graph = builder.finish().unwrap();

    let temp = tempdir().unwrap();
    let layout = WorkLayout::new(temp.path(), Triple::new(Arch::X86_64, Os::Linux));
    let summary = run(&graph, &layout, &facts(), &RunConfig::default()).await.unwrap();

    assert!(summary.is_success());
    assert!(layout.prefix().join("x86_64.installed").exists());
  }

  #[tokio::test]
  async fn missing_platform_fact_fails_the_step_and_skips_dependents() {
    let mut builder = GraphBuilder::new("linux", "python", "3.10.14");
    builder.add(spec("openssl", &[], ok_build)).unwrap();
    builder.add(spec("python", &["openssl"], ok_build)).unwrap();
    let graph = builder.finish().unwrap();

    let temp = tempdir().unwrap();
    let layout = WorkLayout::new(temp.path(), Triple::new(Arch::X86_64, Os::Linux));
    let facts = PlatformFacts {
      build: None,
      host: Some(Triple::new(Arch::X86_64, Os::Linux)),
      native_python: None,
    };

    let summary = run(&graph, &layout, &facts, &RunConfig::default()).await.unwrap();
    assert_eq!(summary.status("openssl"), Some(StepStatus::Failed));
    assert_eq!(summary.status("python"), Some(StepStatus::Skipped));
    assert!(
      summary.steps["openssl"]
        .detail
        .as_ref()
        .unwrap()
        .contains("missing platform fact")
    );
  }

  fn graph_env(env: &mut EnvMap, _dirs: &Dirs) {
    env.insert("RELPY_GRAPH_VAR".to_string(), "graph".to_string());
  }

  fn step_env(env: &mut EnvMap, _dirs: &Dirs) {
    // extends the graph contribution rather than replacing it
    let existing = env.get("RELPY_GRAPH_VAR").cloned().unwrap_or_default();
    env.insert("RELPY_STEP_VAR".to_string(), format!("{existing}+step"));
  }

  fn env_checking_build(env: &EnvMap, _dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
    log.message(&format!("step var: {:?}", env.get("RELPY_STEP_VAR"))).unwrap();
    if env.get("RELPY_STEP_VAR").map(String::as_str) == Some("graph+step") {
      Ok(())
    } else {
      Err(StepError::Cmd {
        cmd: "env check".to_string(),
        code: Some(1),
      })
    }
  }

  #[tokio::test]
  async fn env_callbacks_extend_the_base_in_order() {
    let mut builder = GraphBuilder::new("linux", "readline", "8.2").populate_env(graph_env);
    builder
      .add(BuildSpec::new("readline", env_checking_build).with_env(step_env))
      .unwrap();
    let graph = builder.finish().unwrap();

    let summary = run_graph(&graph).await;
    assert!(summary.is_success(), "graph and step env contributions must both apply");
  }

  #[tokio::test]
  async fn per_step_logs_are_written_under_the_triple() {
    let mut builder = GraphBuilder::new("linux", "zlib", "1.3.1");
    builder.add(spec("zlib", &[], ok_build)).unwrap();
    let graph = builder.finish().unwrap();

    let temp = tempdir().unwrap();
    let layout = WorkLayout::new(temp.path(), Triple::new(Arch::X86_64, Os::Linux));
    let summary = run(&graph, &layout, &facts(), &RunConfig::default()).await.unwrap();

    let log_path = summary.steps["zlib"].log_path.clone().unwrap();
    assert!(log_path.starts_with(layout.logs()));
    let content = std::fs::read_to_string(log_path).unwrap();
    assert!(content.contains("building"));
    assert!(content.contains("step complete"));
  }

  #[test]
  fn summary_counts_by_status() {
    let mut steps = std::collections::BTreeMap::new();
    steps.insert(
      "a".to_string(),
      StepResult {
        status: StepStatus::Done,
        log_path: None,
        detail: None,
      },
    );
    steps.insert(
      "b".to_string(),
      StepResult {
        status: StepStatus::Skipped,
        log_path: None,
        detail: None,
      },
    );
    let summary = RunSummary {
      platform: "linux".to_string(),
      version: "3.10.14".to_string(),
      steps,
    };

    assert_eq!(summary.count(StepStatus::Done), 1);
    assert_eq!(summary.count(StepStatus::Skipped), 1);
    assert_eq!(summary.count(StepStatus::Failed), 0);
    assert!(!summary.is_success());
  }
}
