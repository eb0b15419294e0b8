use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use relpy_lib::check::{self, ProbeError};
use relpy_lib::consts::PROBE_TIMEOUT_SECS;
use relpy_lib::env::PlatformFacts;
use relpy_lib::executor::{RunConfig, RunSummary, StepStatus, run};
use relpy_lib::graph::{BuildGraph, GraphRegistry};
use relpy_lib::WorkLayout;
use relpy_lib::recipes;
use relpy_platform::{Arch, Os, Platform, Triple, paths};
use tracing_subscriber::EnvFilter;

/// relpy - relocatable Python runtime builder
#[derive(Parser)]
#[command(name = "relpy")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build a runtime and its native dependencies
  Build {
    /// Runtime version to build (default: newest registered line)
    #[arg(long)]
    version: Option<String>,

    /// Target architecture (default: the build machine's)
    #[arg(long)]
    arch: Option<String>,

    /// Work-tree root (default: $RELPY_ROOT or the XDG data dir)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Native interpreter used when cross compiling the runtime
    #[arg(long)]
    build_python: Option<PathBuf>,

    /// Maximum concurrently running steps
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Emit the run summary as JSON
    #[arg(long)]
    json: bool,
  },

  /// Report version drift between pinned and upstream versions
  Check {
    /// Runtime version line to check (default: newest)
    #[arg(long)]
    version: Option<String>,
  },

  /// Print the dependency graph in build order
  Graph {
    /// Runtime version line to print (default: newest)
    #[arg(long)]
    version: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("relpy_lib=debug,relpy=debug")
  } else {
    EnvFilter::from_default_env()
  };
  tracing_subscriber::fmt().with_env_filter(filter).without_time().init();

  match cli.command {
    Commands::Build {
      version,
      arch,
      root,
      build_python,
      jobs,
      json,
    } => cmd_build(version, arch, root, build_python, jobs, json).await,
    Commands::Check { version } => cmd_check(version).await,
    Commands::Graph { version } => cmd_graph(version),
  }
}

/// Pick a graph from the registry: an explicit version or the newest line.
fn select_graph(registry: &GraphRegistry, platform: &str, version: Option<&str>) -> Result<Arc<BuildGraph>> {
  let graph = match version {
    Some(version) => registry
      .get(platform, version)
      .with_context(|| format!("no {platform} graph for version {version} (known: {:?})", registry.versions(platform)))?,
    None => registry
      .latest(platform)
      .with_context(|| format!("no graphs registered for {platform}"))?,
  };
  Ok(Arc::clone(graph))
}

fn current_platform() -> Result<Platform> {
  Platform::current().context("unsupported build machine")
}

async fn cmd_build(
  version: Option<String>,
  arch: Option<String>,
  root: Option<PathBuf>,
  build_python: Option<PathBuf>,
  jobs: Option<usize>,
  json: bool,
) -> Result<()> {
  let registry = recipes::registry()?;
  let platform = current_platform()?;
  let graph = select_graph(&registry, platform.os.as_str(), version.as_deref())?;

  let host = match arch {
    Some(arch) => Triple::new(arch.parse::<Arch>()?, Os::Linux),
    None => platform.triple(),
  };

  let mut facts = PlatformFacts::for_host(host.clone());
  if let Some(python) = build_python {
    facts = facts.with_native_python(python);
  }

  let layout = WorkLayout::new(root.unwrap_or_else(paths::work_root), host);
  let mut config = RunConfig::default();
  if let Some(jobs) = jobs {
    config.parallelism = jobs.max(1);
  }

  let summary = run(&graph, &layout, &facts, &config).await?;

  if json {
    println!("{}", serde_json::to_string_pretty(&summary)?);
  } else {
    print_summary(&summary);
  }

  if !summary.is_success() {
    std::process::exit(1);
  }
  Ok(())
}

fn print_summary(summary: &RunSummary) {
  println!(
    "{} {} for {}",
    "relpy".bold(),
    summary.version,
    summary.platform
  );
  for (name, result) in &summary.steps {
    let status = match result.status {
      StepStatus::Done => format!("{}", "done".green()),
      StepStatus::Failed => format!("{}", "failed".red().bold()),
      StepStatus::Skipped => format!("{}", "skipped".yellow()),
    };
    println!("  {name:<24} {status}");
  }

  for (name, result) in &summary.steps {
    if result.status == StepStatus::Failed {
      if let Some(detail) = &result.detail {
        eprintln!("\n{} {name}:\n{detail}", "failure in".red().bold());
      }
      if let Some(log) = &result.log_path {
        eprintln!("full log: {}", log.display());
      }
    }
  }
}

async fn cmd_check(version: Option<String>) -> Result<()> {
  let registry = recipes::registry()?;
  let platform = current_platform()?;
  let graph = select_graph(&registry, platform.os.as_str(), version.as_deref())?;
  let timeout = Duration::from_secs(PROBE_TIMEOUT_SECS);

  let mut drifted = 0usize;
  for spec in graph.specs() {
    match check::probe(spec, timeout).await {
      Ok(report) if report.drift => {
        drifted += 1;
        println!(
          "{:<24} {} -> {}",
          report.name,
          report.pinned.yellow(),
          report.latest.green().bold()
        );
      }
      Ok(report) => {
        println!("{:<24} {} (current)", report.name, report.pinned.green());
      }
      Err(ProbeError::NotProbeable { .. }) => {}
      Err(e) => {
        println!("{:<24} {}", spec.name, format!("{e}").red());
      }
    }
  }

  if drifted > 0 {
    println!("\n{drifted} pinned version(s) behind upstream");
  }
  Ok(())
}

fn cmd_graph(version: Option<String>) -> Result<()> {
  let registry = recipes::registry()?;
  let platform = current_platform()?;
  let graph = select_graph(&registry, platform.os.as_str(), version.as_deref())?;

  println!("{} {} ({} steps)", graph.platform(), graph.version(), graph.len());
  for name in graph.topological() {
    let deps = graph.dependencies(name);
    if deps.is_empty() {
      println!("  {name}");
    } else {
      println!("  {name}  <- {}", deps.join(", "));
    }
  }
  Ok(())
}
