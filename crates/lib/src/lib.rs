//! relpy-lib: core pipeline for building relocatable Python runtimes
//!
//! This crate provides the dependency-ordered native build pipeline:
//! - `spec`: declarative build-step descriptions (`BuildSpec`)
//! - `graph`: validated dependency graphs and the graph registry
//! - `env`: per-step cross-compilation environment composition
//! - `fetch`: source-archive download, verification and extraction
//! - `executor`: wave-parallel execution of a graph with per-step logs
//! - `check`: reporting-only version-drift probes against upstreams
//! - `recipes`: the statically declared graphs for the supported platforms

pub mod check;
pub mod cmd;
pub mod consts;
pub mod dirs;
pub mod env;
pub mod executor;
pub mod fetch;
pub mod graph;
pub mod hash;
pub mod log;
pub mod patch;
pub mod recipes;
pub mod spec;

pub use dirs::{Dirs, WorkLayout};
pub use executor::{RunConfig, RunSummary, StepResult, StepStatus, run};
pub use graph::{BuildGraph, GraphBuilder, GraphError, GraphRegistry};
pub use spec::{BuildSpec, EnvMap, Source};
