//! Dependency graphs of build steps and the graph registry.
//!
//! A `GraphBuilder` collects `BuildSpec`s for one platform/version line and
//! validates the induced DAG exactly once, at `finish()`: duplicate names are
//! rejected on `add`, unknown dependency names and cycles at finalization.
//! Validation never runs per execution, so configuration errors surface
//! before any network or compiler activity.
//!
//! The finalized `BuildGraph` exposes a topological order and parallel
//! execution waves (groups of steps whose dependencies all live in earlier
//! waves). Graphs are cloned per runtime release: a clone shares every spec
//! by reference except the terminal runtime spec, which gets the overridden
//! version pin.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::check::compare_versions;
use crate::hash::Checksum;
use crate::spec::{BuildSpec, EnvFn};

/// Graph construction errors. All of these are fatal and reported before any
/// execution begins.
#[derive(Debug, Error)]
pub enum GraphError {
  /// A spec with this name is already registered in the graph.
  #[error("duplicate step name: {0}")]
  DuplicateName(String),

  /// A `depends` entry names a spec that was never registered.
  #[error("step '{step}' depends on unknown step '{dependency}'")]
  UnknownDependency { step: String, dependency: String },

  /// The induced dependency graph contains a cycle.
  #[error("dependency cycle detected in graph '{graph}'")]
  CyclicDependency { graph: String },

  /// The declared terminal runtime spec was never registered.
  #[error("runtime step '{runtime}' not registered in graph '{graph}'")]
  UnknownRuntime { graph: String, runtime: String },

  /// A graph for this platform/version pair is already registered.
  #[error("graph already registered for {platform} {version}")]
  DuplicateGraph { platform: String, version: String },
}

/// Builder for one platform/version line.
pub struct GraphBuilder {
  platform: String,
  runtime: String,
  version: String,
  populate_env: Option<EnvFn>,
  specs: Vec<Arc<BuildSpec>>,
  names: HashSet<String>,
}

impl GraphBuilder {
  /// Start a graph for `platform` whose terminal runtime spec is named
  /// `runtime` and pinned at `version`.
  pub fn new(platform: impl Into<String>, runtime: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      platform: platform.into(),
      runtime: runtime.into(),
      version: version.into(),
      populate_env: None,
      specs: Vec::new(),
      names: HashSet::new(),
    }
  }

  /// Set the graph-wide environment contribution, applied to every step after
  /// the base environment is composed.
  pub fn populate_env(mut self, env: EnvFn) -> Self {
    self.populate_env = Some(env);
    self
  }

  /// Register a spec. Fails eagerly on a duplicate name.
  pub fn add(&mut self, spec: BuildSpec) -> Result<(), GraphError> {
    if !self.names.insert(spec.name.clone()) {
      return Err(GraphError::DuplicateName(spec.name));
    }
    self.specs.push(Arc::new(spec));
    Ok(())
  }

  /// Finalize the graph, running the one-time topological validation.
  pub fn finish(self) -> Result<BuildGraph, GraphError> {
    if !self.names.contains(&self.runtime) {
      return Err(GraphError::UnknownRuntime {
        graph: self.platform,
        runtime: self.runtime,
      });
    }

    let mut dag = DiGraph::new();
    let mut nodes = HashMap::new();
    for spec in &self.specs {
      let idx = dag.add_node(spec.name.clone());
      nodes.insert(spec.name.clone(), idx);
    }

    // Edges run from dependency to dependent.
    for spec in &self.specs {
      let dependent = nodes[&spec.name];
      for dep in &spec.depends {
        let Some(&dep_idx) = nodes.get(dep) else {
          return Err(GraphError::UnknownDependency {
            step: spec.name.clone(),
            dependency: dep.clone(),
          });
        };
        dag.add_edge(dep_idx, dependent, ());
      }
    }

    let sorted = toposort(&dag, None).map_err(|_| GraphError::CyclicDependency {
      graph: self.platform.clone(),
    })?;
    let topological = sorted.into_iter().map(|idx| dag[idx].clone()).collect();

    Ok(BuildGraph {
      platform: self.platform,
      runtime: self.runtime,
      version: self.version,
      populate_env: self.populate_env,
      specs: self.specs.iter().map(|s| (s.name.clone(), Arc::clone(s))).collect(),
      topological,
      dag,
      nodes,
    })
  }
}

/// A finalized, validated DAG of build specs for one platform/version line.
#[derive(Clone)]
pub struct BuildGraph {
  platform: String,
  runtime: String,
  version: String,
  populate_env: Option<EnvFn>,
  specs: HashMap<String, Arc<BuildSpec>>,
  topological: Vec<String>,
  dag: DiGraph<String, ()>,
  nodes: HashMap<String, NodeIndex>,
}

impl BuildGraph {
  pub fn platform(&self) -> &str {
    &self.platform
  }

  /// The runtime release this graph targets (e.g. "3.10.14").
  pub fn version(&self) -> &str {
    &self.version
  }

  /// Name of the terminal runtime spec.
  pub fn runtime(&self) -> &str {
    &self.runtime
  }

  pub fn populate_env(&self) -> Option<EnvFn> {
    self.populate_env
  }

  pub fn get(&self, name: &str) -> Option<&Arc<BuildSpec>> {
    self.specs.get(name)
  }

  pub fn len(&self) -> usize {
    self.specs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.specs.is_empty()
  }

  /// All specs, in topological order.
  pub fn specs(&self) -> impl Iterator<Item = &Arc<BuildSpec>> {
    self.topological.iter().filter_map(|name| self.specs.get(name))
  }

  /// Direct dependencies of `name`.
  pub fn dependencies(&self, name: &str) -> Vec<String> {
    let Some(&idx) = self.nodes.get(name) else {
      return Vec::new();
    };
    self
      .dag
      .neighbors_directed(idx, Direction::Incoming)
      .map(|dep| self.dag[dep].clone())
      .collect()
  }

  /// Step names in an order where dependencies come before dependents.
  pub fn topological(&self) -> &[String] {
    &self.topological
  }

  /// Steps organized into parallel execution waves.
  ///
  /// Each wave contains steps whose dependencies are all in previous waves;
  /// members of one wave have no dependency relation and may run in any
  /// order or concurrently.
  pub fn waves(&self) -> Vec<Vec<String>> {
    // Kahn's algorithm variant computing levels. The graph was validated
    // acyclic at finish(), so every node receives a level.
    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in self.dag.node_indices() {
      in_degree.insert(idx, self.dag.neighbors_directed(idx, Direction::Incoming).count());
    }

    let mut node_level: HashMap<NodeIndex, usize> = HashMap::new();
    let mut remaining: HashSet<NodeIndex> = self.dag.node_indices().collect();
    let mut current_level = 0;

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|&&idx| in_degree[&idx] == 0).copied().collect();
      debug_assert!(!ready.is_empty(), "validated graph cannot stall");

      for &idx in &ready {
        node_level.insert(idx, current_level);
        remaining.remove(&idx);
        for neighbor in self.dag.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }
      current_level += 1;
    }

    let max_level = node_level.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<String>> = vec![Vec::new(); max_level + 1];
    for idx in self.dag.node_indices() {
      if let Some(&level) = node_level.get(&idx) {
        waves[level].push(self.dag[idx].clone());
      }
    }
    waves.retain(|w| !w.is_empty());
    waves
  }

  /// Clone this graph for a different runtime release.
  ///
  /// Every spec is shared by reference except the terminal runtime spec,
  /// which is re-pinned to `version`/`checksum`. The original graph is left
  /// untouched.
  pub fn clone_with(&self, version: &str, checksum: Checksum) -> BuildGraph {
    let mut specs = self.specs.clone();
    if let Some(runtime_spec) = specs.get(&self.runtime) {
      let mut repinned = (**runtime_spec).clone();
      if let Some(source) = repinned.source.as_mut() {
        source.version = version.to_string();
        source.checksum = checksum;
      }
      specs.insert(self.runtime.clone(), Arc::new(repinned));
    }

    BuildGraph {
      platform: self.platform.clone(),
      runtime: self.runtime.clone(),
      version: version.to_string(),
      populate_env: self.populate_env,
      specs,
      topological: self.topological.clone(),
      dag: self.dag.clone(),
      nodes: self.nodes.clone(),
    }
  }
}

/// Explicit registry of finalized graphs, keyed by platform and runtime
/// version. Owned by one pipeline invocation; never ambient state.
#[derive(Default)]
pub struct GraphRegistry {
  graphs: Vec<Arc<BuildGraph>>,
}

impl GraphRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a finalized graph as a sibling of any existing version lines.
  pub fn add(&mut self, graph: BuildGraph) -> Result<(), GraphError> {
    if self.get(graph.platform(), graph.version()).is_some() {
      return Err(GraphError::DuplicateGraph {
        platform: graph.platform().to_string(),
        version: graph.version().to_string(),
      });
    }
    self.graphs.push(Arc::new(graph));
    Ok(())
  }

  pub fn get(&self, platform: &str, version: &str) -> Option<&Arc<BuildGraph>> {
    self
      .graphs
      .iter()
      .find(|g| g.platform() == platform && g.version() == version)
  }

  /// The newest registered version line for `platform`.
  pub fn latest(&self, platform: &str) -> Option<&Arc<BuildGraph>> {
    self
      .graphs
      .iter()
      .filter(|g| g.platform() == platform)
      .max_by(|a, b| compare_versions(a.version(), b.version()))
  }

  /// Registered runtime versions for `platform`, in registration order.
  pub fn versions(&self, platform: &str) -> Vec<&str> {
    self
      .graphs
      .iter()
      .filter(|g| g.platform() == platform)
      .map(|g| g.version())
      .collect()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<BuildGraph>> {
    self.graphs.iter()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dirs::Dirs;
  use crate::executor::StepError;
  use crate::log::StepLog;
  use crate::spec::{EnvMap, Source};

  fn noop(_env: &EnvMap, _dirs: &Dirs, _log: &mut StepLog) -> Result<(), StepError> {
    Ok(())
  }

  fn spec(name: &str, depends: &[&str]) -> BuildSpec {
    BuildSpec::new(name, noop).with_depends(depends)
  }

  fn runtime_source(version: &str, md5: &str) -> Source {
    Source {
      url: "https://www.python.org/ftp/python/{version}/Python-{version}.tar.xz".to_string(),
      fallback_url: None,
      version: version.to_string(),
      checksum: Checksum::Md5(md5.to_string()),
    }
  }

  fn linux_like_graph() -> BuildGraph {
    let mut builder = GraphBuilder::new("linux", "python", "3.10.14");
    builder.add(spec("openssl", &[])).unwrap();
    builder.add(spec("libxcrypt", &[])).unwrap();
    builder
      .add(spec("python", &["openssl", "libxcrypt"]).with_source(runtime_source("3.10.14", "05148354ce821ba7369e5b7958435400")))
      .unwrap();
    builder.finish().unwrap()
  }

  #[test]
  fn duplicate_name_is_rejected_on_add() {
    let mut builder = GraphBuilder::new("linux", "python", "3.10.14");
    builder.add(spec("openssl", &[])).unwrap();
    let err = builder.add(spec("openssl", &[])).unwrap_err();
    assert!(matches!(err, GraphError::DuplicateName(name) if name == "openssl"));
  }

  #[test]
  fn unknown_dependency_is_rejected_at_finish() {
    let mut builder = GraphBuilder::new("linux", "python", "3.10.14");
    builder.add(spec("python", &["openssl"])).unwrap();
    let err = builder.finish().unwrap_err();
    assert!(
      matches!(err, GraphError::UnknownDependency { step, dependency } if step == "python" && dependency == "openssl")
    );
  }

  #[test]
  fn cycle_is_rejected_at_finish() {
    let mut builder = GraphBuilder::new("linux", "a", "1");
    builder.add(spec("a", &["b"])).unwrap();
    builder.add(spec("b", &["a"])).unwrap();
    let err = builder.finish().unwrap_err();
    assert!(matches!(err, GraphError::CyclicDependency { .. }));
  }

  #[test]
  fn missing_runtime_is_rejected_at_finish() {
    let mut builder = GraphBuilder::new("linux", "python", "3.10.14");
    builder.add(spec("openssl", &[])).unwrap();
    let err = builder.finish().unwrap_err();
    assert!(matches!(err, GraphError::UnknownRuntime { runtime, .. } if runtime == "python"));
  }

  #[test]
  fn topological_order_respects_dependencies() {
    let graph = linux_like_graph();
    let topo = graph.topological();
    let pos = |name: &str| topo.iter().position(|n| n == name).unwrap();
    assert!(pos("openssl") < pos("python"));
    assert!(pos("libxcrypt") < pos("python"));
  }

  #[test]
  fn independent_steps_share_a_wave() {
    let graph = linux_like_graph();
    let waves = graph.waves();
    assert_eq!(waves.len(), 2);
    assert_eq!(waves[0].len(), 2);
    assert!(waves[0].contains(&"openssl".to_string()));
    assert!(waves[0].contains(&"libxcrypt".to_string()));
    assert_eq!(waves[1], vec!["python".to_string()]);
  }

  #[test]
  fn diamond_produces_three_waves() {
    //     a
    //    / \
    //   b   c
    //    \ /
    //     d
    let mut builder = GraphBuilder::new("linux", "d", "1");
    builder.add(spec("a", &[])).unwrap();
    builder.add(spec("b", &["a"])).unwrap();
    builder.add(spec("c", &["a"])).unwrap();
    builder.add(spec("d", &["b", "c"])).unwrap();
    let graph = builder.finish().unwrap();

    let waves = graph.waves();
    assert_eq!(waves.len(), 3);
    assert_eq!(waves[0], vec!["a".to_string()]);
    assert_eq!(waves[1].len(), 2);
    assert_eq!(waves[2], vec!["d".to_string()]);
  }

  #[test]
  fn dependencies_query_returns_direct_edges() {
    let graph = linux_like_graph();
    let mut deps = graph.dependencies("python");
    deps.sort();
    assert_eq!(deps, vec!["libxcrypt".to_string(), "openssl".to_string()]);
    assert!(graph.dependencies("openssl").is_empty());
  }

  #[test]
  fn clone_overrides_only_the_runtime_pin() {
    let graph = linux_like_graph();
    let clone = graph.clone_with("3.11.8", Checksum::Md5("b353b8433e560e1af2b130f56dfbd973".to_string()));

    // clone reflects the override
    assert_eq!(clone.version(), "3.11.8");
    let cloned_runtime = clone.get("python").unwrap();
    assert_eq!(cloned_runtime.source.as_ref().unwrap().version, "3.11.8");

    // original is untouched
    assert_eq!(graph.version(), "3.10.14");
    let original_runtime = graph.get("python").unwrap();
    assert_eq!(original_runtime.source.as_ref().unwrap().version, "3.10.14");

    // non-runtime specs are shared by reference
    assert!(Arc::ptr_eq(graph.get("openssl").unwrap(), clone.get("openssl").unwrap()));
  }

  #[test]
  fn registry_rejects_duplicate_version_lines() {
    let graph = linux_like_graph();
    let clone = graph.clone_with("3.11.8", Checksum::Md5("b353b8433e560e1af2b130f56dfbd973".to_string()));

    let mut registry = GraphRegistry::new();
    registry.add(graph).unwrap();
    registry.add(clone).unwrap();

    let another = linux_like_graph();
    let err = registry.add(another).unwrap_err();
    assert!(matches!(err, GraphError::DuplicateGraph { version, .. } if version == "3.10.14"));
  }

  #[test]
  fn registry_latest_orders_versions_numerically() {
    let graph = linux_like_graph();
    let newer = graph.clone_with("3.12.0", Checksum::Md5("f6f4616584b23254d165f4db90c247d6".to_string()));

    let mut registry = GraphRegistry::new();
    registry.add(newer).unwrap();
    registry.add(graph).unwrap();

    assert_eq!(registry.latest("linux").unwrap().version(), "3.12.0");
    assert_eq!(registry.versions("linux"), vec!["3.12.0", "3.10.14"]);
    assert!(registry.latest("windows").is_none());
  }
}
