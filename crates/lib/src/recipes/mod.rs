//! Statically declared build graphs for the supported platforms.
//!
//! Recipes are data: pinned versions, checksums, source locations and the
//! configure/compile/install command lines for each native component. The
//! pipeline consumes them through the same `BuildSpec` interface as any
//! external recipe collection.

pub mod linux;

use crate::graph::{GraphError, GraphRegistry};

/// Registry holding every bundled graph, one entry per platform/version line.
pub fn registry() -> Result<GraphRegistry, GraphError> {
  let mut registry = GraphRegistry::new();
  linux::register(&mut registry)?;
  Ok(registry)
}
