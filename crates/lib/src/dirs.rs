//! Work-tree layout and per-step working directories.
//!
//! One `WorkLayout` describes the on-disk tree for a single host triple:
//!
//! ```text
//! <root>/download/            shared archive cache (all triples)
//! <root>/toolchain/           cross-compiler root (read-only during builds)
//! <root>/build/<triple>/      install prefix shared by all steps
//! <root>/src/<triple>/<step>/ per-step extracted source tree
//! <root>/tmp/<triple>/<step>/ per-step scratch build tree
//! <root>/logs/<triple>/       per-step log files
//! ```
//!
//! Source and scratch trees are keyed by step name so concurrently running
//! steps never share one; the prefix is the only shared writable path.

use std::io;
use std::path::{Path, PathBuf};

use relpy_platform::Triple;

/// The working directories owned by one step for the duration of its run.
#[derive(Debug, Clone)]
pub struct Dirs {
  /// Work-tree root.
  pub root: PathBuf,
  /// Shared download cache.
  pub downloads: PathBuf,
  /// This step's extracted source tree.
  pub source: PathBuf,
  /// This step's scratch build tree.
  pub tmpbuild: PathBuf,
  /// Shared install prefix.
  pub prefix: PathBuf,
  /// Cross-toolchain root.
  pub toolchain: PathBuf,
  /// Log directory for this triple.
  pub logs: PathBuf,
}

/// Work-tree layout for one host triple.
#[derive(Debug, Clone)]
pub struct WorkLayout {
  root: PathBuf,
  triple: Triple,
}

impl WorkLayout {
  pub fn new(root: impl Into<PathBuf>, triple: Triple) -> Self {
    Self {
      root: root.into(),
      triple,
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn triple(&self) -> &Triple {
    &self.triple
  }

  /// Shared install prefix for this triple.
  pub fn prefix(&self) -> PathBuf {
    self.root.join("build").join(self.triple.as_str())
  }

  /// Cross-toolchain root. Read-only while builds are running.
  pub fn toolchain(&self) -> PathBuf {
    self.root.join("toolchain")
  }

  /// Shared archive cache.
  pub fn downloads(&self) -> PathBuf {
    self.root.join("download")
  }

  /// Per-step log directory.
  pub fn logs(&self) -> PathBuf {
    self.root.join("logs").join(self.triple.as_str())
  }

  /// The directory set owned by `step` while it executes.
  pub fn dirs_for(&self, step: &str) -> Dirs {
    Dirs {
      root: self.root.clone(),
      downloads: self.downloads(),
      source: self.root.join("src").join(self.triple.as_str()).join(step),
      tmpbuild: self.root.join("tmp").join(self.triple.as_str()).join(step),
      prefix: self.prefix(),
      toolchain: self.toolchain(),
      logs: self.logs(),
    }
  }

  /// Create the shared directories. Per-step trees are created lazily by the
  /// step that owns them.
  pub fn ensure(&self) -> io::Result<()> {
    std::fs::create_dir_all(self.downloads())?;
    std::fs::create_dir_all(self.prefix())?;
    std::fs::create_dir_all(self.logs())?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use relpy_platform::{Arch, Os};

  fn layout() -> WorkLayout {
    WorkLayout::new("/work", Triple::new(Arch::X86_64, Os::Linux))
  }

  #[test]
  fn per_step_trees_are_disjoint() {
    let layout = layout();
    let a = layout.dirs_for("openssl");
    let b = layout.dirs_for("zlib");

    assert_ne!(a.source, b.source);
    assert_ne!(a.tmpbuild, b.tmpbuild);
    // shared paths are identical
    assert_eq!(a.prefix, b.prefix);
    assert_eq!(a.downloads, b.downloads);
  }

  #[test]
  fn prefix_is_keyed_by_triple() {
    let layout = layout();
    assert_eq!(layout.prefix(), PathBuf::from("/work/build/x86_64-linux-gnu"));
  }

  #[test]
  fn ensure_creates_shared_directories() {
    let temp = tempfile::tempdir().unwrap();
    let layout = WorkLayout::new(temp.path(), Triple::new(Arch::X86_64, Os::Linux));
    layout.ensure().unwrap();

    assert!(layout.downloads().is_dir());
    assert!(layout.prefix().is_dir());
    assert!(layout.logs().is_dir());
  }
}
