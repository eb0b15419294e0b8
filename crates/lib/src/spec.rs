//! Declarative build-step descriptions.
//!
//! A `BuildSpec` describes one buildable native component: where its source
//! archive comes from, which steps must finish first, and the callback that
//! drives its configure/compile/install phase. Specs are immutable once
//! registered in a graph; the only sanctioned mutation is graph cloning,
//! which replaces the terminal runtime spec's version pin.

use std::collections::BTreeMap;

use crate::check::VersionProbe;
use crate::dirs::Dirs;
use crate::executor::StepError;
use crate::hash::Checksum;
use crate::log::StepLog;
use crate::patch::Patch;

/// Process environment for one step, composed by the environment builder.
pub type EnvMap = BTreeMap<String, String>;

/// Build callback: invoked once the step's dependencies are satisfied and its
/// source is verified and extracted. Responsible for running the native
/// toolchain; every subprocess must write into the step's log and surface a
/// non-zero exit as an error.
pub type BuildFn = fn(&EnvMap, &Dirs, &mut StepLog) -> Result<(), StepError>;

/// Environment-population callback: extends (never replaces) the base
/// environment in place.
pub type EnvFn = fn(&mut EnvMap, &Dirs);

/// Where a step's source archive comes from.
#[derive(Debug, Clone)]
pub struct Source {
  /// Primary URL template; `{version}` is substituted before download.
  pub url: String,
  /// Mirror tried exactly once if the primary fails.
  pub fallback_url: Option<String>,
  /// Pinned upstream version.
  pub version: String,
  /// Expected archive checksum.
  pub checksum: Checksum,
}

impl Source {
  /// The primary URL with the version pin substituted.
  pub fn resolved_url(&self) -> String {
    self.url.replace("{version}", &self.version)
  }

  /// The fallback URL with the version pin substituted.
  pub fn resolved_fallback(&self) -> Option<String> {
    self
      .fallback_url
      .as_ref()
      .map(|url| url.replace("{version}", &self.version))
  }

  /// Archive file name under the download cache, taken from the resolved URL.
  pub fn archive_name(&self) -> String {
    let url = self.resolved_url();
    url
      .rsplit('/')
      .next()
      .filter(|name| !name.is_empty())
      .unwrap_or("source-archive")
      .to_string()
  }
}

/// Declarative description of one buildable native component.
#[derive(Debug, Clone)]
pub struct BuildSpec {
  /// Step identity within one graph.
  pub name: String,
  /// Source archive, if the step builds from one. Pure aggregation steps
  /// (e.g. finalization) carry no source.
  pub source: Option<Source>,
  /// Names of steps that must reach Done before this one starts.
  pub depends: Vec<String>,
  /// Configure/compile/install driver.
  pub build: BuildFn,
  /// Optional step-specific extension of the base environment.
  pub env: Option<EnvFn>,
  /// Optional source patch, applied before the build callback runs.
  pub patch: Option<Patch>,
  /// Optional upstream version probe for drift reporting.
  pub probe: Option<VersionProbe>,
}

impl BuildSpec {
  pub fn new(name: impl Into<String>, build: BuildFn) -> Self {
    Self {
      name: name.into(),
      source: None,
      depends: Vec::new(),
      build,
      env: None,
      patch: None,
      probe: None,
    }
  }

  pub fn with_source(mut self, source: Source) -> Self {
    self.source = Some(source);
    self
  }

  pub fn with_depends(mut self, depends: &[&str]) -> Self {
    self.depends = depends.iter().map(|d| d.to_string()).collect();
    self
  }

  pub fn with_env(mut self, env: EnvFn) -> Self {
    self.env = Some(env);
    self
  }

  pub fn with_patch(mut self, patch: Patch) -> Self {
    self.patch = Some(patch);
    self
  }

  pub fn with_probe(mut self, probe: VersionProbe) -> Self {
    self.probe = Some(probe);
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn noop(_env: &EnvMap, _dirs: &Dirs, _log: &mut StepLog) -> Result<(), StepError> {
    Ok(())
  }

  fn source(url: &str) -> Source {
    Source {
      url: url.to_string(),
      fallback_url: None,
      version: "1.3.1".to_string(),
      checksum: Checksum::Md5("9855b6d802d7fe5b7bd5b196a2271655".to_string()),
    }
  }

  #[test]
  fn url_template_substitutes_version() {
    let source = source("https://zlib.net/fossils/zlib-{version}.tar.gz");
    assert_eq!(source.resolved_url(), "https://zlib.net/fossils/zlib-1.3.1.tar.gz");
  }

  #[test]
  fn archive_name_is_last_url_component() {
    let source = source("https://zlib.net/fossils/zlib-{version}.tar.gz");
    assert_eq!(source.archive_name(), "zlib-1.3.1.tar.gz");
  }

  #[test]
  fn archive_name_falls_back_for_bare_host() {
    let source = source("https://zlib.net/");
    assert_eq!(source.archive_name(), "source-archive");
  }

  #[test]
  fn builder_methods_accumulate() {
    let spec = BuildSpec::new("readline", noop).with_depends(&["ncurses"]);
    assert_eq!(spec.name, "readline");
    assert_eq!(spec.depends, vec!["ncurses".to_string()]);
    assert!(spec.source.is_none());
  }
}
