//! Reporting-only version-drift probes.
//!
//! `probe` fetches a spec's upstream release listing, extracts anchor hrefs,
//! applies the spec's detector to each candidate, and reports whether the
//! newest published version differs from the pinned one. Probes never mutate
//! a spec and never trigger a rebuild.

use std::cmp::Ordering;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::consts::USER_AGENT;
use crate::spec::BuildSpec;

/// Detector applied to each href found on the check page; returns the
/// version string the href names, if any.
pub type DetectFn = fn(&str) -> Option<String>;

/// Where and how to look for the latest published version of a dependency.
#[derive(Debug, Clone)]
pub struct VersionProbe {
  /// Upstream release listing (directory index or releases page).
  pub check_url: String,
  /// Pluggable version detector.
  pub detect: DetectFn,
}

/// Outcome of probing one spec.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
  pub name: String,
  pub pinned: String,
  pub latest: String,
  pub drift: bool,
}

/// Probe errors. Reporting-only: never fatal to a build run.
#[derive(Debug, Error)]
pub enum ProbeError {
  /// The check URL could not be fetched.
  #[error("check url unreachable: {url}: {message}")]
  Unavailable { url: String, message: String },

  /// The detector found no version token in the fetched content.
  #[error("no version found at {url}")]
  NoVersionFound { url: String },

  /// The spec declares no probe or carries no version pin.
  #[error("step '{name}' has no version probe")]
  NotProbeable { name: String },
}

/// Probe upstream for `spec` and compare against its pinned version.
pub async fn probe(spec: &BuildSpec, timeout: Duration) -> Result<DriftReport, ProbeError> {
  let (probe, source) = match (&spec.probe, &spec.source) {
    (Some(probe), Some(source)) => (probe, source),
    _ => {
      return Err(ProbeError::NotProbeable {
        name: spec.name.clone(),
      });
    }
  };

  let client = reqwest::Client::builder()
    .user_agent(USER_AGENT)
    .timeout(timeout)
    .build()
    .map_err(|e| ProbeError::Unavailable {
      url: probe.check_url.clone(),
      message: e.to_string(),
    })?;

  let response = client
    .get(&probe.check_url)
    .send()
    .await
    .and_then(|r| r.error_for_status())
    .map_err(|e| ProbeError::Unavailable {
      url: probe.check_url.clone(),
      message: e.to_string(),
    })?;

  let body = response.text().await.map_err(|e| ProbeError::Unavailable {
    url: probe.check_url.clone(),
    message: e.to_string(),
  })?;

  let latest = latest_version(&body, probe.detect).ok_or_else(|| ProbeError::NoVersionFound {
    url: probe.check_url.clone(),
  })?;

  debug!(step = %spec.name, pinned = %source.version, latest = %latest, "probed upstream");
  let drift = compare_versions(&latest, &source.version) != Ordering::Equal;
  Ok(DriftReport {
    name: spec.name.clone(),
    pinned: source.version.clone(),
    latest,
    drift,
  })
}

/// The newest version named by any href in `html`, per `detect`.
pub fn latest_version(html: &str, detect: DetectFn) -> Option<String> {
  extract_hrefs(html)
    .into_iter()
    .filter_map(|href| detect(&href))
    .max_by(|a, b| compare_versions(a, b))
}

/// Extract anchor href values from an HTML page.
pub fn extract_hrefs(html: &str) -> Vec<String> {
  static HREF: OnceLock<Regex> = OnceLock::new();
  let re = HREF.get_or_init(|| Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).expect("static regex compiles"));
  re.captures_iter(html).map(|c| c[1].to_string()).collect()
}

/// Compare dotted version strings numerically, component by component.
///
/// Handles the mix of schemes the upstreams use: "1.0.8", "8.2", "1.21",
/// and sqlite's "3450200". Non-numeric suffixes are compared as a final
/// string component.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
  let key = |v: &str| -> (Vec<u64>, String) {
    let mut nums = Vec::new();
    let mut rest = String::new();
    for part in v.split('.') {
      let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
      match digits.parse::<u64>() {
        Ok(n) => {
          nums.push(n);
          if digits.len() < part.len() {
            rest = part[digits.len()..].to_string();
          }
        }
        Err(_) => rest = part.to_string(),
      }
    }
    (nums, rest)
  };
  key(a).cmp(&key(b))
}

/// Detectors for the upstream release pages used by the bundled recipes.
pub mod detect {
  /// GNU-mirror style tarball links: `name-<version>.tar.gz`.
  pub fn tarball_version(href: &str) -> Option<String> {
    if !href.ends_with(".tar.gz") {
      return None;
    }
    let (_, rest) = href.split_once('-')?;
    let version = rest.strip_suffix(".tar.gz")?;
    if version == "latest" {
      return None;
    }
    Some(version.to_string())
  }

  /// GitHub releases pages: `.../releases/tag/v<version>`.
  pub fn github_version(href: &str) -> Option<String> {
    if !href.contains("/tag/") {
      return None;
    }
    let (_, version) = href.rsplit_once("/v")?;
    Some(version.to_string())
  }

  /// sqlite.org release log links: `releaselog/3_45_2.html` -> `3450200`.
  pub fn sqlite_version(href: &str) -> Option<String> {
    if !href.contains("releaselog") {
      return None;
    }
    let page = href.split('/').nth(1)?.strip_suffix(".html")?;
    let parts: Vec<u64> = page.split('_').map(|p| p.parse().ok()).collect::<Option<_>>()?;
    match parts.as_slice() {
      [major, minor, patch] => Some(format!("{major}{minor:02}{patch:02}00")),
      _ => None,
    }
  }

  /// kerberos.org dist directories: `1.21/`.
  pub fn krb_version(href: &str) -> Option<String> {
    let dir = href.strip_suffix('/')?;
    let mut parts = dir.split('.');
    let major = parts.next()?;
    let minor = parts.next()?;
    if parts.next().is_some() {
      return None;
    }
    if major.len() == 1
      && minor.len() == 2
      && major.chars().all(|c| c.is_ascii_digit())
      && minor.chars().all(|c| c.is_ascii_digit())
    {
      Some(dir.to_string())
    } else {
      None
    }
  }

  /// python.org ftp directories: `3.12.0/`.
  pub fn python_version(href: &str) -> Option<String> {
    let dir = href.strip_suffix('/')?;
    let parts: Vec<&str> = dir.split('.').collect();
    if parts.len() >= 2 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
      Some(dir.to_string())
    } else {
      None
    }
  }

  /// sourceforge download links: `.../libuuid-1.0.3.tar.gz/download`.
  pub fn uuid_version(href: &str) -> Option<String> {
    if !href.contains("download") || href.contains("latest") {
      return None;
    }
    let stem = href.strip_suffix(".tar.gz/download")?;
    let name = stem.rsplit('/').next()?;
    Some(name.strip_prefix("libuuid-")?.to_string())
  }
}
