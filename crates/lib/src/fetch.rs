//! Source-archive download, verification and extraction.
//!
//! `fetch_source` materializes a spec's source tree: resolve the primary URL,
//! download with a bounded timeout, retry the fallback mirror exactly once on
//! failure, verify the archive checksum, then extract into the step's source
//! directory. The subsystem is idempotent — an archive already present and
//! checksum-valid in the download cache skips the network round trip — and a
//! checksum mismatch discards the fetched bytes rather than caching them.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consts::USER_AGENT;
use crate::spec::Source;

/// Fetch and verification errors. Fatal for the affected step only;
/// dependents observe a skip.
#[derive(Debug, Error)]
pub enum FetchError {
  /// Neither the primary URL nor the fallback produced the archive.
  #[error("source unavailable for {name}: {detail}")]
  SourceUnavailable { name: String, detail: String },

  /// The downloaded archive does not match the pinned checksum.
  #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
  ChecksumMismatch {
    url: String,
    expected: String,
    actual: String,
  },

  /// The archive could not be unpacked (corrupt or unsupported format).
  #[error("failed to extract {archive}: {message}")]
  Extraction { archive: String, message: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Materialize `source` for the step `name`: download (or reuse the cached
/// archive), verify, and extract into `source_dir`.
///
/// Returns the path to the extracted source root.
pub async fn fetch_source(
  name: &str,
  source: &Source,
  downloads: &Path,
  source_dir: &Path,
  timeout: Duration,
) -> Result<PathBuf, FetchError> {
  std::fs::create_dir_all(downloads)?;
  let archive_path = downloads.join(source.archive_name());

  if archive_is_cached(&archive_path, source) {
    info!(step = name, archive = %archive_path.display(), "using cached archive");
  } else {
    download_and_verify(name, source, &archive_path, timeout).await?;
  }

  // Extract onto a clean tree so a re-run never mixes old and new sources.
  if source_dir.exists() {
    std::fs::remove_dir_all(source_dir)?;
  }
  std::fs::create_dir_all(source_dir)?;
  extract_archive(&archive_path, source_dir)?;

  info!(step = name, source = %source_dir.display(), "source ready");
  Ok(source_dir.to_path_buf())
}

/// Whether a checksum-valid archive is already present in the cache.
fn archive_is_cached(archive_path: &Path, source: &Source) -> bool {
  let Ok(bytes) = std::fs::read(archive_path) else {
    return false;
  };
  match source.checksum.verify(&bytes) {
    Ok(()) => true,
    Err(actual) => {
      debug!(
        archive = %archive_path.display(),
        expected = source.checksum.expected(),
        actual = %actual,
        "cached archive fails verification, re-downloading"
      );
      false
    }
  }
}

/// Download from the primary URL, falling back to the mirror exactly once,
/// then verify and persist the archive.
async fn download_and_verify(
  name: &str,
  source: &Source,
  archive_path: &Path,
  timeout: Duration,
) -> Result<(), FetchError> {
  let client = reqwest::Client::builder()
    .user_agent(USER_AGENT)
    .timeout(timeout)
    .build()
    .map_err(|e| FetchError::SourceUnavailable {
      name: name.to_string(),
      detail: e.to_string(),
    })?;

  let primary = source.resolved_url();
  let bytes = match download(&client, &primary).await {
    Ok(bytes) => bytes,
    Err(primary_err) => {
      let Some(fallback) = source.resolved_fallback() else {
        return Err(FetchError::SourceUnavailable {
          name: name.to_string(),
          detail: format!("{primary}: {primary_err}"),
        });
      };
      warn!(step = name, url = %primary, error = %primary_err, "primary download failed, trying fallback");
      download(&client, &fallback)
        .await
        .map_err(|fallback_err| FetchError::SourceUnavailable {
          name: name.to_string(),
          detail: format!("{primary}: {primary_err}; {fallback}: {fallback_err}"),
        })?
    }
  };

  if let Err(actual) = source.checksum.verify(&bytes) {
    // Never leave an unverified archive behind in the cache.
    let _ = std::fs::remove_file(archive_path);
    return Err(FetchError::ChecksumMismatch {
      url: primary,
      expected: source.checksum.expected().to_string(),
      actual,
    });
  }

  std::fs::write(archive_path, &bytes)?;
  info!(step = name, archive = %archive_path.display(), size = bytes.len(), "download complete");
  Ok(())
}

/// One GET attempt; any network error or non-success status is a failure.
async fn download(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, String> {
  debug!(url = %url, "downloading");
  let response = client.get(url).send().await.map_err(|e| e.to_string())?;
  if !response.status().is_success() {
    return Err(format!("HTTP {}", response.status()));
  }
  let bytes = response.bytes().await.map_err(|e| e.to_string())?;
  Ok(bytes.to_vec())
}

/// Unpack an archive into `dest`, stripping the top-level component.
///
/// Supports `.tar.gz`/`.tgz`, `.tar.xz`, `.tar.bz2`, and plain `.tar`.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<(), FetchError> {
  let file_name = archive_path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();

  let file = File::open(archive_path)?;
  let reader = BufReader::new(file);

  if file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz") {
    unpack_tar(flate2::read::GzDecoder::new(reader), archive_path, dest)
  } else if file_name.ends_with(".tar.xz") {
    unpack_tar(xz2::read::XzDecoder::new(reader), archive_path, dest)
  } else if file_name.ends_with(".tar.bz2") {
    unpack_tar(bzip2::read::BzDecoder::new(reader), archive_path, dest)
  } else if file_name.ends_with(".tar") {
    unpack_tar(reader, archive_path, dest)
  } else {
    Err(FetchError::Extraction {
      archive: file_name,
      message: "unsupported archive format".to_string(),
    })
  }
}

fn unpack_tar<R: Read>(reader: R, archive_path: &Path, dest: &Path) -> Result<(), FetchError> {
  let describe = |e: &dyn std::fmt::Display| FetchError::Extraction {
    archive: archive_path.display().to_string(),
    message: e.to_string(),
  };

  let mut archive = Archive::new(reader);
  for entry in archive.entries().map_err(|e| describe(&e))? {
    let mut entry = entry.map_err(|e| describe(&e))?;
    let path = entry.path().map_err(|e| describe(&e))?;

    // Strip the leading component (e.g. zlib-1.3.1/) so the source root is
    // the destination itself.
    let stripped: PathBuf = path.components().skip(1).collect();
    if stripped.as_os_str().is_empty() {
      continue;
    }

    let dest_path = dest.join(&stripped);
    if let Some(parent) = dest_path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    entry.unpack(&dest_path).map_err(|e| describe(&e))?;
  }
  Ok(())
}
